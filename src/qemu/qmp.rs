use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

/// QMP commands are local socket round trips; anything slower means QEMU is wedged.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// QOM container holding devices added without an explicit id.
pub const PERIPHERAL_ANON: &str = "/machine/peripheral-anon";

/// Entry returned by `qom-list`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QomProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Entry returned by `query-block`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BlockDevice {
    pub device: String,
    /// QOM path of the frontend device
    #[serde(rename = "qdev", default)]
    pub device_path: String,
    #[serde(default)]
    pub removable: bool,
}

/// Line-oriented JSON client for QEMU's machine protocol.
pub struct QmpClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    request_timeout: Duration,
}

impl QmpClient {
    /// Connect, consume the greeting, and leave capabilities negotiation mode.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("connecting to QMP socket {}", path.display()))?;
        let (read, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read).lines(),
            writer,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        };

        let greeting = client.read_message().await.context("reading QMP greeting")?;
        if greeting.get("QMP").is_none() {
            bail!("unexpected QMP greeting: {}", greeting);
        }
        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    async fn read_message(&mut self) -> Result<Value> {
        let line = self
            .lines
            .next_line()
            .await
            .context("reading from QMP socket")?
            .ok_or_else(|| anyhow!("QMP socket closed"))?;
        serde_json::from_str(&line).with_context(|| format!("parsing QMP message {:?}", line))
    }

    /// Run one command and return its `return` payload.
    pub async fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let mut req = json!({ "execute": command });
        if let Some(args) = arguments {
            req["arguments"] = args;
        }
        let mut data = serde_json::to_vec(&req)?;
        data.push(b'\n');

        let timeout = self.request_timeout;
        tokio::time::timeout(timeout, self.round_trip(command, &data))
            .await
            .map_err(|_| anyhow!("QMP {} timed out after {:?}", command, timeout))?
    }

    async fn round_trip(&mut self, command: &str, data: &[u8]) -> Result<Value> {
        self.writer
            .write_all(data)
            .await
            .with_context(|| format!("sending QMP {}", command))?;
        loop {
            let msg = self.read_message().await?;
            if let Some(event) = msg.get("event") {
                debug!(target: "qemu", %event, "QMP event");
                continue;
            }
            if let Some(err) = msg.get("error") {
                bail!("QMP {} failed: {}", command, err);
            }
            if let Some(ret) = msg.get("return") {
                return Ok(ret.clone());
            }
            bail!("unexpected QMP reply to {}: {}", command, msg);
        }
    }

    pub async fn list_devices(&mut self) -> Result<Vec<QomProperty>> {
        let ret = self
            .execute("qom-list", Some(json!({ "path": PERIPHERAL_ANON })))
            .await?;
        serde_json::from_value(ret).context("decoding qom-list reply")
    }

    pub async fn list_block_devices(&mut self) -> Result<Vec<BlockDevice>> {
        let ret = self.execute("query-block", None).await?;
        serde_json::from_value(ret).context("decoding query-block reply")
    }

    /// Set `bootindex` on a device; -1 removes it from the boot order.
    pub async fn set_boot_index(&mut self, device: &str, index: i64) -> Result<()> {
        self.execute(
            "qom-set",
            Some(json!({ "path": device, "property": "bootindex", "value": index })),
        )
        .await
        .with_context(|| format!("setting bootindex {} on {}", index, device))?;
        Ok(())
    }
}

/// bootindex changes that make the installed disk boot next.
///
/// The network device (or install ISO) loses its bootindex, the primary
/// drive `primary` gets 1.
pub fn boot_order_plan(
    devices: &[QomProperty],
    blocks: &[BlockDevice],
    primary: &str,
) -> Result<Vec<(String, i64)>> {
    let mut boot_dev = None;
    let mut primary_dev = None;

    for dev in devices {
        if matches!(
            dev.kind.as_str(),
            "child<virtio-net-pci>" | "child<virtio-net-ccw>"
        ) {
            boot_dev = Some(format!("{}/{}", PERIPHERAL_ANON, dev.name));
        }
    }
    for blk in blocks {
        let path = blk
            .device_path
            .trim_end_matches('/')
            .trim_end_matches("/virtio-backend")
            .to_string();
        if blk.device == "installiso" {
            boot_dev = Some(path);
        } else if blk.device == primary {
            primary_dev = Some(path);
        }
    }

    let boot_dev = boot_dev.ok_or_else(|| anyhow!("no network or ISO boot device found"))?;
    let primary_dev = primary_dev.ok_or_else(|| anyhow!("primary drive {} not found", primary))?;
    Ok(vec![(boot_dev, -1), (primary_dev, 1)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn block(device: &str, qdev: &str) -> BlockDevice {
        BlockDevice {
            device: device.into(),
            device_path: qdev.into(),
            removable: false,
        }
    }

    #[test]
    fn test_boot_order_plan_network() {
        let devices = vec![
            QomProperty {
                name: "type".into(),
                kind: "string".into(),
            },
            QomProperty {
                name: "device[0]".into(),
                kind: "child<virtio-net-pci>".into(),
            },
        ];
        let blocks = vec![block("d1", "/machine/peripheral-anon/device[2]/virtio-backend")];
        let plan = boot_order_plan(&devices, &blocks, "d1").unwrap();
        assert_eq!(
            plan,
            vec![
                ("/machine/peripheral-anon/device[0]".to_string(), -1),
                ("/machine/peripheral-anon/device[2]".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_boot_order_plan_iso() {
        let blocks = vec![
            block("installiso", "/machine/peripheral-anon/device[1]"),
            block("d1", "/machine/peripheral-anon/device[3]/virtio-backend"),
        ];
        let plan = boot_order_plan(&[], &blocks, "d1").unwrap();
        assert_eq!(plan[0].0, "/machine/peripheral-anon/device[1]");
        assert_eq!(plan[1], ("/machine/peripheral-anon/device[3]".to_string(), 1));

        assert!(boot_order_plan(&[], &blocks, "d9").is_err());
        assert!(boot_order_plan(&[], &blocks[1..], "d1").is_err());
    }

    #[tokio::test]
    async fn test_client_against_fake_monitor() {
        let dir = TempDir::new().unwrap();
        let sock = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            write
                .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
                .await
                .unwrap();
            let mut seen = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                let req: Value = serde_json::from_str(&line).unwrap();
                let cmd = req["execute"].as_str().unwrap().to_string();
                let reply = match cmd.as_str() {
                    "query-block" => {
                        write
                            .write_all(b"{\"event\": \"RESUME\", \"timestamp\": {}}\n")
                            .await
                            .unwrap();
                        json!({"return": [{"device": "d1", "qdev": "/machine/peripheral-anon/device[0]/virtio-backend", "removable": false}]})
                    }
                    "qom-set" => json!({"return": {}}),
                    "bogus" => json!({"error": {"class": "CommandNotFound", "desc": "nope"}}),
                    _ => json!({"return": {}}),
                };
                seen.push(req);
                let mut out = serde_json::to_vec(&reply).unwrap();
                out.push(b'\n');
                write.write_all(&out).await.unwrap();
            }
            seen
        });

        let mut client = QmpClient::connect(&sock).await.unwrap();
        let blocks = client.list_block_devices().await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].device, "d1");
        client.set_boot_index("/machine/peripheral-anon/device[0]", 1).await.unwrap();
        let err = client.execute("bogus", None).await.unwrap_err();
        assert!(err.to_string().contains("CommandNotFound"));
        drop(client);

        let seen = server.await.unwrap();
        assert_eq!(seen[0]["execute"], "qmp_capabilities");
        assert_eq!(seen[2]["arguments"]["property"], "bootindex");
        assert_eq!(seen[2]["arguments"]["value"], 1);
    }
}
