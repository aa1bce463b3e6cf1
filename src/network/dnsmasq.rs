//! The virtual LAN: bridges, deterministic guest addressing, and dnsmasq.

use anyhow::{Context, Result};
use std::fmt::{self, Write as _};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::link;
use super::namespace::NsExecutor;
use crate::error::Error;

pub const NUM_SEGMENTS: u8 = 3;
pub const NUM_INTERFACES: u8 = 16;

/// A pre-assigned (MAC, IPv4, IPv6) tuple issued to one guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interface {
    pub mac: [u8; 6],
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

pub struct MacAddr<'a>(&'a [u8; 6]);

impl fmt::Display for MacAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl Interface {
    fn new(s: u8, i: u8) -> Self {
        Self {
            mac: [0x02, s, 0, 0, 0, i],
            ipv4: Ipv4Addr::new(10, s, 0, i),
            ipv6: Ipv6Addr::new(0xfd00 | s as u16, 0, 0, 0, 0, 0, 0, i as u16),
        }
    }

    pub fn mac(&self) -> MacAddr<'_> {
        MacAddr(&self.mac)
    }

    pub fn ipv4_cidr(&self) -> String {
        format!("{}/24", self.ipv4)
    }

    pub fn ipv6_cidr(&self) -> String {
        format!("{}/64", self.ipv6)
    }
}

/// One bridge-backed LAN and its pool of guest interfaces.
#[derive(Debug)]
pub struct Segment {
    pub bridge: String,
    pub bridge_if: Interface,
    pub interfaces: Vec<Interface>,
    next: usize,
}

impl Segment {
    fn new(s: u8) -> Self {
        Self {
            bridge: format!("br{}", s),
            bridge_if: Interface::new(s, 1),
            interfaces: (2..2 + NUM_INTERFACES).map(|i| Interface::new(s, i)).collect(),
            next: 0,
        }
    }

    fn take(&mut self) -> Result<Interface> {
        let iface = self
            .interfaces
            .get(self.next)
            .copied()
            .ok_or_else(|| Error::InterfacesExhausted {
                segment: self.bridge.clone(),
                capacity: self.interfaces.len(),
            })?;
        self.next += 1;
        Ok(iface)
    }
}

/// The dnsmasq configuration read from stdin.
pub fn render_config(segments: &[Segment]) -> String {
    let mut out = String::from(
        "keep-in-foreground\n\
         leasefile-ro\n\
         log-facility=-\n\
         pid-file=\n\
         quiet-dhcp\n\
         quiet-dhcp6\n\
         quiet-ra\n\
         \n\
         no-resolv\n\
         no-hosts\n\
         enable-ra\n",
    );
    for seg in segments {
        let _ = writeln!(out, "\ndomain={}.local", seg.bridge);
        let _ = writeln!(out, "dhcp-range={},static", seg.bridge_if.ipv4);
        let _ = writeln!(out, "dhcp-range={},ra-names,slaac", seg.bridge_if.ipv6);
        for iface in &seg.interfaces {
            // dnsmasq needs IPv6 host addresses bracketed.
            let _ = writeln!(
                out,
                "dhcp-host={},{},[{}]",
                iface.mac(),
                iface.ipv4,
                iface.ipv6
            );
        }
    }
    out
}

/// Bridges plus a dnsmasq process serving DHCPv4, DHCPv6, RA, and DNS on them.
pub struct VirtualNetwork {
    segments: Vec<Segment>,
    dnsmasq: Option<Child>,
}

impl VirtualNetwork {
    /// Bring up every segment inside the executor's namespace and start dnsmasq there.
    pub async fn new(exec: &NsExecutor) -> Result<Self> {
        let segments: Vec<Segment> = (0..NUM_SEGMENTS).map(Segment::new).collect();
        let bridges: Vec<(String, Interface)> = segments
            .iter()
            .map(|s| (s.bridge.clone(), s.bridge_if))
            .collect();

        let mut child = exec
            .run(move || {
                for (name, br) in &bridges {
                    link::create_bridge(
                        name,
                        &br.mac().to_string(),
                        &[br.ipv4_cidr(), br.ipv6_cidr()],
                    )
                    .context("network setup failed")?;
                }
                link::set_loopback_up().context("network loopback setup failed")?;

                Command::new("dnsmasq")
                    .arg("--conf-file=-")
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .context("spawning dnsmasq")
            })
            .await?;

        drain_output(&mut child);

        let mut net = Self {
            segments,
            dnsmasq: Some(child),
        };

        let config = render_config(&net.segments);
        if let Err(e) = net.write_config(&config).await {
            let _ = net.destroy().await;
            return Err(e);
        }

        info!(segments = net.segments.len(), "virtual network started");
        Ok(net)
    }

    async fn write_config(&mut self, config: &str) -> Result<()> {
        let mut stdin = self
            .dnsmasq
            .as_mut()
            .and_then(|c| c.stdin.take())
            .context("dnsmasq stdin not captured")?;
        stdin
            .write_all(config.as_bytes())
            .await
            .context("writing dnsmasq config")?;
        // Closing stdin ends the config.
        drop(stdin);
        Ok(())
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Issue the next unused interface on the named segment.
    pub fn get_interface(&mut self, bridge: &str) -> Result<Interface> {
        let seg = self
            .segments
            .iter_mut()
            .find(|s| s.bridge == bridge)
            .ok_or_else(|| Error::UnknownSegment(bridge.to_string()))?;
        let iface = seg.take()?;
        debug!(bridge = %bridge, mac = %iface.mac(), ip = %iface.ipv4, "issued interface");
        Ok(iface)
    }

    /// Create a TAP device for a guest and attach it to the segment bridge.
    pub async fn attach_tap(&self, exec: &NsExecutor, tap: &str, bridge: &str) -> Result<()> {
        if !self.segments.iter().any(|s| s.bridge == bridge) {
            return Err(Error::UnknownSegment(bridge.to_string()).into());
        }
        let tap = tap.to_string();
        let bridge = bridge.to_string();
        exec.run(move || link::create_tap(&tap, &bridge)).await
    }

    pub async fn detach_tap(exec: &NsExecutor, tap: &str) -> Result<()> {
        let tap = tap.to_string();
        exec.run(move || link::delete_link(&tap)).await
    }

    /// Kill dnsmasq and wait for it to exit.
    pub async fn destroy(&mut self) -> Result<()> {
        let Some(mut child) = self.dnsmasq.take() else {
            return Ok(());
        };
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill dnsmasq");
        }
        let status = child.wait().await.context("waiting for dnsmasq")?;
        debug!(status = %status, "dnsmasq exited");
        Ok(())
    }
}

fn drain_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "dnsmasq", "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "dnsmasq", "{}", line);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn offline_network() -> VirtualNetwork {
        VirtualNetwork {
            segments: (0..NUM_SEGMENTS).map(Segment::new).collect(),
            dnsmasq: None,
        }
    }

    #[test]
    fn test_interface_addressing() {
        let iface = Interface::new(1, 5);
        assert_eq!(iface.mac().to_string(), "02:01:00:00:00:05");
        assert_eq!(iface.ipv4_cidr(), "10.1.0.5/24");
        assert_eq!(iface.ipv6_cidr(), "fd01::5/64");
    }

    #[test]
    fn test_pool_exhaustion_is_an_error() {
        let mut net = offline_network();
        let mut seen = HashSet::new();
        for _ in 0..NUM_INTERFACES {
            let iface = net.get_interface("br0").unwrap();
            assert!(seen.insert((iface.mac, iface.ipv4, iface.ipv6)));
            assert_eq!(iface.ipv4.octets()[..3], [10, 0, 0]);
        }
        assert_eq!(seen.len(), NUM_INTERFACES as usize);

        let err = net.get_interface("br0").unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::InterfacesExhausted { segment, capacity }) => {
                assert_eq!(segment, "br0");
                assert_eq!(*capacity, NUM_INTERFACES as usize);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }

        // Other segments keep their own pools.
        assert_eq!(net.get_interface("br1").unwrap().ipv4, Ipv4Addr::new(10, 1, 0, 2));
    }

    #[test]
    fn test_unknown_segment() {
        let mut net = offline_network();
        let err = net.get_interface("br9").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnknownSegment(name)) if name == "br9"
        ));
    }

    #[test]
    fn test_render_config() {
        let net = offline_network();
        let cfg = render_config(&net.segments);
        assert!(cfg.starts_with("keep-in-foreground\n"));
        assert!(cfg.contains("\nenable-ra\n"));
        assert!(cfg.contains("domain=br2.local\n"));
        assert!(cfg.contains("dhcp-range=10.0.0.1,static\n"));
        assert!(cfg.contains("dhcp-range=fd00::1,ra-names,slaac\n"));
        assert!(cfg.contains("dhcp-host=02:00:00:00:00:02,10.0.0.2,[fd00::2]\n"));
        assert!(cfg.contains("dhcp-host=02:02:00:00:00:11,10.2.0.17,[fd02::11]\n"));
        assert_eq!(
            cfg.matches("dhcp-host=").count(),
            (NUM_SEGMENTS as usize) * (NUM_INTERFACES as usize)
        );
    }
}
