use anyhow::{Context, Result};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::arch::Arch;
use super::builder::{HostForwardPort, PreparedQemu};
use super::qmp::{boot_order_plan, QmpClient};
use crate::destructor::aggregate;
use crate::error::Error;
use crate::utils::retry;

/// Buffer for the journal channel; longer lines mean the stream was cut.
const JOURNAL_BUFFER: usize = 64768;

const QMP_CONNECT_ATTEMPTS: u32 = 30;
const QMP_CONNECT_DELAY: Duration = Duration::from_secs(1);

/// A running QEMU process and the sidecar resources it owns.
pub struct QemuInstance {
    arch: Arch,
    child: Option<Child>,
    pid: Option<u32>,
    tempdir: Option<TempDir>,
    journal: Option<OwnedFd>,
    qmp: Option<QmpClient>,
    qmp_socket: PathBuf,
    host_forward_ports: Vec<HostForwardPort>,
    primary_drive: Option<String>,
}

impl QemuInstance {
    /// Adopt a freshly spawned QEMU: forward its output and connect QMP.
    pub(super) async fn start(prepared: PreparedQemu, mut child: Child) -> Result<Self> {
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "qemu", pid, "{}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "qemu", pid, "{}", line);
                }
            });
        }

        let mut inst = Self {
            arch: prepared.arch,
            child: Some(child),
            pid,
            tempdir: prepared.tempdir,
            journal: Some(prepared.journal),
            qmp: None,
            qmp_socket: prepared.qmp_socket,
            host_forward_ports: prepared.host_forward_ports,
            primary_drive: prepared.primary_drive,
        };

        // Loaded CI hosts can take a while to bring QEMU up.
        let socket = inst.qmp_socket.clone();
        let connected = retry(QMP_CONNECT_ATTEMPTS, QMP_CONNECT_DELAY, || {
            let socket = socket.clone();
            async move { QmpClient::connect(&socket).await }
        })
        .await;
        match connected {
            Ok(qmp) => inst.qmp = Some(qmp),
            Err(e) => {
                if let Err(destroy_err) = inst.destroy().await {
                    warn!(target: "qemu", error = %format!("{:#}", destroy_err), "cleaning up after QMP failure");
                }
                return Err(e.context("establishing QMP connection"));
            }
        }
        Ok(inst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Kill QEMU and reap it. Safe to call on a dead instance.
    pub async fn kill(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            debug!(target: "qemu", pid = ?self.pid, "killing qemu");
            if let Ok(None) = child.try_wait() {
                child.kill().await.context("killing qemu")?;
            }
        }
        Ok(())
    }

    /// Wait for QEMU to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let child = self.child.as_mut().context("qemu is not running")?;
        child.wait().await.context("waiting for qemu")
    }

    /// Host address of the forwarded SSH port.
    pub fn ssh_address(&self) -> Result<String> {
        self.host_forward_ports
            .iter()
            .find(|p| p.service == "ssh")
            .map(|p| format!("127.0.0.1:{}", p.host_port))
            .context("didn't find an address")
    }

    /// Make the installed disk the next boot device.
    ///
    /// Only aarch64 and s390x need this; they cannot boot once from the
    /// network, so the network (or ISO) device keeps winning otherwise.
    pub async fn switch_boot_order(&mut self) -> Result<()> {
        if !self.arch.needs_boot_order_switch() {
            return Ok(());
        }
        let primary = self
            .primary_drive
            .clone()
            .context("no primary disk to boot from")?;
        let qmp = self.qmp.as_mut().context("QMP is not connected")?;
        let devices = qmp
            .list_devices()
            .await
            .context("listing devices through QMP")?;
        let blocks = qmp
            .list_block_devices()
            .await
            .context("listing block devices through QMP")?;
        for (device, index) in boot_order_plan(&devices, &blocks, &primary)? {
            qmp.set_boot_index(&device, index).await?;
        }
        info!(target: "qemu", pid = ?self.pid, drive = %primary, "switched boot order to disk");
        Ok(())
    }

    /// Return the initramfs journal if the guest failed before switching
    /// root, or an empty string once the channel closes cleanly.
    pub async fn wait_ignition_error(&mut self) -> Result<String> {
        match self.journal.take() {
            Some(journal) => read_journal(journal).await,
            None => Ok(String::new()),
        }
    }

    /// Wait for QEMU to exit cleanly, failing early if the initramfs
    /// reports an error or `timeout` passes.
    pub async fn wait_all(&mut self, timeout: Duration) -> Result<()> {
        let journal = self.journal.take();
        let child = self.child.as_mut().context("qemu is not running")?;
        tokio::select! {
            r = journal_emergency(journal) => r,
            status = child.wait() => {
                let status = status.context("waiting for qemu")?;
                if !status.success() {
                    anyhow::bail!("qemu exited with {}", status);
                }
                Ok(())
            }
            _ = tokio::time::sleep(timeout) => Err(Error::timeout("qemu to exit", timeout).into()),
        }
    }

    /// Drop QMP, close the journal, kill QEMU, and remove the tempdir.
    /// Idempotent.
    pub async fn destroy(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        if self.qmp.take().is_some() {
            let _ = std::fs::remove_file(&self.qmp_socket);
        }
        self.journal = None;
        if let Err(e) = self.kill().await {
            errors.push(e.context(format!("killing qemu instance {:?}", self.pid)));
        }
        if let Some(dir) = self.tempdir.take() {
            let path = dir.path().display().to_string();
            if let Err(e) = dir.close() {
                errors.push(anyhow::Error::new(e).context(format!("removing tempdir {}", path)));
            }
        }
        aggregate(errors)
    }
}

async fn read_journal(journal: OwnedFd) -> Result<String> {
    let file = tokio::fs::File::from_std(std::fs::File::from(journal));
    let mut reader = BufReader::with_capacity(JOURNAL_BUFFER, file);
    let mut out = String::new();
    let mut truncated = false;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .context("reading from journal channel")?;
        if n == 0 {
            break;
        }
        if line.len() > JOURNAL_BUFFER {
            truncated = true;
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches('\n');
        if text.is_empty() || text == "{}" {
            break;
        }
        out.push_str(text);
        out.push('\n');
    }
    if truncated {
        anyhow::bail!("journal was truncated due to overly long line");
    }
    Ok(out)
}

/// Resolves only when the journal shows an initramfs failure.
async fn journal_emergency(journal: Option<OwnedFd>) -> Result<()> {
    let buf = match journal {
        Some(fd) => read_journal(fd).await?,
        None => String::new(),
    };
    if buf.is_empty() {
        std::future::pending::<()>().await;
    }
    Err(Error::InitramfsEmergency.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pipe() -> (OwnedFd, std::fs::File) {
        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        (r, std::fs::File::from(w))
    }

    #[tokio::test]
    async fn test_read_journal_clean_close() {
        let (r, w) = pipe();
        drop(w);
        assert_eq!(read_journal(r).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_read_journal_collects_until_terminator() {
        let (r, mut w) = pipe();
        w.write_all(b"{\"MESSAGE\":\"a\"}\n{\"MESSAGE\":\"b\"}\n{}\n{\"MESSAGE\":\"ignored\"}\n")
            .unwrap();
        drop(w);
        assert_eq!(
            read_journal(r).await.unwrap(),
            "{\"MESSAGE\":\"a\"}\n{\"MESSAGE\":\"b\"}\n"
        );
    }

    #[tokio::test]
    async fn test_read_journal_truncation() {
        let (r, mut w) = pipe();
        let writer = std::thread::spawn(move || {
            let long = "x".repeat(JOURNAL_BUFFER + 10);
            w.write_all(long.as_bytes()).unwrap();
            w.write_all(b"\n").unwrap();
        });
        let err = read_journal(r).await.unwrap_err();
        assert!(err.to_string().contains("truncated"));
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_journal_emergency() {
        let (r, mut w) = pipe();
        w.write_all(b"{\"MESSAGE\":\"emergency\"}\n\n").unwrap();
        drop(w);
        let err = journal_emergency(Some(r)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InitramfsEmergency)
        ));

        let (r, w) = pipe();
        drop(w);
        let pending =
            tokio::time::timeout(Duration::from_millis(50), journal_emergency(Some(r))).await;
        assert!(pending.is_err());
    }
}
