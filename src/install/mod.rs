//! Installer validation: boot a live environment that installs a build to
//! disk, over PXE or from an ISO with an embedded config.

pub mod http;
pub mod iso;
pub mod pxe;

pub use http::AssetServer;
pub use pxe::{BootType, KernelSetup, PxeSetup};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::destructor::aggregate;
use crate::error::Error;
use crate::qemu::{Arch, QemuBuilder, QemuInstance};

/// Kernel arguments every live installer boot gets.
pub const BASE_KARGS: &[&str] = &[
    "rd.neednet=1",
    "ip=dhcp",
    "ignition.firstboot",
    "ignition.platform.id=metal",
];

/// Written by the live system to the `bootstarted` channel once the
/// installer starts.
pub const BOOT_STARTED_SIGNAL: &str = "boot-started-OK";

pub const BOOT_STARTED_CHANNEL: &str = "bootstarted";

/// Host address as seen from a usermode-networked guest.
pub const DEFAULT_QEMU_HOST_IPV4: &str = "10.0.2.2";

/// Bare metal installs need more than the usual guest memory.
pub const METAL_MEMORY: u32 = 4096;

pub const BOOT_STARTED_UNIT: &str = r"[Unit]
Description=TestISO Boot Started
Requires=dev-virtio\\x2dports-bootstarted.device
OnFailure=emergency.target
OnFailureJobMode=isolate
[Service]
Type=oneshot
RemainAfterExit=yes
ExecStart=/bin/sh -c '/usr/bin/echo boot-started-OK >/dev/virtio-ports/bootstarted'
[Install]
RequiredBy=coreos-installer.target
";

/// One image in a build's `meta.json`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub path: String,
}

/// The images of a build this installer knows how to use.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BuildArtifacts {
    pub metal: Option<Artifact>,
    pub metal4k: Option<Artifact>,
    pub live_iso: Option<Artifact>,
    pub live_kernel: Option<Artifact>,
    pub live_initramfs: Option<Artifact>,
    pub live_rootfs: Option<Artifact>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildMeta {
    pub name: String,
    #[serde(default)]
    pub ostree_version: String,
    #[serde(default)]
    pub images: BuildArtifacts,
}

/// A build directory and its parsed metadata. Artifact paths are relative
/// to `dir`.
#[derive(Debug, Clone)]
pub struct Build {
    pub dir: PathBuf,
    pub meta: BuildMeta,
}

impl Build {
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let path = dir.join("meta.json");
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let meta = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { dir, meta })
    }

    pub fn artifact_path(&self, artifact: &Artifact) -> PathBuf {
        self.dir.join(&artifact.path)
    }
}

/// A QEMU builder sized for bare metal installs.
pub fn metal_builder(guest: Arch) -> Result<QemuBuilder> {
    let mut builder = QemuBuilder::new(guest)?;
    builder.memory = METAL_MEMORY;
    Ok(builder)
}

/// Base kernel arguments plus the console for `arch`.
pub fn base_kargs(arch: Arch) -> Vec<String> {
    let mut kargs: Vec<String> = BASE_KARGS.iter().map(|k| k.to_string()).collect();
    kargs.push(format!("console={}", arch.console()));
    kargs
}

/// One install attempt. The builder is consumed when the VM starts.
pub struct Install {
    pub build: Build,
    pub builder: QemuBuilder,
    pub insecure: bool,
    pub native_4k: bool,
    pub pxe_append_rootfs: bool,
    /// NetworkManager keyfiles to embed in the ISO, by file name
    pub nm_keyfiles: BTreeMap<String, String>,
}

impl Install {
    pub fn new(build: Build, builder: QemuBuilder) -> Self {
        Self {
            build,
            builder,
            insecure: false,
            native_4k: false,
            pxe_append_rootfs: false,
            nm_keyfiles: BTreeMap::new(),
        }
    }

    /// The metal image this install writes, honouring `native_4k`.
    fn metal_image(&self) -> Result<&Artifact> {
        let images = &self.build.meta.images;
        let (artifact, kind) = if self.native_4k {
            (images.metal4k.as_ref(), "metal4k")
        } else {
            (images.metal.as_ref(), "metal")
        };
        artifact.ok_or_else(|| {
            Error::InvalidInstall(format!(
                "build {} must have a `{}` artifact",
                self.build.meta.ostree_version, kind
            ))
            .into()
        })
    }
}

type BootStarted = oneshot::Receiver<Result<()>>;

/// A VM booted into an installer, with the assets it is fetching from.
pub struct InstalledMachine {
    qemu: Option<Arc<Mutex<QemuInstance>>>,
    tempdir: Option<TempDir>,
    server: Option<AssetServer>,
    boot_started: Option<BootStarted>,
}

impl InstalledMachine {
    fn new(
        qemu: QemuInstance,
        tempdir: TempDir,
        server: Option<AssetServer>,
        boot_channel: OwnedFd,
    ) -> Self {
        let qemu = Arc::new(Mutex::new(qemu));
        let boot_started = watch_boot_started(boot_channel, qemu.clone());
        Self {
            qemu: Some(qemu),
            tempdir: Some(tempdir),
            server,
            boot_started: Some(boot_started),
        }
    }

    /// The running VM. Hold the lock only briefly until boot has started,
    /// since the boot order switch needs it too.
    pub fn qemu(&self) -> Option<&Arc<Mutex<QemuInstance>>> {
        self.qemu.as_ref()
    }

    pub fn tempdir(&self) -> Option<&Path> {
        self.tempdir.as_ref().map(|d| d.path())
    }

    /// Wait for the live system to report that the installer started, and
    /// for any boot order switch that triggers.
    pub async fn wait_boot_started(&mut self, timeout: Duration) -> Result<()> {
        let rx = self
            .boot_started
            .as_mut()
            .ok_or_else(|| anyhow!("boot-started signal already consumed"))?;
        let result = match tokio::time::timeout(timeout, rx).await {
            Err(_) => return Err(Error::timeout("boot-started signal", timeout).into()),
            Ok(Err(_)) => Err(Error::BootSignal("boot-started watcher went away".into()).into()),
            Ok(Ok(result)) => result,
        };
        self.boot_started = None;
        result
    }

    /// Kill the VM, stop the asset server, and remove the scratch
    /// directory. Idempotent.
    pub async fn destroy(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        self.boot_started = None;
        if let Some(qemu) = self.qemu.take() {
            if let Err(e) = qemu.lock().await.destroy().await {
                errors.push(e);
            }
        }
        if let Some(mut server) = self.server.take() {
            if let Err(e) = server.shutdown().await {
                errors.push(e);
            }
        }
        if let Some(dir) = self.tempdir.take() {
            let path = dir.path().display().to_string();
            if let Err(e) = dir.close() {
                errors.push(anyhow::Error::new(e).context(format!("removing {}", path)));
            }
        }
        aggregate(errors)
    }
}

/// Read the boot-started line. Closing the channel first, or writing
/// anything else, is a [`Error::BootSignal`].
async fn read_boot_signal(channel: OwnedFd) -> Result<()> {
    let file = tokio::fs::File::from_std(std::fs::File::from(channel));
    let mut line = String::new();
    let n = BufReader::new(file)
        .read_line(&mut line)
        .await
        .map_err(|e| Error::BootSignal(format!("reading from boot started channel: {}", e)))?;
    if n == 0 {
        return Err(Error::BootSignal(format!(
            "got EOF from boot started channel, {} expected",
            BOOT_STARTED_SIGNAL
        ))
        .into());
    }
    let line = line.trim();
    if line != BOOT_STARTED_SIGNAL {
        return Err(Error::BootSignal(format!(
            "unexpected {:?} on boot started channel",
            line
        ))
        .into());
    }
    Ok(())
}

fn watch_boot_started(channel: OwnedFd, qemu: Arc<Mutex<QemuInstance>>) -> BootStarted {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = match read_boot_signal(channel).await {
            Ok(()) => {
                info!("installer boot started");
                qemu.lock()
                    .await
                    .switch_boot_order()
                    .await
                    .context("switching boot order")
            }
            Err(e) => Err(e),
        };
        if tx.send(result).is_err() {
            debug!("nobody waiting for the boot-started signal");
        }
    });
    rx
}

/// Shut down a server whose install attempt failed.
async fn abandon(server: Option<AssetServer>) {
    if let Some(mut server) = server {
        if let Err(e) = server.shutdown().await {
            warn!(error = %format!("{:#}", e), "stopping asset server after failed install");
        }
    }
}
