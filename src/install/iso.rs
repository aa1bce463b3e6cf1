use anyhow::{Context, Result};
use serde::Serialize;
use std::ffi::OsString;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::info;

use super::http::AssetServer;
use super::{
    abandon, Install, InstalledMachine, BOOT_STARTED_CHANNEL, BOOT_STARTED_UNIT,
    DEFAULT_QEMU_HOST_IPV4,
};
use crate::error::Error;
use crate::paths;
use crate::platform::conf::{IgnitionConfig, RenderedConfig, UnitState};
use crate::qemu::QemuInstance;
use crate::utils::{abs_symlink, copy_reflink, run_checked};

/// Where the live system finds the config to install.
pub const POINTER_CONFIG_PATH: &str = "/var/opt/pointer.ign";

pub const INSTALLER_CONFIG_PATH: &str = "/etc/coreos/installer.d/mantle.yaml";

const DEST_DEVICE: &str = "/dev/vda";

/// coreos-installer config file dropped into the live system.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct InstallerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ignition_file: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub append_karg: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub copy_network: bool,
    pub dest_device: String,
}

impl InstallerConfig {
    pub fn new() -> Self {
        Self {
            ignition_file: POINTER_CONFIG_PATH.to_string(),
            dest_device: DEST_DEVICE.to_string(),
            ..Default::default()
        }
    }
}

impl Install {
    fn validate_iso_embed(&self, offline: bool, minimal: bool) -> Result<()> {
        self.metal_image()?;
        if self.build.meta.images.live_iso.is_none() {
            return Err(Error::InvalidInstall(format!(
                "build {} must have a live ISO",
                self.build.meta.name
            ))
            .into());
        }
        if minimal && offline {
            return Err(Error::InvalidInstall("can't run minimal install offline".into()).into());
        }
        if offline && !self.nm_keyfiles.is_empty() {
            return Err(
                Error::InvalidInstall("cannot use NM keyfiles with offline mode".into()).into(),
            );
        }
        Ok(())
    }

    /// Boot the live ISO with an embedded config that runs coreos-installer.
    ///
    /// Offline installs carry the target config inline and write the image
    /// shipped on the ISO. Online installs fetch the target config, and
    /// unless `minimal`, the metal image, from a local asset server.
    /// Copies of the configs are left in `outdir`.
    pub async fn install_via_iso_embed(
        self,
        kargs: &[String],
        live: Box<dyn RenderedConfig>,
        target: Box<dyn RenderedConfig>,
        outdir: &Path,
        offline: bool,
        minimal: bool,
    ) -> Result<InstalledMachine> {
        self.validate_iso_embed(offline, minimal)?;
        let mut server = None;
        let result = self
            .boot_iso(kargs, live, target, outdir, offline, minimal, &mut server)
            .await;
        match result {
            Ok((qemu, tempdir, channel)) => Ok(InstalledMachine::new(qemu, tempdir, server, channel)),
            Err(e) => {
                abandon(server).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn boot_iso(
        self,
        kargs: &[String],
        mut live: Box<dyn RenderedConfig>,
        target: Box<dyn RenderedConfig>,
        outdir: &Path,
        offline: bool,
        minimal: bool,
        server: &mut Option<AssetServer>,
    ) -> Result<(QemuInstance, TempDir, OwnedFd)> {
        let metal = self.metal_image()?.path.clone();
        let mut src_iso = self
            .build
            .meta
            .images
            .live_iso
            .as_ref()
            .map(|iso| self.build.artifact_path(iso))
            .ok_or_else(|| Error::InvalidInstall("build has no live ISO".into()))?;

        let tempdir = tempfile::Builder::new()
            .prefix("vmflight-metal")
            .tempdir_in(paths::tmp_dir())
            .context("creating installer tempdir")?;
        let tmp = tempdir.path();

        target.write_file(&tmp.join("target.ign"))?;
        target.write_file(&outdir.join("config-target.ign"))?;
        abs_symlink(&self.build.dir.join(&metal), &tmp.join(&metal))
            .context("setting up metal image")?;

        let base_url = if offline {
            None
        } else {
            let started = AssetServer::start(tmp, "0.0.0.0:0").await?;
            let base_url = format!("http://{}:{}", DEFAULT_QEMU_HOST_IPV4, started.port());
            *server = Some(started);
            Some(base_url)
        };

        let mut config = InstallerConfig::new();
        if let Some(base_url) = &base_url {
            // Minimal installs still write the image carried by the ISO.
            if minimal {
                src_iso = extract_minimal_iso(&src_iso, tmp, base_url).await?;
            } else {
                config.image_url = Some(format!("{}/{}", base_url, metal));
            }
        }
        if !self.nm_keyfiles.is_empty() {
            src_iso = self.embed_keyfiles(&src_iso, tmp).await?;
            config.copy_network = true;
        }
        config.insecure = self.insecure;

        let pointer = pointer_config(target.as_ref(), base_url.as_deref());
        if base_url.is_some() {
            let path = outdir.join("config-target-pointer.ign");
            std::fs::write(&path, &pointer)
                .with_context(|| format!("writing config {}", path.display()))?;
        }
        embed_installer_config(live.as_mut(), &pointer, &config)?;
        live.write_file(&outdir.join("config-live.ign"))?;

        let mut builder = self.builder;
        let channel = builder.virtio_channel_read(BOOT_STARTED_CHANNEL)?;
        builder.set_config(live)?;
        builder.append_kernel_args = kargs.join(" ");
        builder.add_iso(src_iso, Some("bootindex=3"), false);
        if !offline {
            builder.enable_usermode_networking(Vec::new());
        }

        let qemu = builder.exec().await?;
        info!(target: "qemu", pid = ?qemu.pid(), offline, minimal, "ISO installer started");
        Ok((qemu, tempdir, channel))
    }

    /// Copy the ISO into `tmp`, embed the NetworkManager keyfiles, and force
    /// networking on in the initramfs so the keyfiles get used.
    async fn embed_keyfiles(&self, src_iso: &Path, tmp: &Path) -> Result<PathBuf> {
        let mut keyfile_args: Vec<OsString> = Vec::new();
        for (name, contents) in &self.nm_keyfiles {
            let path = tmp.join(name);
            std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
                .and_then(|mut f| f.write_all(contents.as_bytes()))
                .with_context(|| format!("writing keyfile {}", path.display()))?;
            keyfile_args.push("--keyfile".into());
            keyfile_args.push(path.into_os_string());
        }

        let iso = tmp.join("install.iso");
        copy_reflink(src_iso, &iso).await.context("copying iso")?;
        run_checked(
            Command::new("coreos-installer")
                .args(["iso", "network", "embed"])
                .arg(&iso)
                .args(&keyfile_args),
            "coreos-installer iso network embed",
        )
        .await?;
        run_checked(
            Command::new("coreos-installer")
                .args(["iso", "kargs", "modify"])
                .arg(&iso)
                .args(["--append", "rd.neednet=1"]),
            "coreos-installer iso kargs modify",
        )
        .await?;
        Ok(iso)
    }
}

/// Config coreos-installer writes to the target disk. Offline it is the
/// target config itself; online it merges the copy on the asset server.
fn pointer_config(target: &dyn RenderedConfig, base_url: Option<&str>) -> String {
    match base_url {
        None => target.to_string(),
        Some(base_url) => {
            let mut pointer = IgnitionConfig::new();
            pointer.add_config_source(&format!("{}/target.ign", base_url));
            pointer.to_string()
        }
    }
}

/// Turn `live` into an installer config: signal boot start, drop the pointer
/// and installer YAML where coreos-installer looks for them, and log in on
/// the consoles.
fn embed_installer_config(
    live: &mut dyn RenderedConfig,
    pointer: &str,
    config: &InstallerConfig,
) -> Result<()> {
    let config_yaml = serde_yaml::to_string(config).context("serializing installer config")?;
    live.add_systemd_unit("boot-started.service", BOOT_STARTED_UNIT, UnitState::Enable);
    live.add_file(&config.ignition_file, pointer, 0o644);
    live.add_file(INSTALLER_CONFIG_PATH, &config_yaml, 0o644);
    live.add_autologin();
    Ok(())
}

/// Extract the minimal ISO and its rootfs into `tmp`; the ISO fetches the
/// rootfs from the asset server.
async fn extract_minimal_iso(src_iso: &Path, tmp: &Path, base_url: &str) -> Result<PathBuf> {
    let minimal = tmp.join("minimal.iso");
    run_checked(
        Command::new("coreos-installer")
            .args(["iso", "extract", "minimal-iso"])
            .arg(src_iso)
            .arg(&minimal)
            .arg("--output-rootfs")
            .arg(tmp.join("rootfs.img"))
            .arg("--rootfs-url")
            .arg(format!("{}/rootfs.img", base_url)),
        "coreos-installer iso extract minimal-iso",
    )
    .await?;
    Ok(minimal)
}
