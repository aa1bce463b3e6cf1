use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::utils::run_checked;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Channel {
    #[default]
    Virtio,
    Nvme,
}

/// An additional guest disk: a fresh qcow2 image, optionally layered over a
/// backing file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Disk {
    /// Image size with optional K/M/G/T suffix
    pub size: Option<String>,
    pub backing_file: Option<PathBuf>,
    /// qcow2, raw, ... Inferred from the backing file name when unset.
    pub backing_format: Option<String>,
    pub channel: Channel,
    /// Extra `-device` options; `serial=X` shows up as /dev/disk/by-id/virtio-X
    pub device_opts: Vec<String>,
    /// Overrides the logical and physical sector size
    pub sector_size: Option<u32>,
}

impl Disk {
    pub fn with_size(size: impl Into<String>) -> Self {
        Self {
            size: Some(size.into()),
            ..Default::default()
        }
    }

    pub fn with_backing_file(path: impl Into<PathBuf>) -> Self {
        Self {
            backing_file: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size.is_none() && self.backing_file.is_none() {
            bail!("disk needs a size or a backing file");
        }
        Ok(())
    }

    /// `qemu-img` arguments creating this disk at `dst`. `backing` must
    /// already be resolved.
    pub fn qemu_img_args(&self, dst: &Path, backing: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            dst.display().to_string(),
        ];
        // Ephemeral images gain nothing from CoW and fragment badly on btrfs.
        let mut opts = "nocow=on".to_string();
        if let Some(backing) = backing {
            opts.push_str(&format!(
                ",backing_file={},lazy_refcounts=on",
                backing.display()
            ));
            let format = self.backing_format.clone().or_else(|| {
                backing
                    .to_string_lossy()
                    .ends_with("qcow2")
                    .then(|| "qcow2".to_string())
            });
            if let Some(format) = format {
                opts.push_str(&format!(",backing_fmt={}", format));
            }
        }
        args.push("-o".to_string());
        args.push(opts);
        if let Some(size) = &self.size {
            args.push(size.clone());
        }
        args
    }

    /// Create the image at `dst` with `qemu-img`.
    pub async fn create_image(&self, dst: &Path) -> Result<()> {
        self.validate()?;
        let backing = match &self.backing_file {
            Some(b) => Some(resolve_backing_file(b)?),
            None => None,
        };
        let args = self.qemu_img_args(dst, backing.as_deref());
        debug!(target: "qemu", ?args, "creating disk image");
        run_checked(Command::new("qemu-img").args(&args), "qemu-img create").await?;
        Ok(())
    }

    /// `-device` options for this disk, before the drive id is attached.
    pub fn device_options(&self, primary: bool, disk_id: u32) -> Vec<String> {
        let mut opts = self.device_opts.clone();
        if primary {
            opts.push("serial=primary-disk".to_string());
        } else if !opts.iter().any(|o| o.starts_with("serial=")) {
            opts.push(format!("serial=disk{}", disk_id));
        }
        if let Some(size) = self.sector_size {
            opts.push(format!(
                "physical_block_size={0},logical_block_size={0}",
                size
            ));
        }
        // Other disks keep an unspecified, lower-priority bootindex.
        if primary {
            opts.push("bootindex=1".to_string());
        }
        opts
    }
}

/// Absolute, symlink-free path so a moving "latest" link cannot break the
/// overlay. `/proc/*/fd/*` paths are left alone.
pub fn resolve_backing_file(path: &Path) -> Result<PathBuf> {
    let abs = std::path::absolute(path)
        .with_context(|| format!("resolving backing file {}", path.display()))?;
    if abs.starts_with("/proc/") {
        return Ok(abs);
    }
    std::fs::canonicalize(&abs)
        .with_context(|| format!("resolving symlinks in {}", abs.display()))
}

/// Parse `<size>[:<opt>,<opt>...]`.
///
/// Options: `nvme` selects the NVMe channel, `4k` sets 4096-byte sectors,
/// and `serial=<id>` names the disk in the guest.
pub fn parse_disk_spec(spec: &str) -> Result<Disk> {
    let (size, opts) = match spec.split_once(':') {
        Some((size, opts)) => (size, Some(opts)),
        None => (spec, None),
    };
    if size.is_empty() {
        bail!("invalid disk spec {:?}: missing size", spec);
    }
    let mut disk = Disk::with_size(size);
    for opt in opts.into_iter().flat_map(|o| o.split(',')) {
        match opt {
            "nvme" => disk.channel = Channel::Nvme,
            "4k" => disk.sector_size = Some(4096),
            o if o.starts_with("serial=") && o.len() > "serial=".len() => {
                disk.device_opts.push(o.to_string())
            }
            other => bail!("unknown disk option {:?} in spec {:?}", other, spec),
        }
    }
    Ok(disk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_disk_spec() {
        let d = parse_disk_spec("5G").unwrap();
        assert_eq!(d.size.as_deref(), Some("5G"));
        assert_eq!(d.channel, Channel::Virtio);

        let d = parse_disk_spec("10G:nvme,serial=data,4k").unwrap();
        assert_eq!(d.channel, Channel::Nvme);
        assert_eq!(d.device_opts, vec!["serial=data"]);
        assert_eq!(d.sector_size, Some(4096));

        assert!(parse_disk_spec("5G:mystery").is_err());
        assert!(parse_disk_spec(":nvme").is_err());
    }

    #[test]
    fn test_needs_size_or_file() {
        assert!(Disk::default().validate().is_err());
        Disk::with_size("1G").validate().unwrap();
        Disk::with_backing_file("/tmp/x.qcow2").validate().unwrap();
    }

    #[test]
    fn test_qemu_img_args() {
        let d = Disk::with_size("1G");
        assert_eq!(
            d.qemu_img_args(Path::new("/var/tmp/d1"), None),
            ["create", "-f", "qcow2", "/var/tmp/d1", "-o", "nocow=on", "1G"]
        );

        let overlay = Disk::with_backing_file("img.qcow2");
        let args = overlay.qemu_img_args(
            Path::new("/var/tmp/d2"),
            Some(Path::new("/srv/builds/img.qcow2")),
        );
        assert_eq!(
            args[5],
            "nocow=on,backing_file=/srv/builds/img.qcow2,lazy_refcounts=on,backing_fmt=qcow2"
        );
        assert_eq!(args.len(), 6);

        let raw = Disk {
            backing_format: Some("raw".into()),
            ..Disk::with_backing_file("img.raw")
        };
        let args = raw.qemu_img_args(Path::new("/d"), Some(Path::new("/img.raw")));
        assert!(args[5].ends_with(",backing_fmt=raw"));
    }

    #[test]
    fn test_device_options() {
        let d = Disk::with_size("1G");
        assert_eq!(d.device_options(true, 1), ["serial=primary-disk", "bootindex=1"]);
        assert_eq!(d.device_options(false, 3), ["serial=disk3"]);

        let named = parse_disk_spec("1G:serial=data,4k").unwrap();
        assert_eq!(
            named.device_options(false, 2),
            [
                "serial=data",
                "physical_block_size=4096,logical_block_size=4096"
            ]
        );
    }

    #[test]
    fn test_resolve_backing_file_follows_symlinks() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("build-42.qcow2");
        std::fs::write(&real, b"").unwrap();
        let latest = dir.path().join("latest.qcow2");
        std::os::unix::fs::symlink(&real, &latest).unwrap();

        let resolved = resolve_backing_file(&latest).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&real).unwrap());

        let procfd = resolve_backing_file(Path::new("/proc/self/fd/0")).unwrap();
        assert_eq!(procfd, Path::new("/proc/self/fd/0"));
    }
}
