use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::info;

use super::http::AssetServer;
use super::{
    abandon, base_kargs, Install, InstalledMachine, BOOT_STARTED_CHANNEL, BOOT_STARTED_UNIT,
};
use crate::error::Error;
use crate::paths;
use crate::platform::conf::{RenderedConfig, UnitState};
use crate::qemu::{Arch, Firmware, QemuBuilder, QemuInstance};
use crate::utils::{abs_symlink, cat, copy_reflink, run_checked};

const DEFAULT_TFTP_IPV4: &str = "192.168.76.2";
const PXE_MAC: &str = "52:54:00:12:34:56";
const SYSLINUX_DIR: &str = "/usr/share/syslinux";
const PXE_IMAGES: [&str; 2] = ["pxelinux.0", "ldlinux.c32"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootType {
    /// pxelinux menu
    Pxe,
    /// GRUB network directory
    Grub,
}

/// How one architecture boots from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PxeSetup {
    pub tftp_ip: &'static str,
    pub boot_type: BootType,
    pub network_device: &'static str,
    /// `None` boots once from the network through an option ROM
    pub bootindex: Option<&'static str>,
    /// Boot image copied into the TFTP root; `None` on s390x, which builds its own
    pub image_path: Option<&'static str>,
    pub boot_file: String,
}

impl PxeSetup {
    pub fn for_platform(arch: Arch, firmware: Firmware) -> Self {
        let grub = |network_device: &'static str,
                    boot_file: &str,
                    image_path: Option<&'static str>,
                    bootindex: Option<&'static str>| Self {
            tftp_ip: DEFAULT_TFTP_IPV4,
            boot_type: BootType::Grub,
            network_device,
            bootindex,
            image_path,
            boot_file: boot_file.to_string(),
        };
        match arch {
            // Secure-boot UEFI netboots pxelinux like BIOS; only plain UEFI chains into grub.
            Arch::X86_64 if firmware == Firmware::Uefi => grub(
                "e1000",
                "/boot/grub2/grubx64.efi",
                Some("/boot/efi/EFI/fedora/grubx64.efi"),
                // The blank disk falls through to the network on first boot.
                Some("2"),
            ),
            Arch::X86_64 => Self {
                tftp_ip: DEFAULT_TFTP_IPV4,
                boot_type: BootType::Pxe,
                network_device: "e1000",
                bootindex: None,
                image_path: Some("/usr/share/syslinux/"),
                boot_file: String::new(),
            },
            Arch::Aarch64 => grub(
                "virtio-net-pci",
                "/boot/grub2/grubaa64.efi",
                Some("/boot/efi/EFI/fedora/grubaa64.efi"),
                Some("1"),
            ),
            Arch::Ppc64le => grub(
                "virtio-net-pci",
                "/boot/grub2/powerpc-ieee1275/core.elf",
                None,
                None,
            ),
            Arch::S390x => Self {
                tftp_ip: super::DEFAULT_QEMU_HOST_IPV4,
                boot_type: BootType::Pxe,
                network_device: "virtio-net-ccw",
                bootindex: Some("1"),
                image_path: None,
                boot_file: String::new(),
            },
        }
    }

    /// QEMU arguments for the PXE NIC and its usermode backend.
    pub fn qemu_args(&self, tftp_dir: &Path) -> Vec<String> {
        let mut args = Vec::new();
        let mut device = format!("{},netdev=mynet0,mac={}", self.network_device, PXE_MAC);
        match self.bootindex {
            Some(index) => device.push_str(&format!(",bootindex={}", index)),
            None => args.extend(
                ["-boot", "once=n", "-option-rom", "/usr/share/qemu/pxe-rtl8139.rom"]
                    .map(String::from),
            ),
        }
        args.extend(["-device".to_string(), device]);
        let mut netdev = format!(
            "user,id=mynet0,tftp={},bootfile={}",
            tftp_dir.display(),
            self.boot_file
        );
        if self.tftp_ip != super::DEFAULT_QEMU_HOST_IPV4 {
            netdev.push_str(",net=192.168.76.0/24,dhcpstart=192.168.76.9");
        }
        args.extend(["-netdev".to_string(), netdev]);
        args
    }
}

/// Live kernel artifacts, relative to the build directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSetup {
    pub kernel: String,
    pub initramfs: String,
    pub rootfs: String,
}

/// Arguments telling coreos-installer what to write where.
pub fn install_kargs(base_url: &str, metal_name: &str, offline: bool, insecure: bool) -> Vec<String> {
    let mut kargs = vec![
        "coreos.inst.install_dev=/dev/vda".to_string(),
        format!("coreos.inst.ignition_url={}/config.ign", base_url),
    ];
    if !offline {
        kargs.push(format!("coreos.inst.image_url={}/{}", base_url, metal_name));
    }
    if insecure {
        kargs.push("coreos.inst.insecure".to_string());
    }
    kargs
}

/// The complete live kernel command line for a PXE install.
pub fn pxe_kargs(
    arch: Arch,
    user: &[String],
    base_url: &str,
    install: Vec<String>,
    rootfs_url: Option<&str>,
) -> Vec<String> {
    let mut kargs = base_kargs(arch);
    kargs.extend(user.iter().cloned());
    kargs.push(format!("ignition.config.url={}/pxe-live.ign", base_url));
    kargs.extend(install);
    if let Some(rootfs) = rootfs_url {
        kargs.push(format!("coreos.live.rootfs_url={}", rootfs));
    }
    kargs
}

pub fn pxelinux_config(kern: &KernelSetup, kargs: &str) -> String {
    format!(
        "DEFAULT pxeboot\nTIMEOUT 20\nPROMPT 0\nLABEL pxeboot\n    KERNEL {}\n    APPEND initrd={} {}\n",
        kern.kernel, kern.initramfs, kargs
    )
}

pub fn grub_config(kern: &KernelSetup, kargs: &str) -> String {
    format!(
        r#"default=0
timeout=1
menuentry "CoreOS (BIOS/UEFI)" {{
    echo "Loading kernel"
    linux /{} {}
    echo "Loading initrd"
    initrd {}
}}
"#,
        kern.kernel, kargs, kern.initramfs
    )
}

/// Scratch state for one PXE install until the VM starts.
struct InstallerRun {
    builder: QemuBuilder,
    arch: Arch,
    tempdir: TempDir,
    tftp_dir: PathBuf,
    build_dir: PathBuf,
    metal_name: String,
    base_url: String,
    kern: KernelSetup,
    pxe: PxeSetup,
    pxe_append_rootfs: bool,
    insecure: bool,
    server: Option<AssetServer>,
}

impl Install {
    /// Network boot the live installer and install the metal image to disk.
    ///
    /// With `offline` the installer writes the image it carries instead of
    /// fetching one.
    pub async fn pxe(
        self,
        kargs: &[String],
        live: Box<dyn RenderedConfig>,
        target: Box<dyn RenderedConfig>,
        offline: bool,
    ) -> Result<InstalledMachine> {
        let images = &self.build.meta.images;
        self.metal_image()?;
        let missing = |what: &str| {
            Error::InvalidInstall(format!("build {} has no live {}", self.build.meta.name, what))
        };
        let kern = KernelSetup {
            kernel: images.live_kernel.as_ref().ok_or_else(|| missing("kernel"))?.path.clone(),
            initramfs: images
                .live_initramfs
                .as_ref()
                .ok_or_else(|| missing("initramfs"))?
                .path
                .clone(),
            rootfs: images.live_rootfs.as_ref().ok_or_else(|| missing("rootfs"))?.path.clone(),
        };

        let mut run = self
            .setup(kern, live, target)
            .await
            .context("testing live installer")?;
        let server = run.server.take();
        match run.boot(kargs, offline).await {
            Ok((qemu, tempdir, channel)) => Ok(InstalledMachine::new(qemu, tempdir, server, channel)),
            Err(e) => {
                abandon(server).await;
                Err(e.context("testing live installer"))
            }
        }
    }

    async fn setup(
        self,
        kern: KernelSetup,
        mut live: Box<dyn RenderedConfig>,
        target: Box<dyn RenderedConfig>,
    ) -> Result<InstallerRun> {
        let metal = self.metal_image()?.path.clone();
        let tempdir = tempfile::Builder::new()
            .prefix("vmflight-pxe")
            .tempdir_in(paths::tmp_dir())
            .context("creating installer tempdir")?;
        let tftp_dir = tempdir.path().join("tftp");
        std::fs::create_dir(&tftp_dir).context("creating tftp dir")?;

        let build_dir = self.build.dir.clone();
        target.write_file(&tftp_dir.join("config.ign"))?;
        live.add_autologin();
        live.add_systemd_unit("boot-started.service", BOOT_STARTED_UNIT, UnitState::Enable);
        live.write_file(&tftp_dir.join("pxe-live.ign"))?;

        for name in [&kern.kernel, &kern.initramfs, &kern.rootfs] {
            abs_symlink(&build_dir.join(name), &tftp_dir.join(name))?;
        }
        if self.pxe_append_rootfs {
            let initrd = tftp_dir.join(&kern.initramfs);
            std::fs::remove_file(&initrd)
                .with_context(|| format!("removing {}", initrd.display()))?;
            cat(
                &initrd,
                &[&build_dir.join(&kern.initramfs), &build_dir.join(&kern.rootfs)],
            )
            .context("appending rootfs to initramfs")?;
        }
        abs_symlink(&build_dir.join(&metal), &tftp_dir.join(&metal))
            .context("setting up metal image")?;

        let arch = self.builder.platform().guest;
        let pxe = PxeSetup::for_platform(arch, self.builder.firmware);

        let server = AssetServer::start(&tftp_dir, "0.0.0.0:0").await?;
        let base_url = format!("http://{}:{}", pxe.tftp_ip, server.port());

        Ok(InstallerRun {
            builder: self.builder,
            arch,
            tempdir,
            tftp_dir,
            build_dir,
            metal_name: metal,
            base_url,
            kern,
            pxe,
            pxe_append_rootfs: self.pxe_append_rootfs,
            insecure: self.insecure,
            server: Some(server),
        })
    }
}

impl InstallerRun {
    async fn boot(
        mut self,
        kargs: &[String],
        offline: bool,
    ) -> Result<(QemuInstance, TempDir, std::os::fd::OwnedFd)> {
        let channel = self.builder.virtio_channel_read(BOOT_STARTED_CHANNEL)?;

        let install = install_kargs(&self.base_url, &self.metal_name, offline, self.insecure);
        let rootfs_url = (!self.pxe_append_rootfs)
            .then(|| format!("{}/{}", self.base_url, self.kern.rootfs));
        let kargs = pxe_kargs(self.arch, kargs, &self.base_url, install, rootfs_url.as_deref());
        self.complete_pxe_setup(&kargs.join(" ")).await?;

        let args = self.pxe.qemu_args(&self.tftp_dir);
        self.builder.append(args);
        let qemu = self.builder.exec().await?;
        info!(target: "qemu", pid = ?qemu.pid(), base_url = %self.base_url, "PXE installer started");
        Ok((qemu, self.tempdir, channel))
    }

    async fn complete_pxe_setup(&mut self, kargs: &str) -> Result<()> {
        match self.pxe.boot_type {
            BootType::Pxe => {
                let cfg_dir = self.tftp_dir.join("pxelinux.cfg");
                std::fs::create_dir(&cfg_dir).context("creating pxelinux.cfg")?;
                let cfg = cfg_dir.join("default");
                let contents = if self.arch == Arch::S390x {
                    kargs.to_string()
                } else {
                    pxelinux_config(&self.kern, kargs)
                };
                std::fs::write(&cfg, contents)
                    .with_context(|| format!("writing {}", cfg.display()))?;

                match self.pxe.image_path {
                    Some(_) => {
                        for img in PXE_IMAGES {
                            copy_reflink(&Path::new(SYSLINUX_DIR).join(img), &self.tftp_dir).await?;
                        }
                    }
                    None => {
                        run_checked(
                            Command::new("/usr/bin/mk-s390image")
                                .arg(self.build_dir.join(&self.kern.kernel))
                                .arg("-r")
                                .arg(self.build_dir.join(&self.kern.initramfs))
                                .arg("-p")
                                .arg(&cfg)
                                .arg(self.tftp_dir.join(PXE_IMAGES[0])),
                            "mk-s390image",
                        )
                        .await?;
                    }
                }
                self.pxe.boot_file = format!("/{}", PXE_IMAGES[0]);
            }
            BootType::Grub => {
                run_checked(
                    Command::new("grub2-mknetdir")
                        .arg(format!("--net-directory={}", self.tftp_dir.display())),
                    "grub2-mknetdir",
                )
                .await?;
                let grub_dir = self.tftp_dir.join("boot/grub2");
                if let Some(image) = self.pxe.image_path {
                    copy_reflink(Path::new(image), &grub_dir).await?;
                }
                let cfg = grub_dir.join("grub.cfg");
                std::fs::write(&cfg, grub_config(&self.kern, kargs))
                    .with_context(|| format!("writing {}", cfg.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kern() -> KernelSetup {
        KernelSetup {
            kernel: "live-kernel".into(),
            initramfs: "live-initramfs.img".into(),
            rootfs: "live-rootfs.img".into(),
        }
    }

    #[test]
    fn test_pxe_setup_table() {
        let bios = PxeSetup::for_platform(Arch::X86_64, Firmware::Bios);
        assert_eq!(bios.boot_type, BootType::Pxe);
        assert_eq!(bios.network_device, "e1000");
        assert_eq!(bios.bootindex, None);

        let uefi = PxeSetup::for_platform(Arch::X86_64, Firmware::Uefi);
        assert_eq!(uefi.boot_type, BootType::Grub);
        assert_eq!(uefi.boot_file, "/boot/grub2/grubx64.efi");
        assert_eq!(uefi.bootindex, Some("2"));

        let secure = PxeSetup::for_platform(Arch::X86_64, Firmware::UefiSecure);
        assert_eq!(secure.boot_type, BootType::Pxe);
        assert_eq!(secure.image_path, Some("/usr/share/syslinux/"));
        assert_eq!(secure.bootindex, None);

        let arm = PxeSetup::for_platform(Arch::Aarch64, Firmware::Uefi);
        assert_eq!(arm.network_device, "virtio-net-pci");
        assert_eq!(arm.bootindex, Some("1"));

        let ppc = PxeSetup::for_platform(Arch::Ppc64le, Firmware::Bios);
        assert_eq!(ppc.boot_file, "/boot/grub2/powerpc-ieee1275/core.elf");
        assert_eq!(ppc.image_path, None);

        let s390 = PxeSetup::for_platform(Arch::S390x, Firmware::Bios);
        assert_eq!(s390.tftp_ip, "10.0.2.2");
        assert_eq!(s390.network_device, "virtio-net-ccw");
        assert_eq!(s390.image_path, None);
    }

    #[test]
    fn test_qemu_args() {
        let tftp = Path::new("/var/tmp/vmflight-pxe1/tftp");
        let mut bios = PxeSetup::for_platform(Arch::X86_64, Firmware::Bios);
        bios.boot_file = "/pxelinux.0".into();
        assert_eq!(
            bios.qemu_args(tftp),
            [
                "-boot",
                "once=n",
                "-option-rom",
                "/usr/share/qemu/pxe-rtl8139.rom",
                "-device",
                "e1000,netdev=mynet0,mac=52:54:00:12:34:56",
                "-netdev",
                "user,id=mynet0,tftp=/var/tmp/vmflight-pxe1/tftp,bootfile=/pxelinux.0,net=192.168.76.0/24,dhcpstart=192.168.76.9",
            ]
        );

        let s390 = PxeSetup::for_platform(Arch::S390x, Firmware::Bios);
        let args = s390.qemu_args(tftp);
        assert_eq!(args[1], "virtio-net-ccw,netdev=mynet0,mac=52:54:00:12:34:56,bootindex=1");
        assert!(!args[3].contains("dhcpstart"));
    }

    #[test]
    fn test_pxe_kargs_console_and_urls() {
        let base = "http://192.168.76.2:8080";
        for arch in [Arch::X86_64, Arch::Aarch64, Arch::Ppc64le, Arch::S390x] {
            let install = install_kargs(base, "metal.raw", false, false);
            let kargs = pxe_kargs(arch, &[], base, install, None);
            let console = format!("console={}", arch.console());
            assert_eq!(kargs.iter().filter(|k| **k == console).count(), 1);
            assert!(kargs.contains(&format!("ignition.config.url={}/pxe-live.ign", base)));
        }
    }

    #[test]
    fn test_install_kargs_offline() {
        let base = "http://192.168.76.2:8080";
        let online = install_kargs(base, "metal.raw", false, true);
        assert_eq!(
            online,
            [
                "coreos.inst.install_dev=/dev/vda",
                "coreos.inst.ignition_url=http://192.168.76.2:8080/config.ign",
                "coreos.inst.image_url=http://192.168.76.2:8080/metal.raw",
                "coreos.inst.insecure",
            ]
        );
        let offline = install_kargs(base, "metal.raw", true, false);
        assert!(!offline.iter().any(|k| k.starts_with("coreos.inst.image_url=")));
        assert!(offline.iter().any(|k| k.starts_with("coreos.inst.ignition_url=")));
    }

    #[test]
    fn test_pxe_kargs_order() {
        let base = "http://h:1";
        let kargs = pxe_kargs(
            Arch::X86_64,
            &["foo=bar".to_string()],
            base,
            vec!["coreos.inst.install_dev=/dev/vda".into()],
            Some("http://h:1/live-rootfs.img"),
        );
        let pos = |needle: &str| kargs.iter().position(|k| k.starts_with(needle)).unwrap();
        assert!(pos("console=") < pos("foo=bar"));
        assert!(pos("foo=bar") < pos("ignition.config.url="));
        assert!(pos("ignition.config.url=") < pos("coreos.inst.install_dev="));
        assert_eq!(kargs.last().unwrap(), "coreos.live.rootfs_url=http://h:1/live-rootfs.img");
    }

    #[test]
    fn test_boot_configs() {
        let cfg = pxelinux_config(&kern(), "a=b");
        assert!(cfg.starts_with("DEFAULT pxeboot\n"));
        assert!(cfg.contains("KERNEL live-kernel\n"));
        assert!(cfg.contains("APPEND initrd=live-initramfs.img a=b\n"));

        let grub = grub_config(&kern(), "a=b");
        assert!(grub.contains("linux /live-kernel a=b\n"));
        assert!(grub.contains("initrd live-initramfs.img\n"));
        assert!(grub.contains("menuentry \"CoreOS (BIOS/UEFI)\" {"));
    }
}
