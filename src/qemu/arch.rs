use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Guest (and host) CPU architectures QEMU can run for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    S390x,
    Ppc64le,
}

impl Arch {
    /// Architecture of the machine we are running on.
    pub fn host() -> Result<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Ok(Arch::X86_64),
            "aarch64" => Ok(Arch::Aarch64),
            "s390x" => Ok(Arch::S390x),
            "powerpc64" if cfg!(target_endian = "little") => Ok(Arch::Ppc64le),
            other => Err(anyhow!("unsupported host architecture: {}", other)),
        }
    }

    /// RPM-style name, as used in build metadata and kernel packages.
    pub fn rpm_name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::S390x => "s390x",
            Arch::Ppc64le => "ppc64le",
        }
    }

    pub fn qemu_binary(self) -> &'static str {
        match self {
            Arch::X86_64 => "qemu-system-x86_64",
            Arch::Aarch64 => "qemu-system-aarch64",
            Arch::S390x => "qemu-system-s390x",
            Arch::Ppc64le => "qemu-system-ppc64",
        }
    }

    /// `-machine` value without the accelerator.
    fn machine(self) -> &'static str {
        match self {
            Arch::X86_64 => "",
            Arch::Aarch64 => "virt,gic-version=max",
            Arch::S390x => "s390-ccw-virtio",
            Arch::Ppc64le => "pseries,kvm-type=HV,vsmt=8,cap-fwnmi=off",
        }
    }

    /// Bus suffix for virtio devices.
    pub fn virtio_suffix(self) -> &'static str {
        match self {
            Arch::S390x => "ccw",
            _ => "pci",
        }
    }

    /// Guest memory in MiB when the caller does not pick one.
    pub fn default_memory(self) -> u32 {
        match self {
            Arch::X86_64 => 1024,
            Arch::Aarch64 | Arch::S390x | Arch::Ppc64le => 2048,
        }
    }

    /// Kernel console device.
    pub fn console(self) -> &'static str {
        match self {
            Arch::X86_64 => "ttyS0",
            Arch::Ppc64le => "hvc0",
            Arch::Aarch64 => "ttyAMA0",
            Arch::S390x => "ttysclp0",
        }
    }

    /// Whether the board accepts Ignition over `-fw_cfg`.
    pub fn supports_fw_cfg(self) -> bool {
        !matches!(self, Arch::S390x | Arch::Ppc64le)
    }

    /// Whether the guest cannot boot once from the network, so the host must
    /// rewrite bootindex after install starts.
    pub fn needs_boot_order_switch(self) -> bool {
        matches!(self, Arch::Aarch64 | Arch::S390x)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rpm_name())
    }
}

impl FromStr for Arch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "x86_64" | "amd64" | "amd64-usr" => Ok(Arch::X86_64),
            "aarch64" | "arm64" | "arm64-usr" => Ok(Arch::Aarch64),
            "s390x" => Ok(Arch::S390x),
            "ppc64le" => Ok(Arch::Ppc64le),
            other => Err(anyhow!("unknown architecture or board: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Firmware {
    #[default]
    Bios,
    Uefi,
    UefiSecure,
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Firmware::Bios => "bios",
            Firmware::Uefi => "uefi",
            Firmware::UefiSecure => "uefi-secure",
        })
    }
}

impl FromStr for Firmware {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bios" => Ok(Firmware::Bios),
            "uefi" => Ok(Firmware::Uefi),
            "uefi-secure" => Ok(Firmware::UefiSecure),
            other => Err(anyhow!("unknown firmware: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accel {
    Kvm,
    Tcg,
}

/// A validated (host, guest, accelerator) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub host: Arch,
    pub guest: Arch,
    pub accel: Accel,
}

impl Platform {
    /// Pick how `guest` runs on `host`.
    ///
    /// Native guests use KVM unless `allow_kvm` is false. x86_64 and aarch64
    /// can emulate each other with TCG; nothing else crosses.
    pub fn resolve(host: Arch, guest: Arch, allow_kvm: bool) -> Result<Self> {
        let accel = match (host, guest) {
            (h, g) if h == g => {
                if allow_kvm {
                    Accel::Kvm
                } else {
                    Accel::Tcg
                }
            }
            (Arch::X86_64, Arch::Aarch64) | (Arch::Aarch64, Arch::X86_64) => Accel::Tcg,
            _ => {
                return Err(Error::UnsupportedArch {
                    host: host.to_string(),
                    guest: guest.to_string(),
                }
                .into())
            }
        };
        Ok(Self { host, guest, accel })
    }

    pub fn is_cross(&self) -> bool {
        self.host != self.guest
    }

    /// Binary plus `-machine`/`-cpu` arguments.
    pub fn base_args(&self) -> Vec<String> {
        let accel = match self.accel {
            Accel::Kvm => "accel=kvm",
            Accel::Tcg => "accel=tcg",
        };
        let machine = match self.guest.machine() {
            "" => accel.to_string(),
            m => format!("{},{}", m, accel),
        };
        let mut args = vec![
            self.guest.qemu_binary().to_string(),
            "-machine".to_string(),
            machine,
        ];
        if self.accel == Accel::Kvm {
            args.extend(["-cpu".to_string(), "host".to_string()]);
        } else if self.is_cross() {
            args.extend(["-cpu".to_string(), "max".to_string()]);
        }
        args
    }

    /// A virtio device argument with the guest's bus suffix.
    pub fn virtio(&self, device: &str, args: &str) -> String {
        format!("virtio-{}-{},{}", device, self.guest.virtio_suffix(), args)
    }

    /// Check that `firmware` can boot this guest.
    pub fn check_firmware(&self, firmware: Firmware) -> Result<()> {
        let ok = match (self.guest, firmware) {
            (_, Firmware::Bios) => true,
            (Arch::X86_64, _) => true,
            (Arch::Aarch64, Firmware::Uefi) => true,
            _ => false,
        };
        if !ok {
            return Err(Error::UnsupportedFirmware {
                arch: self.guest.to_string(),
                firmware: firmware.to_string(),
            }
            .into());
        }
        Ok(())
    }
}
