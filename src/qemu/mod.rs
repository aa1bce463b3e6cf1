//! QEMU process construction across architectures and firmware.

pub mod arch;
pub mod builder;
pub mod disk;
pub mod instance;
pub mod qmp;

pub use arch::{Accel, Arch, Firmware, Platform};
pub use builder::{HostForwardPort, PreparedQemu, QemuBuilder, IGNITION_JOURNAL_CHANNEL};
pub use disk::{parse_disk_spec, Channel, Disk};
pub use instance::QemuInstance;
pub use qmp::QmpClient;
