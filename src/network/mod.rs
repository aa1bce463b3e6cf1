//! Isolated network fabric: namespace, virtual LAN, time service, and SSH.

pub mod dialer;
pub mod dnsmasq;
pub mod link;
pub mod namespace;
pub mod ntp;
pub mod ssh;

pub use dialer::{Dialer, NsDialer, RetryDialer, TcpDialer};
pub use dnsmasq::{Interface, Segment, VirtualNetwork};
pub use namespace::{NsExecutor, NsGuard, NsHandle};
pub use ntp::NtpServer;
pub use ssh::{ensure_port_suffix, CommandOutput, SshAgent, SshClient};
