//! A minimal NTPv4 server for giving guests a controllable clock.

pub mod protocol;
pub mod server;

pub use protocol::{Header, LeapIndicator, Mode, Short, Timestamp};
pub use server::NtpServer;
