use std::fmt;
use std::io;
use std::time::Duration;

/// Errors callers are expected to tell apart.
///
/// Everything in the crate returns `anyhow::Result`; these variants travel
/// inside the `anyhow::Error` and can be recovered with
/// `err.downcast_ref::<vmflight::Error>()`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no free interfaces left on segment {segment} (capacity {capacity})")]
    InterfacesExhausted { segment: String, capacity: usize },

    #[error("unknown network segment: {0}")]
    UnknownSegment(String),

    #[error("unsupported architecture pairing: host {host}, guest {guest}")]
    UnsupportedArch { host: String, guest: String },

    #[error("firmware {firmware} is not supported on {arch}")]
    UnsupportedFirmware { arch: String, firmware: String },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("boot-started signal: {0}")]
    BootSignal(String),

    #[error("entered emergency.target in initramfs")]
    InitramfsEmergency,

    #[error("{}", TeardownDisplay(.errors))]
    Teardown { errors: Vec<anyhow::Error> },

    #[error("dialing {addr} failed after {attempts} attempts")]
    DialExhausted {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("remote command exited with status {status}: {stderr}")]
    RemoteCommand { status: u32, stderr: String },

    #[error("invalid install: {0}")]
    InvalidInstall(String),

    #[error("invalid leap second: {0}")]
    InvalidLeapSecond(String),

    #[error("config already set on this builder")]
    ConfigAlreadySet,

    #[error("{0} has been destroyed")]
    Destroyed(String),
}

impl Error {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            after,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// Returns true if `err` carries a [`Error::Timeout`].
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Error>().is_some_and(Error::is_timeout)
}

struct TeardownDisplay<'a>(&'a [anyhow::Error]);

impl fmt::Display for TeardownDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} teardown error(s): ", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{:#}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_lists_every_error() {
        let err = Error::Teardown {
            errors: vec![anyhow::anyhow!("first"), anyhow::anyhow!("second")],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 teardown error(s)"));
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
    }

    #[test]
    fn test_timeout_is_distinguishable() {
        let err: anyhow::Error = Error::timeout("boot", Duration::from_secs(1)).into();
        assert!(is_timeout(&err));

        let hard: anyhow::Error = Error::BootSignal("eof".into()).into();
        assert!(!is_timeout(&hard));

        let plain = anyhow::anyhow!("plain failure");
        assert!(!is_timeout(&plain));
    }
}
