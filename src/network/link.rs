//! Bridge and TAP plumbing through `ip`.
//!
//! These are blocking calls meant to run on an [`NsExecutor`] worker, so they
//! act on whatever namespace the calling thread is in.
//!
//! [`NsExecutor`]: super::namespace::NsExecutor

use anyhow::{bail, Context, Result};
use std::process::Command;
use tracing::{debug, warn};

use crate::utils::run_checked_sync;

fn ip(args: &[&str]) -> Result<()> {
    run_checked_sync(Command::new("ip").args(args), &format!("ip {}", args.join(" ")))?;
    Ok(())
}

/// Create a bridge with a fixed MAC and bring it up with the given addresses.
///
/// Addresses are in CIDR form, e.g. `10.0.0.1/24`.
pub fn create_bridge(name: &str, mac: &str, addrs: &[String]) -> Result<()> {
    debug!(bridge = %name, mac = %mac, "creating bridge");
    ip(&["link", "add", name, "address", mac, "type", "bridge"])
        .with_context(|| format!("creating bridge {}", name))?;
    for addr in addrs {
        ip(&["addr", "add", addr, "dev", name])
            .with_context(|| format!("adding {} to {}", addr, name))?;
    }
    ip(&["link", "set", name, "up"]).with_context(|| format!("bringing up {}", name))?;
    Ok(())
}

pub fn set_loopback_up() -> Result<()> {
    ip(&["link", "set", "lo", "up"]).context("bringing up loopback")
}

/// Create a TAP device, enslave it to `bridge`, and bring it up.
pub fn create_tap(tap: &str, bridge: &str) -> Result<()> {
    debug!(tap = %tap, bridge = %bridge, "creating TAP device");
    ip(&["tuntap", "add", tap, "mode", "tap"])
        .with_context(|| format!("creating TAP device {}", tap))?;
    if let Err(e) = ip(&["link", "set", tap, "master", bridge])
        .and_then(|_| ip(&["link", "set", tap, "up"]))
    {
        let _ = delete_link(tap);
        return Err(e.context(format!("attaching {} to {}", tap, bridge)));
    }
    Ok(())
}

/// Delete a link. A link that no longer exists is not an error.
pub fn delete_link(name: &str) -> Result<()> {
    let output = Command::new("ip")
        .args(["link", "del", name])
        .output()
        .context("running ip link del")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Cannot find device") {
            warn!(link = %name, "link already deleted");
            return Ok(());
        }
        bail!("failed to delete link {}: {}", name, stderr.trim());
    }
    Ok(())
}

/// TAP device name for a machine id. Interface names are capped at 15 bytes.
pub fn tap_name(id: &str) -> String {
    let short: String = id.chars().filter(|c| *c != '-').take(8).collect();
    format!("tap{}", short)
}
