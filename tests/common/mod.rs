// Common test utilities for vmflight integration tests
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;

use vmflight::config::FlightOptions;
use vmflight::logging;

static INIT: Once = Once::new();

/// Route crate tracing through the test harness capture.
pub fn init_logging() {
    INIT.call_once(logging::init_for_tests);
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// True when every named binary is on `$PATH`.
pub fn have_binaries(names: &[&str]) -> bool {
    names.iter().all(|n| vmflight::utils::binary_in_path(n))
}

/// Returns false (and says why) when the test can't run on this host.
pub fn require_root_and(test: &str, binaries: &[&str]) -> bool {
    if !is_root() {
        eprintln!("Skipping {} - requires root", test);
        return false;
    }
    if !have_binaries(binaries) {
        eprintln!("Skipping {} - requires {}", test, binaries.join(", "));
        return false;
    }
    true
}

/// Boot image for scenario tests, from `VMFLIGHT_TEST_IMAGE`.
pub fn test_image() -> Option<PathBuf> {
    std::env::var_os("VMFLIGHT_TEST_IMAGE").map(PathBuf::from)
}

/// Flight options with fast dial retries and no NTP.
pub fn test_options(name: &str) -> FlightOptions {
    FlightOptions {
        base_name: name.to_string(),
        disk_image: test_image(),
        ntp: false,
        ssh_dial_retries: 2,
        ssh_dial_backoff_ms: 100,
        ssh_dial_timeout_ms: 1000,
        ..FlightOptions::default()
    }
}
