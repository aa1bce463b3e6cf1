use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;
use crate::qemu::{Arch, Firmware};

/// Options shared by every cluster of one flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlightOptions {
    /// Prefix for cluster names
    pub base_name: String,
    /// Guest architecture (RPM arch or legacy board name); host arch when unset
    pub board: Option<String>,
    /// Boot disk image for local machines
    pub disk_image: Option<PathBuf>,
    pub firmware: Firmware,
    /// Guest memory in MiB, 0 selects the architecture default
    pub memory: u32,
    pub processors: i32,
    /// Fixed SSH agent socket directory
    pub ssh_dir: Option<PathBuf>,
    /// Run the NTP service inside the namespace
    pub ntp: bool,
    pub ssh_dial_retries: u32,
    pub ssh_dial_backoff_ms: u64,
    pub ssh_dial_timeout_ms: u64,
    /// Number of OS threads dedicated to namespace work
    pub netns_threads: usize,
}

impl Default for FlightOptions {
    fn default() -> Self {
        Self {
            base_name: "vmflight".to_string(),
            board: None,
            disk_image: None,
            firmware: Firmware::Bios,
            memory: 0,
            processors: 1,
            ssh_dir: None,
            ntp: true,
            ssh_dial_retries: 7,
            ssh_dial_backoff_ms: 1000,
            ssh_dial_timeout_ms: 10_000,
            netns_threads: 2,
        }
    }
}

impl FlightOptions {
    /// Load options from a YAML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading flight options {}", path.display()))?;
        let opts: Self = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing flight options {}", path.display()))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Overlay environment overrides.
    pub fn apply_env(mut self) -> Self {
        if let Some(dir) = paths::ssh_dir_override() {
            self.ssh_dir = Some(dir);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_base_name(&self.base_name)?;
        if self.netns_threads == 0 {
            bail!("netns-threads must be at least 1");
        }
        if let Some(board) = &self.board {
            board.parse::<Arch>()?;
        }
        Ok(())
    }

    /// Guest architecture: the configured board, or the host.
    pub fn guest_arch(&self) -> Result<Arch> {
        match &self.board {
            Some(board) => board.parse(),
            None => Arch::host(),
        }
    }

    pub fn dial_backoff(&self) -> Duration {
        Duration::from_millis(self.ssh_dial_backoff_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.ssh_dial_timeout_ms)
    }
}

/// Per-cluster runtime settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuntimeConfig {
    /// Directory the cluster writes machine state and ssh-config into
    pub output_dir: PathBuf,
    /// Skip adding the flight's SSH keys to rendered user data
    pub no_ssh_key_in_user_data: bool,
}

impl RuntimeConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }
}

/// Validate a base name for safe use in paths, interface names, and shell commands.
///
/// Must be 1-63 characters of ASCII alphanumerics, dashes, or underscores,
/// and must not start with a dash.
pub fn validate_base_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("base name cannot be empty");
    }

    if name.len() > 63 {
        bail!("base name must be 63 characters or less, got {}", name.len());
    }

    if name.starts_with('-') {
        bail!("base name cannot start with a dash");
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!(
            "base name must contain only alphanumeric characters, dashes, or underscores: {:?}",
            name
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let opts = FlightOptions::default();
        assert_eq!(opts.base_name, "vmflight");
        assert_eq!(opts.ssh_dial_retries, 7);
        assert!(opts.ntp);
        opts.validate().unwrap();
    }

    #[test]
    fn test_load_yaml_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flight.yaml");
        std::fs::write(
            &path,
            "base-name: kola\nboard: arm64-usr\nfirmware: uefi\nssh-dial-retries: 2\n",
        )
        .unwrap();

        let opts = FlightOptions::load(&path).unwrap();
        assert_eq!(opts.base_name, "kola");
        assert_eq!(opts.firmware, Firmware::Uefi);
        assert_eq!(opts.ssh_dial_retries, 2);
        assert_eq!(opts.ssh_dial_backoff_ms, 1000);
        assert_eq!(opts.guest_arch().unwrap(), Arch::Aarch64);
    }

    #[test]
    fn test_load_rejects_bad_board() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flight.yaml");
        std::fs::write(&path, "board: sparc64\n").unwrap();
        assert!(FlightOptions::load(&path).is_err());
    }

    #[test]
    fn test_validate_base_name() {
        assert!(validate_base_name("kola").is_ok());
        assert!(validate_base_name("kola_run-1").is_ok());
        assert!(validate_base_name("").is_err());
        assert!(validate_base_name("-kola").is_err());
        assert!(validate_base_name("kola/../etc").is_err());
        assert!(validate_base_name(&"a".repeat(64)).is_err());
    }
}
