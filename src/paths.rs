use std::path::PathBuf;

/// Environment variable selecting a fixed SSH agent socket directory.
pub const SSH_DIR_ENV: &str = "VMFLIGHT_SSH_DIR";

/// Presence of this variable forces software emulation instead of KVM.
pub const NO_KVM_ENV: &str = "COSA_NO_KVM";

/// Base directory for VM and installer scratch space. Disk images and ISOs
/// are reflinked here, so it must not be a tmpfs.
pub fn tmp_dir() -> PathBuf {
    PathBuf::from("/var/tmp")
}

/// SSH agent socket directory override, if set.
pub fn ssh_dir_override() -> Option<PathBuf> {
    std::env::var_os(SSH_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Whether KVM acceleration has been disabled through the environment.
pub fn kvm_disabled() -> bool {
    std::env::var_os(NO_KVM_ENV).is_some()
}

/// Path of the ssh-config file written for a cluster's output directory.
pub fn ssh_config_path(output_dir: &std::path::Path) -> PathBuf {
    output_dir.join("ssh-config")
}
