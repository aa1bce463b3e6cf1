use anyhow::{anyhow, bail, Context, Result};
use std::io::{Seek, SeekFrom};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use super::arch::{Arch, Firmware, Platform};
use super::disk::{parse_disk_spec, Channel, Disk};
use super::instance::QemuInstance;
use crate::error::Error;
use crate::network::NsExecutor;
use crate::paths;
use crate::platform::conf::RenderedConfig;
use crate::utils::{copy_reflink, run_checked};

/// Name of the virtio-serial port the initramfs streams failures to.
pub const IGNITION_JOURNAL_CHANNEL: &str = "com.coreos.ignition.journal";

/// Offset of the boot system identifier in the El Torito boot record.
const EL_TORITO_BOOT_ID_OFFSET: u64 = 34823;

/// Size QEMU expects for the aarch64 UEFI variable store.
const AARCH64_VARS_SIZE: u64 = 64 * 1024 * 1024;

const PFLASH: &str = "if=pflash,format=raw";
const PFLASH_CODE: &str = "readonly=on,auto-read-only=off";
const PFLASH_VARS: &str = "readonly=off,auto-read-only=off";

const MAX_PROCESSORS: usize = 16;

/// A guest port exposed on the host loopback by usermode networking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostForwardPort {
    pub service: String,
    /// 0 picks a free port at exec time
    pub host_port: u16,
    pub guest_port: u16,
}

#[derive(Debug)]
struct BootIso {
    path: PathBuf,
    bootindex: Option<String>,
    as_disk: bool,
}

/// Accumulates QEMU arguments and owned resources, then starts one VM.
pub struct QemuBuilder {
    platform: Platform,
    pub firmware: Firmware,
    /// MiB; 0 selects the architecture default
    pub memory: u32,
    /// Negative uses the host CPU count (capped), 0 means 1
    pub processors: i32,
    pub uuid: Option<String>,
    /// Serial console goes here instead of QEMU's stdout
    pub console_file: Option<PathBuf>,
    /// Kernel arguments appended to an attached ISO
    pub append_kernel_args: String,
    pub hostname: Option<String>,
    pub restrict_networking: bool,
    /// Send SIGTERM to QEMU when the spawning thread dies
    pub pdeathsig: bool,

    config: Option<Box<dyn RenderedConfig>>,
    config_file: Option<PathBuf>,
    config_injected: bool,

    iso: Option<BootIso>,
    primary_disk: Option<Disk>,
    primary_is_boot: bool,
    primary_drive: Option<String>,
    disk_id: u32,

    usermode_networking: bool,
    host_forward_ports: Vec<HostForwardPort>,

    virtio_serial_id: u32,
    tempdir: Option<TempDir>,
    fds: Vec<OwnedFd>,
    argv: Vec<String>,
}

impl QemuBuilder {
    /// Builder for `guest` on this host. KVM is used unless `COSA_NO_KVM` is set.
    pub fn new(guest: Arch) -> Result<Self> {
        let allow_kvm = std::env::var_os(paths::NO_KVM_ENV).is_none();
        let platform = Platform::resolve(Arch::host()?, guest, allow_kvm)?;
        Ok(Self::with_platform(platform))
    }

    pub fn with_platform(platform: Platform) -> Self {
        Self {
            platform,
            firmware: Firmware::Bios,
            memory: 0,
            processors: 0,
            uuid: None,
            console_file: None,
            append_kernel_args: String::new(),
            hostname: None,
            restrict_networking: false,
            pdeathsig: true,
            config: None,
            config_file: None,
            config_injected: false,
            iso: None,
            primary_disk: None,
            primary_is_boot: false,
            primary_drive: None,
            disk_id: 0,
            usermode_networking: false,
            host_forward_ports: Vec::new(),
            virtio_serial_id: 0,
            tempdir: None,
            fds: Vec::new(),
            argv: Vec::new(),
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    fn tempdir(&mut self) -> Result<PathBuf> {
        if self.tempdir.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("vmflight-qemu")
                .tempdir_in(paths::tmp_dir())
                .context("creating qemu tempdir")?;
            self.tempdir = Some(dir);
        }
        match &self.tempdir {
            Some(dir) => Ok(dir.path().to_path_buf()),
            None => unreachable!("tempdir was just created"),
        }
    }

    /// Inject this config at boot. Rendered lazily at exec.
    pub fn set_config(&mut self, config: Box<dyn RenderedConfig>) -> Result<()> {
        if self.config.is_some() || self.config_file.is_some() {
            return Err(Error::ConfigAlreadySet.into());
        }
        self.config = Some(config);
        Ok(())
    }

    /// Inject a config already written to disk.
    pub fn set_config_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        if self.config.is_some() || self.config_file.is_some() {
            return Err(Error::ConfigAlreadySet.into());
        }
        self.config_file = Some(path.into());
        Ok(())
    }

    fn render_config(&mut self) -> Result<()> {
        if let Some(config) = self.config.take() {
            let path = self.tempdir()?.join("config.ign");
            config.write_file(&path)?;
            self.config_file = Some(path);
        }
        Ok(())
    }

    pub fn append<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
    }

    /// Pass `fd` to QEMU, returning the `/dev/fdset/N` path that names it.
    pub fn add_fd(&mut self, fd: OwnedFd) -> String {
        self.fds.push(fd);
        format!("/dev/fdset/{}", self.fds.len())
    }

    /// Set the primary disk. It is created at exec so config injection can
    /// see the final config.
    pub fn add_primary_disk(&mut self, disk: Disk) -> Result<()> {
        if self.primary_disk.is_some() {
            bail!("multiple primary disks specified");
        }
        disk.validate()?;
        self.primary_disk = Some(disk);
        Ok(())
    }

    /// Set the primary disk and boot only from it.
    pub fn add_boot_disk(&mut self, disk: Disk) -> Result<()> {
        self.add_primary_disk(disk)?;
        self.primary_is_boot = true;
        Ok(())
    }

    pub async fn add_disk(&mut self, disk: Disk) -> Result<()> {
        self.add_disk_impl(disk, false).await
    }

    pub async fn add_disks_from_specs(&mut self, specs: &[String]) -> Result<()> {
        for spec in specs {
            let disk = parse_disk_spec(spec)
                .with_context(|| format!("parsing additional disk spec {:?}", spec))?;
            self.add_disk(disk)
                .await
                .with_context(|| format!("adding additional disk {:?}", spec))?;
        }
        Ok(())
    }

    async fn add_disk_impl(&mut self, disk: Disk, primary: bool) -> Result<()> {
        self.disk_id += 1;
        let disk_id = self.disk_id;
        let id = format!("d{}", disk_id);
        let dst = self.tempdir()?.join(format!("disk{}.qcow2", disk_id));
        disk.create_image(&dst).await?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&dst)
            .with_context(|| format!("opening disk image {}", dst.display()))?;
        // QEMU holds the only reference from here on, so nothing leaks if we die.
        std::fs::remove_file(&dst).with_context(|| format!("unlinking {}", dst.display()))?;
        let fdset = self.add_fd(file.into());

        let opts = disk.device_options(primary, disk_id);
        let opts = if opts.is_empty() {
            String::new()
        } else {
            format!(",{}", opts.join(","))
        };
        let device = match disk.channel {
            Channel::Virtio => self.platform.virtio("blk", &format!("drive={}{}", id, opts)),
            Channel::Nvme => format!("nvme,drive={}{}", id, opts),
        };
        self.append(["-device".to_string(), device]);
        // The images are ephemeral, so skip lock detection and host caching.
        self.append([
            "-drive".to_string(),
            format!(
                "if=none,id={},file={},auto-read-only=off,cache=unsafe",
                id, fdset
            ),
        ]);
        if primary {
            self.primary_drive = Some(id);
        }
        Ok(())
    }

    /// Attach an installer ISO. With `as_disk` it is attached like a USB
    /// stick and its El Torito record is invalidated so UEFI boots the ESP.
    pub fn add_iso(&mut self, path: impl Into<PathBuf>, bootindex: Option<&str>, as_disk: bool) {
        self.iso = Some(BootIso {
            path: path.into(),
            bootindex: bootindex.map(str::to_string),
            as_disk,
        });
    }

    /// Give the guest a usermode NIC forwarding `ports` from host loopback.
    pub fn enable_usermode_networking(&mut self, ports: Vec<HostForwardPort>) {
        self.usermode_networking = true;
        self.host_forward_ports = ports;
    }

    /// A guest-writable virtio-serial port, `/dev/virtio-ports/<name>` in
    /// the guest. Returns the host read end.
    pub fn virtio_channel_read(&mut self, name: &str) -> Result<OwnedFd> {
        let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .context("creating virtio channel pipe")?;
        if self.virtio_serial_id == 0 {
            self.append(["-device", "virtio-serial"]);
        }
        self.virtio_serial_id += 1;
        let id = format!("virtioserial{}", self.virtio_serial_id);
        let fdset = self.add_fd(write);
        self.append([
            "-chardev".to_string(),
            format!("file,id={},path={},append=on", id, fdset),
            "-device".to_string(),
            format!("virtserialport,chardev={},name={}", id, name),
        ]);
        Ok(read)
    }

    fn setup_networking(&mut self) -> Result<()> {
        let mut netdev = "user,id=eth0".to_string();
        for port in &mut self.host_forward_ports {
            // The port may be taken again before QEMU binds it; accepted for simpler bookkeeping.
            let listener = std::net::TcpListener::bind(("127.0.0.1", port.host_port))
                .with_context(|| format!("reserving host port for {}", port.service))?;
            port.host_port = listener.local_addr()?.port();
            netdev.push_str(&format!(
                ",hostfwd=tcp:127.0.0.1:{}-:{}",
                port.host_port, port.guest_port
            ));
        }
        if let Some(hostname) = &self.hostname {
            netdev.push_str(&format!(",hostname={}", hostname));
        }
        if self.restrict_networking {
            netdev.push_str(",restrict=on");
        }
        let device = self.platform.virtio("net", "netdev=eth0");
        self.append(["-netdev".to_string(), netdev, "-device".to_string(), device]);
        Ok(())
    }

    fn setup_uefi(&mut self, secure: bool) -> Result<()> {
        match self.platform.guest {
            Arch::X86_64 => {
                let variant = if secure { ".secboot" } else { "" };
                let src = format!("/usr/share/edk2/ovmf/OVMF_VARS{}.fd", variant);
                let mut src = std::fs::File::open(&src)
                    .with_context(|| format!("opening UEFI vars template {}", src))?;
                let mut vars = tempfile::tempfile_in(self.tempdir()?)
                    .context("creating UEFI vars file")?;
                std::io::copy(&mut src, &mut vars).context("copying UEFI vars")?;
                vars.seek(SeekFrom::Start(0))?;
                let fdset = self.add_fd(vars.into());
                self.append([
                    "-drive".to_string(),
                    format!(
                        "file=/usr/share/edk2/ovmf/OVMF_CODE{}.fd,{},unit=0,{}",
                        variant, PFLASH, PFLASH_CODE
                    ),
                    "-drive".to_string(),
                    format!("file={},{},unit=1,{}", fdset, PFLASH, PFLASH_VARS),
                    "-machine".to_string(),
                    "q35".to_string(),
                ]);
            }
            Arch::Aarch64 if !secure => {
                let vars = tempfile::tempfile_in(self.tempdir()?)
                    .context("creating UEFI vars file")?;
                vars.set_len(AARCH64_VARS_SIZE).context("sizing UEFI vars")?;
                let fdset = self.add_fd(vars.into());
                self.append([
                    "-drive".to_string(),
                    format!(
                        "file=/usr/share/edk2/aarch64/QEMU_EFI-pflash.raw,{},unit=0,{}",
                        PFLASH, PFLASH_CODE
                    ),
                    "-drive".to_string(),
                    format!("file={},{},unit=1,{}", fdset, PFLASH, PFLASH_VARS),
                ]);
            }
            guest => {
                return Err(Error::UnsupportedFirmware {
                    arch: guest.to_string(),
                    firmware: self.firmware.to_string(),
                }
                .into())
            }
        }
        Ok(())
    }

    async fn setup_iso(&mut self, iso: BootIso) -> Result<()> {
        let path = self.tempdir()?.join("install.iso");
        copy_reflink(&iso.path, &path).await.context("copying iso")?;

        if let Some(config) = &self.config_file {
            if self.config_injected {
                bail!("config already injected");
            }
            let stdin = std::fs::File::open(config)
                .with_context(|| format!("opening config {}", config.display()))?;
            run_checked(
                Command::new("coreos-installer")
                    .args(["iso", "ignition", "embed"])
                    .arg(&path)
                    .stdin(Stdio::from(stdin)),
                "coreos-installer iso ignition embed",
            )
            .await?;
            self.config_injected = true;
        }

        if coreos_installer_supports_iso_kargs().await? {
            let all = format!(
                "console={} {}",
                self.platform.guest.console(),
                self.append_kernel_args
            );
            let result = run_checked(
                Command::new("coreos-installer")
                    .args(["iso", "kargs", "modify", "--append", all.trim_end()])
                    .arg(&path),
                "coreos-installer iso kargs modify",
            )
            .await;
            if let Err(e) = result {
                // Console kargs alone are optional; an old live ISO may refuse them.
                if !self.append_kernel_args.is_empty() {
                    return Err(e.context("appending kernel arguments to ISO; old CoreOS ISO?"));
                }
                warn!(target: "qemu", error = %format!("{:#}", e), "ignoring console karg failure, likely an old CoreOS ISO");
            }
        } else if !self.append_kernel_args.is_empty() {
            bail!("coreos-installer does not support appending kernel args");
        }

        if iso.as_disk {
            let f = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .context("opening ISO image for writing")?;
            f.write_all_at(b"NO", EL_TORITO_BOOT_ID_OFFSET)
                .context("overwriting El Torito signature")?;
        }

        let file = path.display();
        match self.platform.guest {
            Arch::S390x | Arch::Ppc64le | Arch::Aarch64 => {
                if iso.as_disk {
                    bail!("cannot attach ISO as disk; no hybrid ISO on this arch");
                }
                self.append([
                    "-drive".to_string(),
                    format!("file={},id=installiso,index=2,media=cdrom", file),
                ]);
            }
            Arch::X86_64 => {
                let bootindex = iso
                    .bootindex
                    .as_deref()
                    .map(|b| format!(",{}", b))
                    .unwrap_or_default();
                let drive = format!("file={},format=raw,if=none,readonly=on,id=installiso", file);
                let device = if iso.as_disk {
                    self.platform
                        .virtio("blk", &format!("drive=installiso{}", bootindex))
                } else {
                    format!("ide-cd,drive=installiso{}", bootindex)
                };
                self.append(["-drive".to_string(), drive, "-device".to_string(), device]);
            }
        }
        Ok(())
    }

    fn processor_count(&self) -> usize {
        match self.processors {
            n if n < 0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_PROCESSORS),
            0 => 1,
            n => n as usize,
        }
    }

    /// Assemble the full command line and take ownership of every resource
    /// the VM needs.
    pub async fn prepare(mut self) -> Result<PreparedQemu> {
        self.platform.check_firmware(self.firmware)?;
        if self.memory == 0 {
            self.memory = self.platform.guest.default_memory();
        }
        self.render_config().context("rendering config")?;

        let mut argv = self.platform.base_args();
        argv.extend([
            "-m".to_string(),
            self.memory.to_string(),
            "-smp".to_string(),
            self.processor_count().to_string(),
        ]);

        match self.firmware {
            Firmware::Bios => {}
            Firmware::Uefi => self.setup_uefi(false)?,
            Firmware::UefiSecure => self.setup_uefi(true)?,
        }

        argv.extend([
            "-object".to_string(),
            "rng-random,filename=/dev/urandom,id=rng0".to_string(),
            "-device".to_string(),
            self.platform.virtio("rng", "rng=rng0"),
        ]);
        if let Some(uuid) = &self.uuid {
            argv.extend(["-uuid".to_string(), uuid.clone()]);
        }
        argv.extend(["-nographic".to_string(), "-nodefaults".to_string()]);

        if let Some(iso) = self.iso.take() {
            self.setup_iso(iso).await?;
        }
        if let Some(disk) = self.primary_disk.take() {
            self.add_disk_impl(disk, true).await?;
            if self.primary_is_boot {
                argv.extend(["-boot".to_string(), "order=c,strict=on".to_string()]);
            }
        }

        if let Some(config) = self.config_file.clone() {
            if !self.config_injected {
                let config = config.display();
                if self.platform.guest.supports_fw_cfg() {
                    self.append([
                        "-fw_cfg".to_string(),
                        format!("name=opt/com.coreos/config,file={}", config),
                    ]);
                } else {
                    self.append([
                        "-drive".to_string(),
                        format!("if=none,id=ignition,format=raw,file={},readonly=on", config),
                        "-device".to_string(),
                        "virtio-blk,serial=ignition,drive=ignition".to_string(),
                    ]);
                }
            }
        }

        if self.usermode_networking {
            self.setup_networking()?;
        }

        let qmp_socket = self.tempdir()?.join("qmp.sock");
        self.append([
            "-chardev".to_string(),
            format!(
                "socket,id=qemu-qmp,path={},server=on,wait=off",
                qmp_socket.display()
            ),
            "-mon".to_string(),
            "chardev=qemu-qmp,mode=control".to_string(),
        ]);

        let journal = self.virtio_channel_read(IGNITION_JOURNAL_CHANNEL)?;

        for set in 1..=self.fds.len() {
            argv.extend([
                "-add-fd".to_string(),
                format!("fd={},set={}", set + 2, set),
            ]);
        }

        match self.console_file.clone() {
            Some(console) => self.append([
                "-display".to_string(),
                "none".to_string(),
                "-chardev".to_string(),
                format!("file,id=log,path={}", console.display()),
                "-serial".to_string(),
                "chardev:log".to_string(),
            ]),
            None => self.append(["-serial", "mon:stdio"]),
        }

        argv.append(&mut self.argv);

        Ok(PreparedQemu {
            argv,
            fds: std::mem::take(&mut self.fds),
            pdeathsig: self.pdeathsig,
            arch: self.platform.guest,
            tempdir: self.tempdir.take(),
            qmp_socket,
            journal,
            host_forward_ports: std::mem::take(&mut self.host_forward_ports),
            primary_drive: self.primary_drive.take(),
        })
    }

    /// Start the VM in the current network namespace.
    pub async fn exec(self) -> Result<QemuInstance> {
        let prepared = self.prepare().await?;
        let (argv, fds, pdeathsig, rest) = prepared.split();
        let child = spawn_qemu(argv, fds, pdeathsig)?;
        QemuInstance::start(rest, child).await
    }

    /// Start the VM from a worker inside `ns`, so its NICs live there.
    pub async fn exec_in(self, ns: &NsExecutor) -> Result<QemuInstance> {
        let prepared = self.prepare().await?;
        let (argv, fds, pdeathsig, rest) = prepared.split();
        let child = ns.run(move || spawn_qemu(argv, fds, pdeathsig)).await?;
        QemuInstance::start(rest, child).await
    }
}

/// A fully assembled QEMU invocation and the resources it owns.
pub struct PreparedQemu {
    pub argv: Vec<String>,
    fds: Vec<OwnedFd>,
    pdeathsig: bool,
    pub(super) arch: Arch,
    pub(super) tempdir: Option<TempDir>,
    pub(super) qmp_socket: PathBuf,
    pub(super) journal: OwnedFd,
    pub(super) host_forward_ports: Vec<HostForwardPort>,
    pub(super) primary_drive: Option<String>,
}

impl PreparedQemu {
    pub fn tempdir(&self) -> Option<&Path> {
        self.tempdir.as_ref().map(|d| d.path())
    }

    fn split(mut self) -> (Vec<String>, Vec<OwnedFd>, bool, Self) {
        let argv = std::mem::take(&mut self.argv);
        let fds = std::mem::take(&mut self.fds);
        let pdeathsig = self.pdeathsig;
        (argv, fds, pdeathsig, self)
    }
}

/// Spawn QEMU with `fds` placed at 3, 4, ... in the child.
fn spawn_qemu(argv: Vec<String>, fds: Vec<OwnedFd>, pdeathsig: bool) -> Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty qemu command line"))?;

    // Lift every source above the target range so the dup2 calls below
    // cannot overwrite a descriptor that is still to be copied.
    let floor = (3 + fds.len()) as RawFd;
    let mut lifted = Vec::with_capacity(fds.len());
    for fd in &fds {
        let raw = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
        if raw < 0 {
            return Err(std::io::Error::last_os_error()).context("duplicating fd for qemu");
        }
        // SAFETY: fcntl just returned a fresh descriptor that nothing else owns.
        lifted.push(unsafe { OwnedFd::from_raw_fd(raw) });
    }
    let sources: Vec<RawFd> = lifted.iter().map(|f| f.as_raw_fd()).collect();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // SAFETY: pre_exec runs after fork() but before exec(). Only
    // async-signal-safe calls (prctl, dup2) are made, on descriptors that
    // were prepared before the fork.
    unsafe {
        cmd.pre_exec(move || {
            if pdeathsig && libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            for (i, src) in sources.iter().enumerate() {
                // dup2 clears FD_CLOEXEC on the target.
                if libc::dup2(*src, 3 + i as RawFd) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = cmd.spawn().context("spawning qemu")?;
    info!(target: "qemu", pid = ?child.id(), argv = %argv.join(" "), "started qemu");
    Ok(child)
}

/// Whether `coreos-installer iso` knows the `kargs` subcommand.
async fn coreos_installer_supports_iso_kargs() -> Result<bool> {
    let out = run_checked(
        Command::new("coreos-installer").args(["iso", "--help"]),
        "coreos-installer iso --help",
    )
    .await?;
    Ok(String::from_utf8_lossy(&out.stdout).contains("kargs"))
}
