//! Local backend: QEMU guests on a private network namespace.
//!
//! The flight owns the namespace, its virtual LAN, the optional NTP
//! service, and the SSH agent. Clusters spawn QEMU inside the namespace
//! with one TAP device per machine.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

use super::cluster::BaseCluster;
use super::conf::{IgnitionRenderer, UserData};
use super::flight::BaseFlight;
use super::{Cluster, Flight, Machine};
use crate::config::{FlightOptions, RuntimeConfig};
use crate::destructor::{aggregate, Destroy, DestructorChain};
use crate::error::Error;
use crate::network::link::tap_name;
use crate::network::{
    Dialer, NsDialer, NsExecutor, NtpServer, RetryDialer, SshAgent, VirtualNetwork,
};
use crate::qemu::{Disk, QemuBuilder, QemuInstance};
use crate::utils::retry;

/// Segment every local machine is attached to.
const MACHINE_SEGMENT: &str = "br0";

const NTP_ADDR: &str = "[::]:123";

const JOURNAL_POLL_INTERVAL: Duration = Duration::from_secs(2);

const REBOOT_ATTEMPTS: u32 = 60;
const REBOOT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Resources shared by the flight and its clusters.
struct FlightShared {
    base: BaseFlight,
    exec: Arc<NsExecutor>,
    /// Serialises interface allocation and TAP plumbing across clusters.
    network: Arc<Mutex<VirtualNetwork>>,
    ntp: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// A flight whose machines run as QEMU processes in a private namespace.
pub struct LocalFlight {
    shared: Arc<FlightShared>,
}

impl LocalFlight {
    /// Bring up the namespace, network, NTP, and SSH agent, in that order.
    /// A failure tears down whatever was already started.
    pub async fn new(opts: FlightOptions, parent: &Span) -> Result<Self> {
        opts.validate()?;
        let mut chain = DestructorChain::new();
        match Self::build(opts, parent, &mut chain).await {
            Ok(flight) => {
                chain.disarm();
                Ok(flight)
            }
            Err(e) => {
                if let Err(teardown) = chain.run().await {
                    warn!(error = %format!("{:#}", teardown), "unwinding partial flight");
                }
                Err(e)
            }
        }
    }

    async fn build(
        opts: FlightOptions,
        parent: &Span,
        chain: &mut DestructorChain,
    ) -> Result<Self> {
        let exec = Arc::new(
            NsExecutor::create(opts.netns_threads)
                .await
                .context("creating network namespace")?,
        );
        {
            let exec = exec.clone();
            chain.push("network namespace", move || async move {
                shutdown_executor(exec).await
            });
        }

        let network = VirtualNetwork::new(&exec)
            .await
            .context("creating virtual network")?;
        let network = Arc::new(Mutex::new(network));
        {
            let network = network.clone();
            chain.push("virtual network", move || async move {
                network.lock().await.destroy().await
            });
        }

        let ntp = if opts.ntp {
            let socket = exec
                .run(|| std::net::UdpSocket::bind(NTP_ADDR).context("binding NTP socket"))
                .await?;
            let server = Arc::new(NtpServer::from_std(socket)?);
            let handle = server.start();
            let abort = handle.abort_handle();
            chain.push("NTP server", move || async move {
                abort.abort();
                Ok(())
            });
            Some(handle)
        } else {
            None
        };

        let dialer = NsDialer::new(exec.clone(), opts.dial_timeout());
        let dialer: Arc<dyn Dialer> = Arc::new(RetryDialer::new(
            dialer,
            opts.ssh_dial_retries,
            opts.dial_backoff(),
        ));
        let agent = Arc::new(
            SshAgent::new(dialer, opts.ssh_dir.as_deref())
                .await
                .context("creating SSH agent")?,
        );

        let base = BaseFlight::new(opts, agent, parent);
        info!(parent: base.span(), "local flight ready");

        Ok(Self {
            shared: Arc::new(FlightShared {
                base,
                exec,
                network,
                ntp: std::sync::Mutex::new(ntp),
            }),
        })
    }

    pub fn options(&self) -> &FlightOptions {
        self.shared.base.options()
    }

    pub fn executor(&self) -> &Arc<NsExecutor> {
        &self.shared.exec
    }

    pub fn span(&self) -> &Span {
        self.shared.base.span()
    }
}

#[async_trait::async_trait]
impl Flight for LocalFlight {
    fn name(&self) -> &str {
        self.shared.base.name()
    }

    async fn new_cluster(&self, rconf: RuntimeConfig) -> Result<Arc<dyn Cluster>> {
        let shared = &self.shared;
        if shared.base.is_destroyed() {
            return Err(Error::Destroyed(format!("flight {}", shared.base.name())).into());
        }
        tokio::fs::create_dir_all(&rconf.output_dir)
            .await
            .with_context(|| format!("creating {}", rconf.output_dir.display()))?;
        let base = BaseCluster::new(
            &shared.base.options().base_name,
            rconf,
            shared.base.agent().clone(),
            shared.base.span(),
        );
        info!(parent: base.span(), "cluster created");
        let cluster = Arc::new(LocalCluster {
            shared: Arc::new(ClusterShared {
                base,
                flight: Arc::downgrade(shared),
                destroyed: AtomicBool::new(false),
            }),
        });
        shared.base.add_cluster(cluster.clone())?;
        Ok(cluster)
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.shared.base.keys()
    }
}

#[async_trait::async_trait]
impl Destroy for LocalFlight {
    async fn destroy(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.base.is_destroyed() {
            return Ok(());
        }
        let mut errors = Vec::new();
        if let Err(e) = shared.base.destroy().await {
            errors.push(e);
        }
        let ntp = shared.ntp.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(ntp) = ntp {
            ntp.abort();
        }
        if let Err(e) = shared.network.lock().await.destroy().await {
            errors.push(e.context("destroying virtual network"));
        }
        match shutdown_executor(shared.exec.clone()).await {
            Ok(()) => debug!(parent: shared.base.span(), "namespace released"),
            Err(e) => errors.push(e),
        }
        aggregate(errors)
    }
}

/// Close the namespace executor without blocking a runtime thread. Dialers
/// and machines keep their `Arc`s but fail fast afterwards.
async fn shutdown_executor(exec: Arc<NsExecutor>) -> Result<()> {
    tokio::task::spawn_blocking(move || exec.shutdown())
        .await
        .context("shutting down namespace executor")
}

struct ClusterShared {
    base: BaseCluster,
    flight: Weak<FlightShared>,
    destroyed: AtomicBool,
}

/// A group of local machines on the flight's network.
pub struct LocalCluster {
    shared: Arc<ClusterShared>,
}

impl LocalCluster {
    pub fn base(&self) -> &BaseCluster {
        &self.shared.base
    }

    async fn start_machine(
        &self,
        userdata: &UserData,
        chain: &mut DestructorChain,
    ) -> Result<Arc<LocalMachine>> {
        let cluster = &self.shared;
        let flight = cluster
            .flight
            .upgrade()
            .ok_or_else(|| anyhow!("flight has been destroyed"))?;
        if cluster.base.is_destroyed() {
            return Err(Error::Destroyed(format!("cluster {}", cluster.base.name())).into());
        }
        let opts = flight.base.options();

        let id = uuid::Uuid::new_v4().to_string();
        let dir = cluster.base.runtime_config().output_dir.join(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating machine directory {}", dir.display()))?;

        let tap = tap_name(&id);
        let iface = {
            let mut network = flight.network.lock().await;
            let iface = network.get_interface(MACHINE_SEGMENT)?;
            network
                .attach_tap(&flight.exec, &tap, MACHINE_SEGMENT)
                .await
                .with_context(|| format!("attaching {}", tap))?;
            iface
        };
        {
            let exec = flight.exec.clone();
            let tap = tap.clone();
            chain.push(format!("tap {}", tap), move || async move {
                VirtualNetwork::detach_tap(&exec, &tap).await
            });
        }
        let ip = iface.ipv4.to_string();

        let conf = cluster.base.render_user_data(
            &IgnitionRenderer,
            userdata,
            &[("$public_ipv4", &ip), ("$private_ipv4", &ip)],
            "qemu",
        )?;
        conf.write_file(&dir.join("ignition.json"))?;

        let image = opts
            .disk_image
            .clone()
            .context("flight has no disk image for local machines")?;
        let mut builder = QemuBuilder::new(opts.guest_arch()?)?;
        builder.firmware = opts.firmware;
        builder.memory = opts.memory;
        builder.processors = opts.processors;
        builder.uuid = Some(id.clone());
        builder.console_file = Some(dir.join("console.txt"));
        builder.set_config(conf)?;
        builder.add_boot_disk(Disk::with_backing_file(image))?;
        let nic = builder
            .platform()
            .virtio("net", &format!("netdev=tap,mac={}", iface.mac()));
        builder.append([
            "-netdev".to_string(),
            format!("tap,id=tap,ifname={},script=no,downscript=no", tap),
            "-device".to_string(),
            nic,
        ]);

        let qemu = builder
            .exec_in(&flight.exec)
            .await
            .context("starting qemu")?;
        info!(machine = %id, ip = %ip, pid = ?qemu.pid(), "machine started");

        let machine = Arc::new(LocalMachine {
            id,
            ip,
            tap,
            dir,
            exec: flight.exec.clone(),
            cluster: Arc::downgrade(cluster),
            qemu: Mutex::new(Some(qemu)),
            journal: std::sync::Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        {
            let machine = machine.clone();
            chain.push(format!("qemu {}", machine.id), move || async move {
                machine.kill_qemu().await
            });
        }

        Self::register(cluster, &machine, chain)?;
        Ok(machine)
    }

    /// Start the journal capture and publish `machine` in the registry.
    /// Registration fails if the cluster was destroyed while the machine
    /// booted; the capture is stopped when `chain` unwinds.
    fn register(
        cluster: &ClusterShared,
        machine: &Arc<LocalMachine>,
        chain: &mut DestructorChain,
    ) -> Result<()> {
        let capture = JournalCapture::start(
            cluster.base.agent().clone(),
            machine.ip.clone(),
            machine.dir.join("journal.txt"),
        );
        *machine.journal.lock().unwrap_or_else(|e| e.into_inner()) = Some(capture);
        {
            let machine = machine.clone();
            chain.push(format!("journal {}", machine.id), move || async move {
                machine.stop_journal();
                Ok(())
            });
        }
        cluster.base.add_mach(machine.clone())
    }
}

#[async_trait::async_trait]
impl Cluster for LocalCluster {
    fn name(&self) -> &str {
        self.shared.base.name()
    }

    async fn new_machine(&self, userdata: &UserData) -> Result<Arc<dyn Machine>> {
        let span = self.shared.base.span().clone();
        async {
            let mut chain = DestructorChain::new();
            match self.start_machine(userdata, &mut chain).await {
                Ok(machine) => {
                    chain.disarm();
                    Ok(machine as Arc<dyn Machine>)
                }
                Err(e) => {
                    if let Err(teardown) = chain.run().await {
                        warn!(error = %format!("{:#}", teardown), "unwinding partial machine");
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.shared.base.machines()
    }
}

#[async_trait::async_trait]
impl Destroy for LocalCluster {
    async fn destroy(&self) -> Result<()> {
        let cluster = &self.shared;
        if cluster.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = cluster
            .base
            .destroy_machines()
            .instrument(cluster.base.span().clone())
            .await;
        if let Some(flight) = cluster.flight.upgrade() {
            flight.base.del_cluster(cluster.base.name());
        }
        result
    }
}

/// A QEMU guest attached to the flight's network through a TAP device.
pub struct LocalMachine {
    id: String,
    ip: String,
    tap: String,
    dir: PathBuf,
    exec: Arc<NsExecutor>,
    cluster: Weak<ClusterShared>,
    qemu: Mutex<Option<QemuInstance>>,
    journal: std::sync::Mutex<Option<JournalCapture>>,
    destroyed: AtomicBool,
}

impl LocalMachine {
    /// Directory holding this machine's config, console, and journal.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tap(&self) -> &str {
        &self.tap
    }

    async fn kill_qemu(&self) -> Result<()> {
        match self.qemu.lock().await.take() {
            Some(mut qemu) => qemu.destroy().await,
            None => Ok(()),
        }
    }

    fn stop_journal(&self) {
        let journal = self.journal.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(journal) = journal {
            journal.stop();
        }
    }

    async fn boot_id(&self) -> Result<String> {
        let (stdout, _) = self.ssh("cat /proc/sys/kernel/random/boot_id").await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    async fn check_rebooted(&self, before: &str) -> Result<()> {
        let after = self.boot_id().await?;
        if after == before {
            anyhow::bail!("boot id unchanged, machine has not rebooted yet");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Machine for LocalMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> String {
        self.ip.clone()
    }

    fn private_ip(&self) -> String {
        self.ip.clone()
    }

    async fn ssh(&self, cmd: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let cluster = self
            .cluster
            .upgrade()
            .ok_or_else(|| anyhow!("cluster of machine {} is gone", self.id))?;
        cluster.base.ssh(self, cmd).await
    }

    async fn reboot(&self) -> Result<()> {
        let before = self.boot_id().await.context("reading boot id")?;
        // The connection usually drops before the command reports a status.
        if let Err(e) = self.ssh("sudo systemctl reboot").await {
            debug!(machine = %self.id, error = %format!("{:#}", e), "reboot command");
        }
        retry(REBOOT_ATTEMPTS, REBOOT_POLL_INTERVAL, || self.check_rebooted(&before))
            .await
            .with_context(|| format!("waiting for machine {} to reboot", self.id))?;
        info!(machine = %self.id, "machine rebooted");
        Ok(())
    }

    fn console_output(&self) -> String {
        std::fs::read_to_string(self.dir.join("console.txt")).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Destroy for LocalMachine {
    async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut errors = Vec::new();
        if let Err(e) = self.kill_qemu().await {
            errors.push(e);
        }
        self.stop_journal();
        if let Err(e) = VirtualNetwork::detach_tap(&self.exec, &self.tap).await {
            errors.push(e.context(format!("detaching {}", self.tap)));
        }
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.base.del_mach(self);
        }
        info!(machine = %self.id, "machine destroyed");
        aggregate(errors)
    }
}

/// Follows the guest journal over SSH and appends it to a file.
struct JournalCapture {
    task: JoinHandle<()>,
}

impl JournalCapture {
    fn start(agent: Arc<SshAgent>, ip: String, path: PathBuf) -> Self {
        let task = tokio::spawn(async move {
            if let Err(e) = follow_journal(&agent, &ip, &path).await {
                warn!(ip = %ip, error = %format!("{:#}", e), "journal capture stopped");
            }
        });
        Self { task }
    }

    fn stop(self) {
        self.task.abort();
    }
}

async fn follow_journal(agent: &SshAgent, ip: &str, path: &Path) -> Result<()> {
    let mut out = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    let mut cursor: Option<String> = None;
    loop {
        let client = match agent.new_client(ip).await {
            Ok(c) => c,
            Err(e) => {
                debug!(ip = %ip, error = %format!("{:#}", e), "journal connection failed");
                tokio::time::sleep(JOURNAL_POLL_INTERVAL).await;
                continue;
            }
        };
        loop {
            let output = match client.run(&journal_command(cursor.as_deref())).await {
                Ok(o) if o.success() => o,
                Ok(o) => {
                    debug!(ip = %ip, status = ?o.exit_status, "journalctl failed");
                    break;
                }
                Err(e) => {
                    debug!(ip = %ip, error = %format!("{:#}", e), "journal poll failed");
                    break;
                }
            };
            let text = String::from_utf8_lossy(&output.stdout);
            let (body, next) = split_cursor(&text);
            if !body.is_empty() {
                out.write_all(body.as_bytes()).await?;
                out.write_all(b"\n").await?;
            }
            if next.is_some() {
                cursor = next;
            }
            tokio::time::sleep(JOURNAL_POLL_INTERVAL).await;
        }
        let _ = client.close().await;
        tokio::time::sleep(JOURNAL_POLL_INTERVAL).await;
    }
}

fn journal_command(cursor: Option<&str>) -> String {
    match cursor {
        Some(c) => format!(
            "journalctl --no-pager -o short-monotonic --show-cursor --after-cursor='{}'",
            c
        ),
        None => "journalctl --no-pager -o short-monotonic --show-cursor".to_string(),
    }
}

/// Split journalctl output into entries and the trailing `-- cursor:` line.
fn split_cursor(output: &str) -> (&str, Option<String>) {
    let output = output.trim_end();
    match output.rsplit_once('\n') {
        Some((body, last)) if last.starts_with("-- cursor: ") => (
            body,
            Some(last.trim_start_matches("-- cursor: ").to_string()),
        ),
        None if output.starts_with("-- cursor: ") => {
            ("", Some(output.trim_start_matches("-- cursor: ").to_string()))
        }
        _ => (output, None),
    }
}
