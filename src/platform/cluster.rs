use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info_span, Span};

use super::conf::{RenderedConfig, Renderer, UserData};
use super::Machine;
use crate::config::RuntimeConfig;
use crate::destructor::destroy_all;
use crate::error::Error;
use crate::network::ssh::DEFAULT_USER;
use crate::network::{SshAgent, SshClient};
use crate::paths;

/// State every cluster backend shares: the machine registry, SSH access,
/// and config rendering.
pub struct BaseCluster {
    name: String,
    rconf: RuntimeConfig,
    agent: Arc<SshAgent>,
    span: Span,
    machines: Mutex<HashMap<String, Arc<dyn Machine>>>,
    console: Mutex<HashMap<String, String>>,
    destroyed: AtomicBool,
}

impl BaseCluster {
    pub fn new(base_name: &str, rconf: RuntimeConfig, agent: Arc<SshAgent>, flight: &Span) -> Self {
        let name = format!("{}-{}", base_name, uuid::Uuid::new_v4());
        let span = info_span!(parent: flight, "cluster", name = %name);
        Self {
            name,
            rconf,
            agent,
            span,
            machines: Mutex::new(HashMap::new()),
            console: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.rconf
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.agent.public_keys()
    }

    pub fn agent(&self) -> &Arc<SshAgent> {
        &self.agent
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Machine>>> {
        self.machines.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Register a machine and append its ssh-config stanza.
    ///
    /// Fails with [`Error::Destroyed`] once [`destroy_machines`] has run, so
    /// a machine that finishes booting during teardown is never orphaned.
    ///
    /// [`destroy_machines`]: BaseCluster::destroy_machines
    pub fn add_mach(&self, m: Arc<dyn Machine>) -> Result<()> {
        let mut machines = self.registry();
        if self.is_destroyed() {
            return Err(Error::Destroyed(format!("cluster {}", self.name)).into());
        }
        self.append_ssh_config(m.as_ref())?;
        machines.insert(m.id().to_string(), m);
        Ok(())
    }

    /// Drop a machine from the registry, keeping its console log.
    pub fn del_mach(&self, m: &dyn Machine) {
        // Collected before locking; console_output may reach back into the cluster.
        let console = m.console_output();
        self.registry().remove(m.id());
        self.console
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(m.id().to_string(), console);
    }

    pub fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.registry().values().cloned().collect()
    }

    /// Console logs of destroyed machines, keyed by id.
    pub fn console_outputs(&self) -> HashMap<String, String> {
        self.console
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn append_ssh_config(&self, m: &dyn Machine) -> Result<()> {
        let path = paths::ssh_config_path(&self.rconf.output_dir);
        let stanza = ssh_config_stanza(m.id(), &m.ip());
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("creating ssh config {}", path.display()))?;
        f.write_all(stanza.as_bytes())
            .with_context(|| format!("appending to {}", path.display()))
    }

    /// Substitute `vars`, render, and add the flight's keys for `core`.
    pub fn render_user_data(
        &self,
        renderer: &dyn Renderer,
        userdata: &UserData,
        vars: &[(&str, &str)],
        platform: &str,
    ) -> Result<Box<dyn RenderedConfig>> {
        let mut userdata = userdata.clone();
        for (k, v) in vars {
            userdata = userdata.subst(k, v);
        }

        let mut conf = renderer.render(&userdata, platform)?;
        if !self.rconf.no_ssh_key_in_user_data {
            let keys = self.keys()?;
            conf.add_authorized_keys(DEFAULT_USER, &keys);
        }
        Ok(conf)
    }

    pub async fn ssh_client(&self, ip: &str) -> Result<SshClient> {
        self.agent.new_client(ip).await
    }

    pub async fn user_ssh_client(&self, ip: &str, user: &str) -> Result<SshClient> {
        self.agent.new_user_client(ip, user).await
    }

    pub async fn password_ssh_client(&self, ip: &str, user: &str, password: &str) -> Result<SshClient> {
        self.agent.new_password_client(ip, user, password).await
    }

    /// Run `cmd` on `m`. A non-zero exit is an [`Error::RemoteCommand`].
    pub async fn ssh(&self, m: &dyn Machine, cmd: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let client = self.ssh_client(&m.ip()).await?;
        let result = client.run(cmd).await;
        if let Err(e) = client.close().await {
            debug!(machine = %m.id(), error = %e, "closing SSH client");
        }
        let out = result?;
        match out.exit_status {
            Some(0) => Ok((out.stdout, out.stderr)),
            status => Err(Error::RemoteCommand {
                status: status.unwrap_or(u32::MAX),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            }
            .into()),
        }
    }

    /// Close the registry and destroy every registered machine, reporting
    /// all failures.
    pub async fn destroy_machines(&self) -> Result<()> {
        let machines: Vec<_> = {
            let machines = self.registry();
            self.destroyed.store(true, Ordering::SeqCst);
            machines.values().cloned().collect()
        };
        destroy_all(machines).await
    }
}

/// ssh-config stanza for one machine. `ip` may carry a port.
pub fn ssh_config_stanza(id: &str, ip: &str) -> String {
    let (host, port) = match ip.parse::<SocketAddr>() {
        Ok(addr) => (addr.ip().to_string(), Some(addr.port())),
        Err(_) => (ip.to_string(), None),
    };
    let mut out = format!("Host {}\n", id);
    if let Some(port) = port {
        let _ = writeln!(out, "  Port {}", port);
    }
    let _ = write!(
        out,
        "  HostName {}\n  StrictHostKeyChecking no\n  UserKnownHostsFile /dev/null\n",
        host
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destructor::Destroy;
    use crate::network::TcpDialer;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeMachine {
        id: String,
        ip: String,
        destroyed: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Destroy for FakeMachine {
        async fn destroy(&self) -> Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Machine for FakeMachine {
        fn id(&self) -> &str {
            &self.id
        }
        fn ip(&self) -> String {
            self.ip.clone()
        }
        fn private_ip(&self) -> String {
            self.ip.clone()
        }
        async fn ssh(&self, _cmd: &str) -> Result<(Vec<u8>, Vec<u8>)> {
            Ok((Vec::new(), Vec::new()))
        }
        async fn reboot(&self) -> Result<()> {
            Ok(())
        }
        fn console_output(&self) -> String {
            format!("console of {}", self.id)
        }
    }

    fn fake(id: &str, ip: &str) -> Arc<FakeMachine> {
        Arc::new(FakeMachine {
            id: id.into(),
            ip: ip.into(),
            destroyed: AtomicUsize::new(0),
        })
    }

    /// Reports how many machines its cluster holds as its console log.
    struct IntrospectingMachine {
        cluster: Weak<BaseCluster>,
    }

    #[async_trait::async_trait]
    impl Destroy for IntrospectingMachine {
        async fn destroy(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Machine for IntrospectingMachine {
        fn id(&self) -> &str {
            "introspecting"
        }
        fn ip(&self) -> String {
            "10.0.0.9".into()
        }
        fn private_ip(&self) -> String {
            self.ip()
        }
        async fn ssh(&self, _cmd: &str) -> Result<(Vec<u8>, Vec<u8>)> {
            Ok((Vec::new(), Vec::new()))
        }
        async fn reboot(&self) -> Result<()> {
            Ok(())
        }
        fn console_output(&self) -> String {
            match self.cluster.upgrade() {
                Some(c) => format!("{} machines", c.machines().len()),
                None => String::new(),
            }
        }
    }

    async fn cluster(dir: &TempDir) -> BaseCluster {
        let agent = Arc::new(SshAgent::new(Arc::new(TcpDialer), None).await.unwrap());
        BaseCluster::new(
            "kola",
            RuntimeConfig::new(dir.path()),
            agent,
            &Span::none(),
        )
    }

    #[test]
    fn test_ssh_config_stanza() {
        assert_eq!(
            ssh_config_stanza("m1", "10.0.0.2"),
            "Host m1\n  HostName 10.0.0.2\n  StrictHostKeyChecking no\n  UserKnownHostsFile /dev/null\n"
        );
        let with_port = ssh_config_stanza("m2", "127.0.0.1:2222");
        assert!(with_port.contains("  Port 2222\n"));
        assert!(with_port.contains("  HostName 127.0.0.1\n"));
    }

    #[tokio::test]
    async fn test_registry_and_ssh_config() {
        let dir = TempDir::new().unwrap();
        let bc = cluster(&dir).await;
        assert!(bc.name().starts_with("kola-"));

        let a = fake("a", "10.0.0.2");
        let b = fake("b", "10.0.0.3");
        bc.add_mach(a.clone()).unwrap();
        bc.add_mach(b.clone()).unwrap();
        assert_eq!(bc.machines().len(), 2);

        let cfg = std::fs::read_to_string(paths::ssh_config_path(dir.path())).unwrap();
        assert_eq!(cfg.matches("Host ").count(), 2);

        bc.del_mach(a.as_ref());
        assert_eq!(bc.machines().len(), 1);
        assert_eq!(bc.console_outputs()["a"], "console of a");

        bc.destroy_machines().await.unwrap();
        assert_eq!(b.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(a.destroyed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_render_user_data_adds_keys() {
        let dir = TempDir::new().unwrap();
        let bc = cluster(&dir).await;
        let ud = UserData::Ignition(
            r#"{"ignition":{"version":"3.3.0"},"storage":{"files":[{"path":"/etc/ip","contents":{"source":"data:,$public_ipv4"}}]}}"#
                .into(),
        );
        let conf = bc
            .render_user_data(&super::super::IgnitionRenderer, &ud, &[("$public_ipv4", "10.0.0.2")], "qemu")
            .unwrap();
        let out = conf.to_string();
        assert!(out.contains("data:,10.0.0.2"));
        assert!(out.contains("ssh-ed25519 "));

        let mut rconf = RuntimeConfig::new(dir.path());
        rconf.no_ssh_key_in_user_data = true;
        let agent = Arc::new(SshAgent::new(Arc::new(TcpDialer), None).await.unwrap());
        let bare = BaseCluster::new("kola", rconf, agent, &Span::none());
        let out = bare
            .render_user_data(&super::super::IgnitionRenderer, &ud, &[], "qemu")
            .unwrap()
            .to_string();
        assert!(!out.contains("ssh-ed25519"));
    }

    #[tokio::test]
    async fn test_add_after_destroy_is_rejected() {
        let dir = TempDir::new().unwrap();
        let bc = cluster(&dir).await;
        let early = fake("early", "10.0.0.2");
        bc.add_mach(early.clone()).unwrap();

        bc.destroy_machines().await.unwrap();
        assert!(bc.is_destroyed());
        assert_eq!(early.destroyed.load(Ordering::SeqCst), 1);

        let late = fake("late", "10.0.0.3");
        let err = bc.add_mach(late.clone()).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Destroyed(_))));
        assert!(bc.machines().iter().all(|m| m.id() != "late"));

        // The rejected machine never got an ssh-config stanza.
        let cfg = std::fs::read_to_string(paths::ssh_config_path(dir.path())).unwrap();
        assert!(!cfg.contains("Host late"));
    }

    #[tokio::test]
    async fn test_del_mach_reads_console_outside_registry_lock() {
        let dir = TempDir::new().unwrap();
        let bc = Arc::new(cluster(&dir).await);
        let m = Arc::new(IntrospectingMachine {
            cluster: Arc::downgrade(&bc),
        });
        bc.add_mach(m.clone()).unwrap();

        // A console_output that touches the registry must not deadlock del_mach.
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let bc = bc.clone();
            std::thread::spawn(move || {
                bc.del_mach(m.as_ref());
                let _ = tx.send(());
            })
        };
        rx.recv_timeout(Duration::from_secs(5)).expect("del_mach deadlocked");
        worker.join().unwrap();

        assert!(bc.machines().is_empty());
        assert_eq!(bc.console_outputs()["introspecting"], "1 machines");
    }
}
