//! Resource topology: a Flight owns shared test infrastructure, Clusters
//! group Machines on it, Machines are running guests.
//!
//! Backends compose [`BaseFlight`] and [`BaseCluster`] for the behaviour
//! every backend shares and implement the traits below on top.

pub mod cluster;
pub mod conf;
pub mod flight;
pub mod local;

pub use cluster::BaseCluster;
pub use conf::{IgnitionRenderer, RenderedConfig, Renderer, UnitState, UserData};
pub use flight::BaseFlight;
pub use local::{LocalCluster, LocalFlight, LocalMachine};

use anyhow::Result;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::destructor::Destroy;

/// One running guest. `destroy` must be idempotent.
#[async_trait::async_trait]
pub trait Machine: Destroy {
    fn id(&self) -> &str;

    /// Address for reaching the guest, possibly `host:port`.
    fn ip(&self) -> String;

    fn private_ip(&self) -> String;

    /// Run a command over a fresh SSH connection, returning trimmed stdout and stderr.
    async fn ssh(&self, cmd: &str) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Restart the guest and wait for it to come back.
    async fn reboot(&self) -> Result<()>;

    /// Console log, if any. Complete only after destroy.
    fn console_output(&self) -> String;
}

/// A named group of machines sharing one flight's network.
#[async_trait::async_trait]
pub trait Cluster: Destroy {
    fn name(&self) -> &str;

    async fn new_machine(&self, userdata: &UserData) -> Result<Arc<dyn Machine>>;

    /// Snapshot of the live machines.
    fn machines(&self) -> Vec<Arc<dyn Machine>>;
}

/// Shared infrastructure for one test run.
#[async_trait::async_trait]
pub trait Flight: Destroy {
    fn name(&self) -> &str;

    async fn new_cluster(&self, rconf: RuntimeConfig) -> Result<Arc<dyn Cluster>>;

    /// authorized_keys lines for the flight's SSH identity.
    fn keys(&self) -> Result<Vec<String>>;
}
