use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, info_span, Instrument, Span};

use super::Cluster;
use crate::config::FlightOptions;
use crate::destructor::{aggregate, destroy_all};
use crate::error::Error;
use crate::network::SshAgent;

/// State every flight backend shares: options, the SSH identity, the
/// logging span, and the registry of live clusters.
pub struct BaseFlight {
    name: String,
    opts: FlightOptions,
    agent: Arc<SshAgent>,
    span: Span,
    clusters: Mutex<HashMap<String, Arc<dyn Cluster>>>,
    destroyed: AtomicBool,
}

impl BaseFlight {
    pub fn new(opts: FlightOptions, agent: Arc<SshAgent>, parent: &Span) -> Self {
        let name = format!("{}-{}", opts.base_name, uuid::Uuid::new_v4());
        let span = info_span!(parent: parent, "flight", name = %name);
        Self {
            name,
            opts,
            agent,
            span,
            clusters: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &FlightOptions {
        &self.opts
    }

    pub fn agent(&self) -> &Arc<SshAgent> {
        &self.agent
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.agent.public_keys()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Cluster>>> {
        self.clusters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a live cluster. Fails once the flight has been destroyed.
    pub fn add_cluster(&self, cluster: Arc<dyn Cluster>) -> Result<()> {
        let mut clusters = self.registry();
        // destroy() flips the flag before draining under this lock.
        if self.is_destroyed() {
            return Err(Error::Destroyed(format!("flight {}", self.name)).into());
        }
        clusters.insert(cluster.name().to_string(), cluster);
        Ok(())
    }

    pub fn del_cluster(&self, name: &str) {
        self.registry().remove(name);
    }

    pub fn clusters(&self) -> Vec<Arc<dyn Cluster>> {
        self.registry().values().cloned().collect()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Destroy every cluster, then close the SSH agent. Only the first call acts.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let span = self.span.clone();
        async {
            let clusters: Vec<_> = self.registry().drain().map(|(_, c)| c).collect();
            let mut errors = Vec::new();
            if let Err(e) = destroy_all(clusters).await {
                errors.push(e);
            }
            if let Err(e) = self.agent.close() {
                errors.push(e);
            }
            info!("flight destroyed");
            aggregate(errors)
        }
        .instrument(span)
        .await
    }
}
