//! Ordered, best-effort release of acquired resources.
//!
//! Owners push a teardown step for every resource right after acquiring it.
//! Running the chain releases resources in reverse order of acquisition,
//! attempts every step even when earlier ones fail, and reports all failures
//! as one [`Error::Teardown`].

use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Error;

type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Step = Box<dyn FnOnce() -> BoxFuture + Send>;

/// Something that can be destroyed. Implementations must be idempotent.
#[async_trait::async_trait]
pub trait Destroy: Send + Sync {
    async fn destroy(&self) -> Result<()>;
}

#[derive(Default)]
pub struct DestructorChain {
    steps: Vec<(String, Step)>,
}

impl DestructorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the teardown for a resource that was just acquired.
    pub fn push<F, Fut>(&mut self, name: impl Into<String>, step: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps
            .push((name.into(), Box::new(move || Box::pin(step()) as BoxFuture)));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Drop every step without running it: ownership has been handed off.
    pub fn disarm(mut self) {
        self.steps.clear();
    }

    /// Run all steps in reverse order of registration.
    pub async fn run(mut self) -> Result<()> {
        let mut errors = Vec::new();
        while let Some((name, step)) = self.steps.pop() {
            debug!(step = %name, "running destructor");
            if let Err(e) = step().await {
                warn!(step = %name, error = %format!("{:#}", e), "destructor failed");
                errors.push(e.context(format!("destroying {}", name)));
            }
        }
        aggregate(errors)
    }
}

impl Drop for DestructorChain {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            let names: Vec<&str> = self.steps.iter().map(|(n, _)| n.as_str()).collect();
            warn!(steps = ?names, "destructor chain dropped without running");
        }
    }
}

/// Destroy siblings, continuing past failures, and report every error.
pub async fn destroy_all<T, I>(children: I) -> Result<()>
where
    T: Destroy + ?Sized,
    I: IntoIterator<Item = Arc<T>>,
{
    let mut errors = Vec::new();
    for child in children {
        if let Err(e) = child.destroy().await {
            errors.push(e);
        }
    }
    aggregate(errors)
}

/// Fold collected teardown errors into a single result.
pub fn aggregate(errors: Vec<anyhow::Error>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Teardown { errors }.into())
    }
}
