//! Network namespace handles and the OS-thread pool that works inside them.
//!
//! Namespace membership is a per-thread kernel property, so anything that
//! must happen "inside" the namespace (binding sockets, spawning processes,
//! running `ip`) is shipped to an [`NsExecutor`] worker. Each worker enters
//! the namespace, runs one closure, and restores its original namespace
//! before touching the next request.

use anyhow::{anyhow, Context, Result};
use nix::sched::{setns, unshare, CloneFlags};
use std::fs::File;
use std::marker::PhantomData;
use std::os::unix::fs::MetadataExt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

const THREAD_NS_PATH: &str = "/proc/thread-self/ns/net";

/// An open reference to a network namespace.
///
/// The namespace lives as long as this handle (or a process inside it) does.
#[derive(Debug)]
pub struct NsHandle {
    file: File,
}

impl NsHandle {
    /// Handle to the calling thread's current network namespace.
    pub fn current() -> Result<Self> {
        let file = File::open(THREAD_NS_PATH).context("opening current network namespace")?;
        Ok(Self { file })
    }

    /// Create a new network namespace.
    ///
    /// The calling thread is switched back to its original namespace before
    /// returning, including when creation fails part way.
    pub fn create() -> Result<Self> {
        let original = Self::current()?;
        unshare(CloneFlags::CLONE_NEWNET).context("unsharing network namespace")?;
        let created = Self::current();
        setns(&original.file, CloneFlags::CLONE_NEWNET)
            .context("restoring original network namespace")?;
        let created = created?;
        debug!(inode = created.inode().unwrap_or_default(), "created network namespace");
        Ok(created)
    }

    /// Switch the calling OS thread into this namespace.
    ///
    /// The returned guard is `!Send`: it can only be exited on the thread
    /// that entered.
    pub fn enter(&self) -> Result<NsGuard> {
        let original = Self::current()?;
        setns(&self.file, CloneFlags::CLONE_NEWNET).context("entering network namespace")?;
        Ok(NsGuard {
            original: Some(original),
            _pinned: PhantomData,
        })
    }

    /// Kernel identity of the namespace, suitable for equality checks.
    pub fn inode(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .context("reading namespace metadata")?
            .ino())
    }
}

/// Membership of the current thread in a namespace entered through
/// [`NsHandle::enter`]. Exiting restores the namespace observed before entry.
pub struct NsGuard {
    original: Option<NsHandle>,
    // Raw pointers are neither Send nor Sync, which pins the guard to its thread.
    _pinned: PhantomData<*const ()>,
}

impl NsGuard {
    /// Restore the original namespace and report failure.
    pub fn exit(mut self) -> Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        if let Some(original) = self.original.take() {
            setns(&original.file, CloneFlags::CLONE_NEWNET)
                .context("restoring original network namespace")?;
        }
        Ok(())
    }
}

impl Drop for NsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            error!(error = %format!("{:#}", e), "failed to leave network namespace");
        }
    }
}

type Job = Box<dyn FnOnce() -> bool + Send + 'static>;

/// A small pool of dedicated OS threads that run closures inside one namespace.
///
/// The executor owns the only long-lived handle to its namespace. Once
/// [`shutdown`](NsExecutor::shutdown) returns, the handle is closed and the
/// namespace goes away with the last process inside it.
pub struct NsExecutor {
    ns: Mutex<Option<Arc<NsHandle>>>,
    tx: Mutex<Option<crossbeam_channel::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    runtime: tokio::runtime::Handle,
}

impl NsExecutor {
    /// Start `threads` workers for `ns`. Must be called from within a tokio runtime.
    pub fn new(ns: NsHandle, threads: usize) -> Result<Self> {
        let runtime =
            tokio::runtime::Handle::try_current().context("namespace executor needs a tokio runtime")?;
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let worker = std::thread::Builder::new()
                .name(format!("netns-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if !job() {
                            error!(worker = i, "namespace worker retiring after failed restore");
                            return;
                        }
                    }
                })
                .context("spawning namespace worker thread")?;
            workers.push(worker);
        }
        Ok(Self {
            ns: Mutex::new(Some(Arc::new(ns))),
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            runtime,
        })
    }

    /// Create a fresh namespace on a throwaway thread and start workers for it.
    pub async fn create(threads: usize) -> Result<Self> {
        let ns = tokio::task::spawn_blocking(|| {
            std::thread::spawn(NsHandle::create)
                .join()
                .map_err(|_| anyhow!("namespace creation thread panicked"))?
        })
        .await
        .context("joining namespace creation")??;
        Self::new(ns, threads)
    }

    fn namespace(&self) -> Result<Arc<NsHandle>> {
        self.ns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| anyhow!("namespace executor is shut down"))
    }

    /// Kernel identity of the executor's namespace.
    pub fn inode(&self) -> Result<u64> {
        self.namespace()?.inode()
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Run `f` on a worker thread while it is inside the namespace.
    ///
    /// `f` runs with the caller's tokio runtime entered, so it may spawn
    /// `tokio::process::Command`s. Requests whose caller has stopped waiting
    /// are dropped before the worker enters the namespace.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| anyhow!("namespace executor is shut down"))?;
        let ns = self.namespace()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let runtime = self.runtime.clone();

        let job: Job = Box::new(move || {
            if reply_tx.is_closed() {
                debug!("skipping namespace work for a cancelled request");
                return true;
            }
            let _rt = runtime.enter();
            let guard = match ns.enter() {
                Ok(g) => g,
                Err(e) => {
                    let _ = reply_tx.send(Err(e));
                    return true;
                }
            };
            let result = f();
            let healthy = match guard.exit() {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "namespace restore failed");
                    false
                }
            };
            let _ = reply_tx.send(result);
            healthy
        });

        tx.send(job)
            .map_err(|_| anyhow!("all namespace workers have exited"))?;
        drop(tx);
        reply_rx
            .await
            .map_err(|_| anyhow!("namespace worker dropped the request"))?
    }

    /// Stop accepting work, wait for queued jobs and workers to finish, and
    /// close the namespace handle. Later calls are no-ops.
    ///
    /// Blocks the calling thread; async callers should go through
    /// `spawn_blocking`.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("namespace worker panicked");
            }
        }
        // Jobs hold their own clones, all dropped once the workers exit.
        if let Some(ns) = self.ns.lock().unwrap_or_else(|e| e.into_inner()).take() {
            debug!(inode = ns.inode().unwrap_or_default(), "released network namespace");
        }
    }
}

impl Drop for NsExecutor {
    fn drop(&mut self) {
        // Workers exit once the queue closes; joining here could block a runtime thread.
        self.tx.get_mut().unwrap_or_else(|e| e.into_inner()).take();
    }
}
