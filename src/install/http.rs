use anyhow::{anyhow, Context, Result};
use axum::Router;
use std::net::SocketAddr;
use std::path::Path;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Static file server for installer assets, stopped explicitly with
/// [`AssetServer::shutdown`].
pub struct AssetServer {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl AssetServer {
    /// Serve `root` on `bind` (port 0 picks a free port).
    pub async fn start(root: &Path, bind: &str) -> Result<Self> {
        let app = Router::new().fallback_service(ServeDir::new(root));

        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("binding asset server to {}", bind))?;
        let addr = listener.local_addr().context("reading asset server address")?;
        info!(addr = %addr, root = %root.display(), "serving installer assets");

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await
                .context("asset server error")
        });

        Ok(Self {
            addr,
            stop: Some(stop),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop serving and wait for in-flight requests. Idempotent.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        task.await
            .map_err(|e| anyhow!("asset server task failed: {}", e))??;
        debug!(addr = %self.addr, "asset server stopped");
        Ok(())
    }
}

impl Drop for AssetServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            warn!(addr = %self.addr, "asset server dropped without shutdown");
            let _ = stop.send(());
        }
    }
}
