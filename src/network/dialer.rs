//! TCP dialers used by the SSH layer.

use anyhow::Result;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use super::namespace::NsExecutor;
use crate::error::Error;

#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr` (`host:port`).
    async fn dial(&self, addr: &str) -> io::Result<TcpStream>;
}

/// Plain connect from the caller's namespace.
#[derive(Debug, Default, Clone)]
pub struct TcpDialer;

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

/// Connects from inside a network namespace.
///
/// The socket is created and connected on a namespace worker, then handed to
/// tokio. A connected socket keeps working regardless of the namespace of
/// the thread that later uses it.
pub struct NsDialer {
    exec: Arc<NsExecutor>,
    timeout: Duration,
}

impl NsDialer {
    pub fn new(exec: Arc<NsExecutor>, timeout: Duration) -> Self {
        Self { exec, timeout }
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {}", addr))
    })
}

#[async_trait::async_trait]
impl Dialer for NsDialer {
    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        if self.exec.is_shut_down() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "namespace executor is shut down",
            ));
        }
        let target = resolve(addr)?;
        let timeout = self.timeout;
        let std_stream = self
            .exec
            .run(move || {
                let stream = std::net::TcpStream::connect_timeout(&target, timeout)?;
                stream.set_nonblocking(true)?;
                Ok(stream)
            })
            .await
            .map_err(|e| match e.downcast::<io::Error>() {
                Ok(io) => io,
                Err(other) => io::Error::other(format!("{:#}", other)),
            })?;
        TcpStream::from_std(std_stream)
    }
}

/// Retries a dialer at a fixed interval.
///
/// Makes at most `retries + 1` attempts.
pub struct RetryDialer<D> {
    inner: D,
    retries: u32,
    backoff: Duration,
}

impl<D: Dialer> RetryDialer<D> {
    pub fn new(inner: D, retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            retries,
            backoff,
        }
    }

    /// Like [`Dialer::dial`], but the exhaustion error is a typed
    /// [`Error::DialExhausted`] carrying the last connect error.
    pub async fn dial_with_retry(&self, addr: &str) -> Result<TcpStream> {
        Ok(self.dial_until_exhausted(addr).await?)
    }

    async fn dial_until_exhausted(&self, addr: &str) -> std::result::Result<TcpStream, Error> {
        let attempts = self.retries + 1;
        let mut attempt = 1;
        loop {
            match self.inner.dial(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt >= attempts => {
                    return Err(Error::DialExhausted {
                        addr: addr.to_string(),
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    debug!(addr = %addr, attempt, error = %e, "dial failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<D: Dialer> Dialer for RetryDialer<D> {
    /// Exhaustion surfaces as an `io::Error` with the last attempt's kind,
    /// wrapping the [`Error::DialExhausted`] as its inner error.
    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        self.dial_until_exhausted(addr).await.map_err(|e| {
            let kind = match &e {
                Error::DialExhausted { source, .. } => source.kind(),
                _ => io::ErrorKind::Other,
            };
            io::Error::new(kind, e)
        })
    }
}

#[async_trait::async_trait]
impl<D: Dialer + ?Sized> Dialer for Arc<D> {
    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        (**self).dial(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingDialer {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, _addr: &str) -> io::Result<TcpStream> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("refused #{}", n),
            ))
        }
    }

    #[tokio::test]
    async fn test_retry_makes_n_plus_one_attempts() {
        let inner = Arc::new(CountingDialer {
            calls: AtomicU32::new(0),
        });
        let dialer = RetryDialer::new(inner.clone(), 3, Duration::from_millis(1));

        let err = dialer.dial_with_retry("10.0.0.2:22").await.unwrap_err();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);

        let typed = err.downcast_ref::<Error>().unwrap();
        match typed {
            Error::DialExhausted {
                attempts, source, ..
            } => {
                assert_eq!(*attempts, 4);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
                assert_eq!(source.to_string(), "refused #4");
            }
            other => panic!("expected dial exhaustion, got {:?}", other),
        }
        assert!(typed.source().is_some());
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let dialer = RetryDialer::new(TcpDialer, 2, Duration::from_millis(1));
        let stream = dialer.dial(&addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().to_string(), addr);
    }

    #[tokio::test]
    async fn test_ns_dialer_reaches_namespace_listener() {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("Skipping test_ns_dialer_reaches_namespace_listener - requires root");
            return;
        }

        let exec = Arc::new(NsExecutor::create(1).await.unwrap());
        let listener = exec
            .run(|| {
                crate::network::link::set_loopback_up()?;
                Ok(std::net::TcpListener::bind("127.0.0.1:0")?)
            })
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let dialer = NsDialer::new(exec.clone(), Duration::from_secs(2));
        dialer.dial(&addr).await.unwrap();

        // The host namespace has no such listener.
        drop(listener);
        assert!(dialer.dial(&addr).await.is_err());
    }

    #[tokio::test]
    async fn test_exhaustion_survives_trait_object() {
        let inner = Arc::new(CountingDialer {
            calls: AtomicU32::new(0),
        });
        let dialer: Arc<dyn Dialer> =
            Arc::new(RetryDialer::new(inner.clone(), 1, Duration::from_millis(1)));

        let err = dialer.dial("10.0.0.2:22").await.unwrap_err();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        let typed = err.get_ref().and_then(|e| e.downcast_ref::<Error>()).unwrap();
        assert!(matches!(typed, Error::DialExhausted { attempts: 2, .. }));
        let last = typed.source().unwrap();
        assert_eq!(last.to_string(), "refused #2");
    }

    #[tokio::test]
    async fn test_ns_dialer_fails_after_shutdown() {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("Skipping test_ns_dialer_fails_after_shutdown - requires root");
            return;
        }

        let exec = Arc::new(NsExecutor::create(1).await.unwrap());
        let dialer = NsDialer::new(exec.clone(), Duration::from_secs(1));
        exec.shutdown();

        let err = dialer.dial("127.0.0.1:22").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
