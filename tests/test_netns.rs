//! Namespace executor, virtual network, and namespaced dialing.
//!
//! Run with: cargo test --features privileged-tests --test test_netns
#![cfg(feature = "privileged-tests")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use vmflight::error::Error;
use vmflight::network::dnsmasq::NUM_INTERFACES;
use vmflight::network::link;
use vmflight::network::{Dialer, NsDialer, NsExecutor, NsHandle, RetryDialer, VirtualNetwork};

fn current_inode() -> u64 {
    NsHandle::current().unwrap().inode().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_executor_runs_inside_namespace() {
    if !common::require_root_and("test_executor_runs_inside_namespace", &["ip"]) {
        return;
    }
    common::init_logging();

    let exec = NsExecutor::create(2).await.unwrap();
    let target = exec.inode().unwrap();
    let host = current_inode();
    assert_ne!(target, host);

    // Every worker observes the target; the caller stays where it was.
    let seen = worker_inodes(&exec, 8).await;
    assert!(seen.iter().all(|&ino| ino == target), "{:?}", seen);
    assert_eq!(current_inode(), host);
}

/// Open descriptors in this process that refer to namespace `ino`.
fn open_namespace_fds(ino: u64) -> usize {
    let want = format!("net:[{}]", ino);
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|e| std::fs::read_link(e.ok()?.path()).ok())
        .filter(|target| target.to_string_lossy() == want)
        .count()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_releases_namespace() {
    if !common::require_root_and("test_shutdown_releases_namespace", &["ip"]) {
        return;
    }
    common::init_logging();

    let exec = Arc::new(NsExecutor::create(2).await.unwrap());
    let target = exec.inode().unwrap();
    worker_inodes(&exec, 4).await;
    assert!(open_namespace_fds(target) >= 1);

    let dialer = NsDialer::new(exec.clone(), Duration::from_secs(1));
    let closing = exec.clone();
    tokio::task::spawn_blocking(move || closing.shutdown())
        .await
        .unwrap();

    // Outstanding Arcs no longer pin the namespace.
    assert_eq!(open_namespace_fds(target), 0);
    assert!(exec.run(|| Ok(())).await.is_err());
    let err = dialer.dial("127.0.0.1:22").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
}

async fn worker_inodes(exec: &NsExecutor, n: usize) -> Vec<u64> {
    let mut seen = Vec::with_capacity(n);
    for _ in 0..n {
        seen.push(exec.run(|| NsHandle::current()?.inode()).await.unwrap());
    }
    seen
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interface_exhaustion() {
    if !common::require_root_and("test_interface_exhaustion", &["ip", "dnsmasq"]) {
        return;
    }
    common::init_logging();

    let exec = NsExecutor::create(1).await.unwrap();
    let mut net = VirtualNetwork::new(&exec).await.unwrap();

    let mut ips = Vec::new();
    for _ in 0..NUM_INTERFACES {
        ips.push(net.get_interface("br0").unwrap().ipv4);
    }
    ips.dedup();
    assert_eq!(ips.len(), NUM_INTERFACES as usize);
    assert_eq!(ips[0].to_string(), "10.0.0.2");

    let err = net.get_interface("br0").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InterfacesExhausted { .. })
    ));

    // Other segments keep their own pools.
    assert_eq!(net.get_interface("br1").unwrap().ipv4.to_string(), "10.1.0.2");
    let err = net.get_interface("br9").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnknownSegment(_))));

    net.destroy().await.unwrap();
    net.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dial_inside_namespace() {
    if !common::require_root_and("test_dial_inside_namespace", &["ip"]) {
        return;
    }
    common::init_logging();

    let exec = Arc::new(NsExecutor::create(1).await.unwrap());
    let listener = exec
        .run(|| {
            link::set_loopback_up()?;
            Ok(std::net::TcpListener::bind("127.0.0.1:0")?)
        })
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accept = std::thread::spawn(move || listener.accept().map(|(_, peer)| peer));

    let dialer = RetryDialer::new(
        NsDialer::new(exec.clone(), Duration::from_secs(2)),
        3,
        Duration::from_millis(50),
    );
    let stream = dialer.dial(&addr).await.unwrap();
    let peer = accept.join().unwrap().unwrap();
    assert_eq!(stream.local_addr().unwrap(), peer);

    // Nothing listens on the namespace's port 1.
    let err = RetryDialer::new(
        NsDialer::new(exec.clone(), Duration::from_secs(1)),
        1,
        Duration::from_millis(10),
    )
    .dial_with_retry("127.0.0.1:1")
    .await
    .unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::DialExhausted { attempts, .. }) => assert_eq!(*attempts, 2),
        other => panic!("unexpected error: {:?}", other),
    }
}
