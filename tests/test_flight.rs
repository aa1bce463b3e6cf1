//! End-to-end local flight: concurrent machines on one virtual LAN.
//!
//! Needs root, dnsmasq, QEMU, and a bootable image in VMFLIGHT_TEST_IMAGE.
//! Run with: cargo test --features privileged-tests --test test_flight
#![cfg(feature = "privileged-tests")]

mod common;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tempfile::TempDir;
use tracing::Span;
use vmflight::config::RuntimeConfig;
use vmflight::platform::{LocalFlight, UserData};
use vmflight::{Destroy, Flight, Machine};

fn prerequisites(test: &str) -> bool {
    if !common::require_root_and(test, &["ip", "dnsmasq"]) {
        return false;
    }
    if common::test_image().is_none() {
        eprintln!("Skipping {} - requires VMFLIGHT_TEST_IMAGE", test);
        return false;
    }
    true
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_machines() {
    if !prerequisites("test_concurrent_machines") {
        return;
    }
    common::init_logging();

    let out = TempDir::new().unwrap();
    let flight = LocalFlight::new(common::test_options("concurrent"), &Span::current())
        .await
        .unwrap();
    let cluster = flight
        .new_cluster(RuntimeConfig::new(out.path()))
        .await
        .unwrap();

    let userdata = UserData::empty_ignition();
    let (a, b, c) = tokio::join!(
        cluster.new_machine(&userdata),
        cluster.new_machine(&userdata),
        cluster.new_machine(&userdata),
    );
    let machines: Vec<Arc<dyn Machine>> = vec![a.unwrap(), b.unwrap(), c.unwrap()];

    let ids: HashSet<_> = machines.iter().map(|m| m.id().to_string()).collect();
    let ips: HashSet<_> = machines.iter().map(|m| m.ip()).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(ips.len(), 3);
    for ip in &ips {
        let ip: Ipv4Addr = ip.parse().unwrap();
        assert_eq!(ip.octets()[..3], [10, 0, 0], "{} outside 10.0.0.0/24", ip);
    }
    assert_eq!(cluster.machines().len(), 3);

    cluster.destroy().await.unwrap();
    assert!(cluster.machines().is_empty());

    flight.destroy().await.unwrap();
    flight.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_machine_destroy_is_idempotent() {
    if !prerequisites("test_machine_destroy_is_idempotent") {
        return;
    }
    common::init_logging();

    let out = TempDir::new().unwrap();
    let flight = LocalFlight::new(common::test_options("idempotent"), &Span::current())
        .await
        .unwrap();
    let cluster = flight
        .new_cluster(RuntimeConfig::new(out.path()))
        .await
        .unwrap();

    let machine = cluster
        .new_machine(&UserData::empty_ignition())
        .await
        .unwrap();
    machine.destroy().await.unwrap();
    machine.destroy().await.unwrap();
    assert!(cluster.machines().is_empty());

    flight.destroy().await.unwrap();
}
