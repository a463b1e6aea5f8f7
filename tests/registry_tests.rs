use std::net::SocketAddr;
use std::sync::Arc;

use punchd::auth::{AuthVerifier, CredentialStore, DenyAll};
use punchd::registry::{RegistryError, Tunnel, TunnelRegistry};
use punchd::session::render_listing;

fn client_addr() -> SocketAddr {
    "203.0.113.7:51000".parse().unwrap()
}

#[test]
fn test_register_and_snapshot() {
    let registry = Arc::new(TunnelRegistry::new());
    let _a = registry.register(Tunnel::new("alice", 8080, 40001, client_addr())).unwrap();
    let _b = registry.register(Tunnel::new("bob", 2222, 40002, client_addr())).unwrap();

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].public_port, 2222);
    assert_eq!(snapshot[0].owner, "bob");
    assert_eq!(snapshot[1].public_port, 8080);
    assert_eq!(snapshot[1].client_port, 40001);
    assert_eq!(snapshot[1].client_addr, client_addr());
}

#[test]
fn test_second_register_for_live_port_fails() {
    let registry = Arc::new(TunnelRegistry::new());
    let _first = registry.register(Tunnel::new("alice", 8080, 40001, client_addr())).unwrap();

    let second = registry.register(Tunnel::new("mallory", 8080, 40999, client_addr()));
    assert_eq!(second.err(), Some(RegistryError::PortInUse(8080)));

    // First registration untouched
    let tunnel = registry.get(8080).unwrap();
    assert_eq!(tunnel.owner, "alice");
    assert_eq!(tunnel.client_port, 40001);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_lease_drop_unregisters() {
    let registry = Arc::new(TunnelRegistry::new());
    let lease = registry.register(Tunnel::new("alice", 8080, 40001, client_addr())).unwrap();
    assert!(registry.contains(8080));

    drop(lease);
    assert!(!registry.contains(8080));
    assert!(registry.is_empty());

    // Port is free again
    let _again = registry.register(Tunnel::new("bob", 8080, 40002, client_addr())).unwrap();
    assert_eq!(registry.get(8080).unwrap().owner, "bob");
}

#[test]
fn test_stale_lease_does_not_remove_newer_tunnel() {
    let registry = Arc::new(TunnelRegistry::new());
    let old = registry.register(Tunnel::new("alice", 8080, 40001, client_addr())).unwrap();

    registry.unregister(8080);
    let _new = registry.register(Tunnel::new("bob", 8080, 40002, client_addr())).unwrap();

    drop(old);
    assert_eq!(registry.get(8080).unwrap().owner, "bob");
}

#[test]
fn test_unregister_absent_is_noop() {
    let registry = TunnelRegistry::new();
    registry.unregister(9);
    assert!(registry.is_empty());
}

#[test]
fn test_counters_aggregate_across_relays() {
    let registry = Arc::new(TunnelRegistry::new());
    let lease = registry.register(Tunnel::new("alice", 8080, 40001, client_addr())).unwrap();

    lease.record(100, 7);
    lease.record(5, 1_000);

    let tunnel = registry.get(8080).unwrap();
    assert_eq!(tunnel.bytes_received, 105);
    assert_eq!(tunnel.bytes_sent, 1_007);
}

#[test]
fn test_concurrent_registration_is_unique() {
    let registry = Arc::new(TunnelRegistry::new());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                registry
                    .register(Tunnel::new(format!("user{}", i), 7000, 40000 + i, client_addr()))
                    .ok()
                    // Keep the winner's lease alive until all threads finish
                    .map(std::mem::ManuallyDrop::new)
                    .is_some()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(winners, 1);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_render_listing_is_json() {
    let registry = Arc::new(TunnelRegistry::new());
    let lease = registry.register(Tunnel::new("alice", 8080, 40001, client_addr())).unwrap();
    lease.record(3, 4);

    let rendered = render_listing(&registry.snapshot());
    assert_eq!(rendered.last(), Some(&b'\n'));

    let value: serde_json::Value = serde_json::from_slice(&rendered).unwrap();
    let entry = &value[0];
    assert_eq!(entry["owner"], "alice");
    assert_eq!(entry["public_port"], 8080);
    assert_eq!(entry["client_port"], 40001);
    assert_eq!(entry["client_addr"], "203.0.113.7:51000");
    assert_eq!(entry["bytes_received"], 3);
    assert_eq!(entry["bytes_sent"], 4);
    assert!(entry["opened_at"].is_number());

    assert_eq!(render_listing(&[]), b"[]\n".to_vec());
}

#[test]
fn test_deny_all_rejects() {
    assert!(!DenyAll.verify("alice", "pw", 8080));
}

#[test]
fn test_credential_store_verify() {
    let store = CredentialStore::from_json(
        r#"{"users": [
            {"username": "alice", "password": "pw", "ports": [8080, 8443]},
            {"username": "bob", "password": "hunter2"}
        ]}"#,
    )
    .unwrap();
    assert_eq!(store.len(), 2);

    assert!(store.verify("alice", "pw", 8080));
    assert!(!store.verify("alice", "pw", 9090));
    assert!(!store.verify("alice", "wrong", 8080));
    assert!(!store.verify("carol", "pw", 8080));

    // No port list means any port
    assert!(store.verify("bob", "hunter2", 1));
    assert!(store.verify("bob", "hunter2", 65535));
}

#[test]
fn test_credential_store_rejects_duplicates_and_garbage() {
    assert!(CredentialStore::from_json(
        r#"{"users": [
            {"username": "alice", "password": "a"},
            {"username": "alice", "password": "b"}
        ]}"#,
    )
    .is_err());

    assert!(CredentialStore::from_json("not json").is_err());
}

#[test]
fn test_credential_store_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.json");
    std::fs::write(
        &path,
        r#"{"users": [{"username": "alice", "password": "pw", "ports": [8080]}]}"#,
    )
    .unwrap();

    let store = CredentialStore::load(&path).unwrap();
    assert!(store.verify("alice", "pw", 8080));

    assert!(CredentialStore::load(dir.path().join("missing.json")).is_err());
}
