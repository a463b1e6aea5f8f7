use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use punchd::health::{bind_health, serve_health, HealthState};
use punchd::registry::TunnelRegistry;
use punchd::server::ServerMetrics;

async fn get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_health_listener_uses_configured_address() {
    let listener = bind_health(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

    let state = Arc::new(HealthState {
        metrics: Arc::new(ServerMetrics::new()),
        registry: Arc::new(TunnelRegistry::new()),
        start_time: Instant::now(),
        server_id: "test".to_string(),
    });
    tokio::spawn(serve_health(listener, state));

    let response = get(addr, "/livez").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);

    let response = get(addr, "/tunnels").await;
    assert!(response.ends_with("[]"), "{}", response);
}
