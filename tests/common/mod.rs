//! Shared helpers for integration tests

#![allow(dead_code)]

use socks5_server_r::config::{AdminConfig, AppConfig, ConnConfig, ServerConfig};
use socks5_server_r::logger::LogBuffer;
use socks5_server_r::App;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Loopback config; the SOCKS5 port is concrete so config updates validate
pub fn app_config(server: ServerConfig, token: Option<&str>) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: free_port(),
            ..server
        },
        admin: AdminConfig {
            host: "127.0.0.1".into(),
            port: 0,
            token: token.map(str::to_string),
        },
        log_mode: "debug".into(),
        log_capacity: 100,
        conn: ConnConfig {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            ..ConnConfig::default()
        },
        block_private_targets: false,
    }
}

pub async fn start(config: AppConfig) -> App {
    App::start(config, LogBuffer::new(100)).await.unwrap()
}

/// Echo server on an ephemeral port
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Port that was free a moment ago
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn connect_request(target: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = target else {
        panic!("IPv4 target expected");
    };
    let mut req = vec![5, 1, 0, 1];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    req
}

/// CONNECT request with a domain-name target (ATYP 0x03)
pub fn connect_domain_request(host: &str, port: u16) -> Vec<u8> {
    let mut req = vec![5, 1, 0, 3, host.len() as u8];
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    req
}

/// No-auth handshake plus CONNECT; returns the stream ready to relay
pub async fn socks_connect(proxy: SocketAddr, target: SocketAddr) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(&[5, 1, 0]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    assert_eq!(method, [5, 0]);

    stream.write_all(&connect_request(target)).await?;
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    assert_eq!(reply[0], 5);
    assert_eq!(reply[1], 0, "CONNECT should succeed");
    Ok(stream)
}

/// Read until EOF or error; true when the peer closed within `within`
pub async fn closed_within(stream: &mut TcpStream, within: Duration) -> bool {
    let mut buf = [0u8; 64];
    matches!(
        tokio::time::timeout(within, stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
