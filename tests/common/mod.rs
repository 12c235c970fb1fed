//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge_gateway::config::{GatewayConfig, ServiceConfig};
use bridge_gateway::Gateway;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A mock backend answering every request on a keep-alive connection with
/// `"<METHOD> <target> <body>"`.
pub struct Backend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
}

impl Backend {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn uri(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn start_echo_backend() -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_echo(socket));
        }
    });
    Backend { addr, connections }
}

async fn serve_echo(mut socket: TcpStream) {
    let mut buffer = Vec::new();
    loop {
        let Some((head, rest)) = read_head(&mut socket, &mut buffer).await else {
            return;
        };
        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or_default().to_string();
        let length = lines
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = rest;
        while body.len() < length {
            let mut chunk = [0u8; 4096];
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
            }
        }
        buffer = body.split_off(length);
        let mut parts = request_line.split(' ');
        let method = parts.next().unwrap_or_default();
        let target = parts.next().unwrap_or_default();
        let reply = format!("{} {} {}", method, target, String::from_utf8_lossy(&body));
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Backend: echo\r\n\r\n{}",
            reply.len(),
            reply
        );
        if socket.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// A backend that switches every request to a raw echo protocol.
pub async fn start_upgrade_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let Some((_head, rest)) = read_head(&mut socket, &mut buffer).await else {
                    return;
                };
                let switch = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n";
                if socket.write_all(switch.as_bytes()).await.is_err() {
                    return;
                }
                if !rest.is_empty() && socket.write_all(&rest).await.is_err() {
                    return;
                }
                let mut chunk = [0u8; 4096];
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&chunk[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Read one head; returns it with any bytes that followed.
pub async fn read_head(socket: &mut TcpStream, buffer: &mut Vec<u8>) -> Option<(String, Vec<u8>)> {
    loop {
        if let Some(end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buffer.split_off(end + 4);
            let head = String::from_utf8_lossy(buffer).into_owned();
            buffer.clear();
            return Some((head, rest));
        }
        let mut chunk = [0u8; 4096];
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

pub fn service(name: &str, accept_path: &str, connect: String) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        accept: format!("http://127.0.0.1:0{}", accept_path),
        connect,
        keep_alive_timeout_secs: None,
        keep_alive_connections: None,
    }
}

/// Start a gateway for `services`; returns it with its listening address.
pub async fn start_gateway(services: Vec<ServiceConfig>) -> (std::sync::Arc<Gateway>, SocketAddr) {
    let config = GatewayConfig {
        services,
        ..GatewayConfig::default()
    };
    let gateway = Gateway::new(config);
    gateway.start().await.unwrap();
    let addr = gateway.local_addr("http://127.0.0.1:0").unwrap();
    (gateway, addr)
}
