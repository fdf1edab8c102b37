// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{lookup_host, TcpListener, UdpSocket};

use crate::{AppError, AppResult};

/// Bind address asking the OS for any free port.
pub const FREE_PORT_ADDRESS: &str = ":0";

/// Resolves `host:port` into a socket address.
///
/// An empty host (`":8080"`) means every IPv4 interface.
pub async fn resolve_addr(address: &str) -> AppResult<SocketAddr> {
    let address = if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    };
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let mut addrs = lookup_host(&address)
        .await
        .map_err(|e| AppError::InvalidAddress(format!("resolve \"{}\" failed: {}", address, e)))?;
    addrs
        .next()
        .ok_or_else(|| AppError::InvalidAddress(format!("no address found for \"{}\"", address)))
}

/// Maps an unspecified bind IP to loopback so the address can be dialled.
pub(crate) fn dialable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Returns a TCP port that was free at the time of the call.
pub async fn free_tcp_port() -> AppResult<u16> {
    let addr = resolve_addr(FREE_PORT_ADDRESS).await?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::io(e, format!("listen on {} failed", addr)))?;
    Ok(listener.local_addr()?.port())
}

/// Returns `count` distinct TCP ports that were free at the time of the call.
pub async fn free_tcp_ports(count: usize) -> AppResult<Vec<u16>> {
    let addr = resolve_addr(FREE_PORT_ADDRESS).await?;
    // hold every listener until all ports are picked so none is handed out twice
    let mut listeners = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::io(e, format!("listen on {} failed", addr)))?;
        listeners.push(listener);
    }
    listeners
        .iter()
        .map(|l| l.local_addr().map(|a| a.port()).map_err(AppError::from))
        .collect()
}

pub async fn free_udp_port() -> AppResult<u16> {
    let addr = resolve_addr(FREE_PORT_ADDRESS).await?;
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| AppError::io(e, format!("bind udp {} failed", addr)))?;
    Ok(socket.local_addr()?.port())
}

pub async fn free_udp_ports(count: usize) -> AppResult<Vec<u16>> {
    let addr = resolve_addr(FREE_PORT_ADDRESS).await?;
    let mut sockets = Vec::with_capacity(count);
    for _ in 0..count {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| AppError::io(e, format!("bind udp {} failed", addr)))?;
        sockets.push(socket);
    }
    sockets
        .iter()
        .map(|s| s.local_addr().map(|a| a.port()).map_err(AppError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[tokio::test]
    async fn test_resolve_port_only() {
        let addr = resolve_addr(":8080").await.unwrap();
        assert_eq!(addr, "0.0.0.0:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_hostname() {
        let addr = resolve_addr("localhost:9000").await.unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_resolve_invalid() {
        let err = resolve_addr("127.0.0.1:99999").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidAddress(_)));
    }

    #[test]
    fn test_dialable() {
        let addr = dialable("0.0.0.0:1234".parse().unwrap());
        assert_eq!(addr, "127.0.0.1:1234".parse().unwrap());
        let addr = dialable("[::]:1234".parse().unwrap());
        assert_eq!(addr, "[::1]:1234".parse().unwrap());
        let addr = dialable("10.0.0.1:1234".parse().unwrap());
        assert_eq!(addr, "10.0.0.1:1234".parse().unwrap());
    }

    #[tokio::test]
    async fn test_free_ports() {
        assert!(free_tcp_port().await.unwrap() > 0);
        assert!(free_udp_port().await.unwrap() > 0);

        let ports = free_tcp_ports(3).await.unwrap();
        assert_eq!(ports.iter().collect::<HashSet<_>>().len(), 3);
        let ports = free_udp_ports(2).await.unwrap();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|p| *p > 0));
    }
}
