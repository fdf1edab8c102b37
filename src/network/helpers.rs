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

//! One-shot exchanges.
//!
//! Every function here dials `address`, performs a single operation and closes
//! the connection before returning, whether the operation succeeded or not.
//! The `*_with_timeout` variants also bound the dial by `timeout`.

use std::time::Duration;

use bytes::Bytes;

use crate::network::{Connection, PacketOptions, Retry, UdpConn};
use crate::AppResult;

pub async fn tcp_send(address: &str, data: &[u8], retry: Retry) -> AppResult<()> {
    let mut conn = Connection::connect(address, None).await?;
    conn.send(data, retry).await?;
    conn.close().await
}

pub async fn tcp_send_with_timeout(
    address: &str,
    data: &[u8],
    timeout: Duration,
    retry: Retry,
) -> AppResult<()> {
    let mut conn = Connection::connect(address, Some(timeout)).await?;
    conn.send_with_timeout(data, timeout, retry).await?;
    conn.close().await
}

/// Sends `data` and reads the response, `length` selecting the read mode as in
/// [`Connection::recv`].
pub async fn tcp_send_recv(
    address: &str,
    data: &[u8],
    length: isize,
    retry: Retry,
) -> AppResult<Bytes> {
    let mut conn = Connection::connect(address, None).await?;
    conn.send_recv(data, length, retry).await
}

pub async fn tcp_send_recv_with_timeout(
    address: &str,
    data: &[u8],
    length: isize,
    timeout: Duration,
    retry: Retry,
) -> AppResult<Bytes> {
    let mut conn = Connection::connect(address, Some(timeout)).await?;
    conn.send_recv_with_timeout(data, length, timeout, retry)
        .await
}

pub async fn tcp_send_pkg(address: &str, payload: &[u8], options: PacketOptions) -> AppResult<()> {
    let mut conn = Connection::connect(address, None).await?;
    conn.send_pkg(payload, options).await?;
    conn.close().await
}

pub async fn tcp_send_pkg_with_timeout(
    address: &str,
    payload: &[u8],
    timeout: Duration,
    options: PacketOptions,
) -> AppResult<()> {
    let mut conn = Connection::connect(address, Some(timeout)).await?;
    conn.send_pkg_with_timeout(payload, timeout, options).await?;
    conn.close().await
}

pub async fn tcp_send_recv_pkg(
    address: &str,
    payload: &[u8],
    options: PacketOptions,
) -> AppResult<Bytes> {
    let mut conn = Connection::connect(address, None).await?;
    conn.send_recv_pkg(payload, options).await
}

pub async fn tcp_send_recv_pkg_with_timeout(
    address: &str,
    payload: &[u8],
    timeout: Duration,
    options: PacketOptions,
) -> AppResult<Bytes> {
    let mut conn = Connection::connect(address, Some(timeout)).await?;
    conn.send_recv_pkg_with_timeout(payload, timeout, options)
        .await
}

pub async fn udp_send(address: &str, data: &[u8], retry: Retry) -> AppResult<()> {
    let conn = UdpConn::connect(address, None).await?;
    conn.send(data, retry).await
}

/// Sends one datagram and waits for one back, read into a buffer of
/// `buffer_size` bytes (0 for the default).
pub async fn udp_send_recv(
    address: &str,
    data: &[u8],
    buffer_size: usize,
    retry: Retry,
) -> AppResult<Bytes> {
    let conn = UdpConn::connect(address, None).await?;
    conn.send_recv(data, buffer_size, retry).await
}

pub async fn udp_send_recv_with_timeout(
    address: &str,
    data: &[u8],
    buffer_size: usize,
    timeout: Duration,
    retry: Retry,
) -> AppResult<Bytes> {
    let mut conn = UdpConn::connect(address, None).await?;
    conn.send_recv_with_timeout(data, buffer_size, timeout, retry)
        .await
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, UdpSocket};

    use super::*;
    use crate::AppError;

    #[tokio::test]
    async fn test_tcp_send_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let first = conn.recv(5, Retry::none()).await.unwrap();
            let rest = conn.recv(1, Retry::none()).await.unwrap_err();
            (first, rest)
        });

        tcp_send(&address, b"hello", Retry::none()).await.unwrap();
        let (first, rest) = server.await.unwrap();
        assert_eq!(&first[..], b"hello");
        assert!(matches!(rest, AppError::Eof(ref data) if data.is_empty()));
    }

    #[tokio::test]
    async fn test_tcp_send_recv_pkg() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let payload = conn.recv_pkg(PacketOptions::default()).await.unwrap();
            conn.send_pkg(&payload, PacketOptions::default())
                .await
                .unwrap();
        });

        let reply = tcp_send_recv_pkg_with_timeout(
            &address,
            b"ping",
            Duration::from_secs(5),
            PacketOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(&reply[..], b"ping");
    }

    #[tokio::test]
    async fn test_tcp_dial_refused() {
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let err = tcp_send(&address, b"x", Retry::none()).await.unwrap_err();
        assert!(matches!(err, AppError::Io { .. }));
    }

    #[tokio::test]
    async fn test_udp_send() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap().to_string();

        udp_send(&address, b"datagram", Retry::none()).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram");
    }
}
