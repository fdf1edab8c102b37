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

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::network::addr::resolve_addr;
use crate::network::deadline::{with_deadline, Deadline};
use crate::network::Retry;
use crate::{AppError, AppResult};

/// Receive buffer used when the caller does not ask for a size.
pub const UDP_READ_BUFFER_SIZE: usize = 1024;

/// A datagram socket with deadline and retry handling.
///
/// Used both as a connected client socket and as the bound socket of a
/// [`UdpServer`](crate::UdpServer).
#[derive(Debug)]
pub struct UdpConn {
    socket: UdpSocket,
    deadline_recv: Option<Instant>,
    deadline_send: Option<Instant>,
}

impl UdpConn {
    /// Opens a socket connected to `remote`, bound to `local` if given.
    pub async fn connect(remote: &str, local: Option<&str>) -> AppResult<UdpConn> {
        let remote_addr = resolve_addr(remote).await?;
        let local_addr = match local {
            Some(local) => resolve_addr(local).await?,
            None if remote_addr.is_ipv4() => SocketAddr::from(([0, 0, 0, 0], 0)),
            None => SocketAddr::from(([0u16; 8], 0)),
        };
        let socket = UdpSocket::bind(local_addr)
            .await
            .map_err(|e| AppError::io(e, format!("bind udp {} failed", local_addr)))?;
        socket.connect(remote_addr).await.map_err(|e| {
            AppError::io(
                e,
                format!("connect udp {} -> {} failed", local_addr, remote_addr),
            )
        })?;
        Ok(UdpConn::from_socket(socket))
    }

    /// Binds a socket on `address` for receiving from any peer.
    pub async fn bind(address: &str) -> AppResult<UdpConn> {
        let addr = resolve_addr(address).await?;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| AppError::io(e, format!("bind udp {} failed", addr)))?;
        Ok(UdpConn::from_socket(socket))
    }

    pub fn from_socket(socket: UdpSocket) -> UdpConn {
        UdpConn {
            socket,
            deadline_recv: None,
            deadline_send: None,
        }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.socket.peer_addr()?)
    }

    /// Sends one datagram to the connected peer.
    pub async fn send(&self, data: &[u8], retry: Retry) -> AppResult<()> {
        self.send_with_retry(None, data, retry).await
    }

    /// Sends one datagram to `target`.
    pub async fn send_to(&self, data: &[u8], target: SocketAddr, retry: Retry) -> AppResult<()> {
        self.send_with_retry(Some(target), data, retry).await
    }

    async fn send_with_retry(
        &self,
        target: Option<SocketAddr>,
        data: &[u8],
        retry: Retry,
    ) -> AppResult<()> {
        let mut retry = retry;
        loop {
            let res = match target {
                Some(target) => {
                    with_deadline(self.deadline_send, self.socket.send_to(data, target)).await
                }
                None => with_deadline(self.deadline_send, self.socket.send(data)).await,
            };
            let err = match res {
                Ok(_) => return Ok(()),
                Err(err) => AppError::io(err, "write data failed"),
            };
            if err.is_eof() {
                return Err(err);
            }
            match retry.next_wait() {
                Some(wait) => {
                    debug!("{}, {} retries left", err, retry.count);
                    time::sleep(wait).await;
                }
                None => return Err(err),
            }
        }
    }

    /// Receives one datagram and its sender.
    ///
    /// `buffer_size` 0 means [`UDP_READ_BUFFER_SIZE`]. A datagram larger than
    /// the buffer is truncated, the rest of it is lost.
    pub async fn recv(&self, buffer_size: usize, retry: Retry) -> AppResult<(Bytes, SocketAddr)> {
        let size = if buffer_size == 0 {
            UDP_READ_BUFFER_SIZE
        } else {
            buffer_size
        };
        let mut buffer = BytesMut::zeroed(size);
        let mut retry = retry;
        loop {
            match with_deadline(self.deadline_recv, self.socket.recv_from(&mut buffer)).await {
                Ok((len, peer)) => {
                    buffer.truncate(len);
                    return Ok((buffer.freeze(), peer));
                }
                Err(err) => match retry.next_wait() {
                    Some(wait) => {
                        debug!("read data failed: {}, {} retries left", err, retry.count);
                        time::sleep(wait).await;
                    }
                    None => return Err(AppError::io(err, "read data failed")),
                },
            }
        }
    }

    pub async fn recv_with_timeout(
        &mut self,
        buffer_size: usize,
        timeout: Duration,
        retry: Retry,
    ) -> AppResult<(Bytes, SocketAddr)> {
        let conn = self.scoped_deadline_recv(timeout);
        let received = conn.recv(buffer_size, retry).await?;
        Ok(received)
    }

    pub async fn send_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        retry: Retry,
    ) -> AppResult<()> {
        let conn = self.scoped_deadline_send(timeout);
        conn.send(data, retry).await?;
        Ok(())
    }

    /// Sends `data` to the connected peer and waits for one datagram back.
    pub async fn send_recv(&self, data: &[u8], buffer_size: usize, retry: Retry) -> AppResult<Bytes> {
        self.send(data, retry).await?;
        let (data, _) = self.recv(buffer_size, retry).await?;
        Ok(data)
    }

    pub async fn send_recv_with_timeout(
        &mut self,
        data: &[u8],
        buffer_size: usize,
        timeout: Duration,
        retry: Retry,
    ) -> AppResult<Bytes> {
        self.send(data, retry).await?;
        let (data, _) = self.recv_with_timeout(buffer_size, timeout, retry).await?;
        Ok(data)
    }
}

impl Deadline for UdpConn {
    fn deadline_recv(&self) -> Option<Instant> {
        self.deadline_recv
    }

    fn deadline_send(&self) -> Option<Instant> {
        self.deadline_send
    }

    fn set_deadline_recv(&mut self, deadline: Option<Instant>) {
        self.deadline_recv = deadline;
    }

    fn set_deadline_send(&mut self, deadline: Option<Instant>) {
        self.deadline_send = deadline;
    }
}
