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

//! Length-prefixed packets.
//!
//! ```text
//! +-----------------------------+---------------------+
//! | header: N bytes, big-endian | payload: header val |
//! +-----------------------------+---------------------+
//! ```
//!
//! `N` is 1, 2, 3 or 4 (default 2), limiting the payload to 2^(8N) - 1 bytes.
//! A zero length header is an empty packet.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::network::deadline::Deadline;
use crate::network::{Connection, Retry};
use crate::{AppError, AppResult};

pub const DEFAULT_HEADER_SIZE: usize = 2;
pub const MAX_HEADER_SIZE: usize = 4;

/// Framing options shared by both ends of a packet exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketOptions {
    /// Header width in bytes, 0 means [`DEFAULT_HEADER_SIZE`].
    pub header_size: usize,
    /// Largest accepted payload, 0 means whatever the header can express.
    pub max_data_size: usize,
    /// Retry policy for the underlying reads and writes.
    pub retry: Retry,
}

impl PacketOptions {
    pub fn with_header_size(header_size: usize) -> Self {
        PacketOptions {
            header_size,
            ..Default::default()
        }
    }

    pub fn retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_data_size(mut self, max_data_size: usize) -> Self {
        self.max_data_size = max_data_size;
        self
    }

    /// Header width and payload limit with defaults applied.
    fn limits(&self) -> AppResult<(usize, usize)> {
        let header_size = if self.header_size == 0 {
            DEFAULT_HEADER_SIZE
        } else {
            self.header_size
        };
        let capacity = max_payload_size(header_size)?;
        let max_data_size = if self.max_data_size == 0 {
            capacity
        } else {
            self.max_data_size.min(capacity)
        };
        Ok((header_size, max_data_size))
    }

    /// Largest payload these options send or accept.
    pub fn max_payload(&self) -> AppResult<usize> {
        self.limits().map(|(_, max_data_size)| max_data_size)
    }
}

/// Largest payload a header of `header_size` bytes can describe.
pub fn max_payload_size(header_size: usize) -> AppResult<usize> {
    match header_size {
        1 => Ok(0xFF),
        2 => Ok(0xFFFF),
        3 => Ok(0xFF_FFFF),
        4 => Ok(0xFFFF_FFFF),
        other => Err(AppError::InvalidHeaderSize(other)),
    }
}

/// Builds `header || payload`. Fails before producing anything if the payload
/// does not fit.
pub fn encode_packet(payload: &[u8], options: &PacketOptions) -> AppResult<BytesMut> {
    let (header_size, max_data_size) = options.limits()?;
    if payload.len() > max_data_size {
        return Err(AppError::PayloadTooLarge {
            size: payload.len(),
            max: max_data_size,
        });
    }
    let mut packet = BytesMut::with_capacity(header_size + payload.len());
    packet.put_uint(payload.len() as u64, header_size);
    packet.put_slice(payload);
    Ok(packet)
}

/// Takes one complete packet off the front of `buffer`.
///
/// Returns `Ok(None)` when the buffer does not hold a whole packet yet; the
/// buffer is left untouched and has room reserved for the rest.
pub fn decode_packet(buffer: &mut BytesMut, options: &PacketOptions) -> AppResult<Option<Bytes>> {
    let (header_size, max_data_size) = options.limits()?;
    match check(buffer, header_size, max_data_size) {
        Ok(body_size) => {
            buffer.advance(header_size);
            Ok(Some(buffer.split_to(body_size).freeze()))
        }
        Err(AppError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

fn check(buffer: &mut BytesMut, header_size: usize, max_data_size: usize) -> AppResult<usize> {
    if buffer.remaining() < header_size {
        return Err(AppError::Incomplete);
    }
    let body_size = (&buffer[..header_size]).get_uint(header_size) as usize;
    if body_size > max_data_size {
        return Err(AppError::InvalidPackage {
            size: body_size,
            max: max_data_size,
        });
    }
    if buffer.remaining() < header_size + body_size {
        buffer.reserve(header_size + body_size - buffer.remaining());
        return Err(AppError::Incomplete);
    }
    Ok(body_size)
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Sends `payload` as one packet.
    pub async fn send_pkg(&mut self, payload: &[u8], options: PacketOptions) -> AppResult<()> {
        let packet = encode_packet(payload, &options)?;
        self.send(&packet, options.retry).await
    }

    pub async fn send_pkg_with_timeout(
        &mut self,
        payload: &[u8],
        timeout: Duration,
        options: PacketOptions,
    ) -> AppResult<()> {
        let packet = encode_packet(payload, &options)?;
        let mut conn = self.scoped_deadline_send(timeout);
        conn.send(&packet, options.retry).await?;
        Ok(())
    }

    /// Reads one packet and returns its payload.
    ///
    /// The header is read first; a length above the configured maximum fails
    /// with [`AppError::InvalidPackage`] without touching the body.
    pub async fn recv_pkg(&mut self, options: PacketOptions) -> AppResult<Bytes> {
        let (header_size, max_data_size) = options.limits()?;
        let mut retry = options.retry;

        let header = self.recv_with_budget(header_size as isize, &mut retry).await?;
        let body_size = (&header[..]).get_uint(header_size) as usize;
        if body_size > max_data_size {
            return Err(AppError::InvalidPackage {
                size: body_size,
                max: max_data_size,
            });
        }
        if body_size == 0 {
            return Ok(Bytes::new());
        }
        self.recv_with_budget(body_size as isize, &mut retry).await
    }

    pub async fn recv_pkg_with_timeout(
        &mut self,
        timeout: Duration,
        options: PacketOptions,
    ) -> AppResult<Bytes> {
        let mut conn = self.scoped_deadline_recv(timeout);
        let payload = conn.recv_pkg(options).await?;
        Ok(payload)
    }

    /// Sends one packet and waits for one packet in response.
    pub async fn send_recv_pkg(&mut self, payload: &[u8], options: PacketOptions) -> AppResult<Bytes> {
        self.send_pkg(payload, options).await?;
        self.recv_pkg(options).await
    }

    /// [`send_recv_pkg`](Self::send_recv_pkg) with the response read bounded by `timeout`.
    pub async fn send_recv_pkg_with_timeout(
        &mut self,
        payload: &[u8],
        timeout: Duration,
        options: PacketOptions,
    ) -> AppResult<Bytes> {
        self.send_pkg(payload, options).await?;
        self.recv_pkg_with_timeout(timeout, options).await
    }
}
