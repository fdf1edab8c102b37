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

//! Network Module Implementation
//!
//! This module provides the data path: framed stream and datagram connections
//! on top of tokio sockets, and the length-prefixed packet codec.
//!
//! # Components
//!
//! - `Connection`: stream connection with three read modes, deadlines and retry
//! - `UdpConn`: datagram counterpart of `Connection`
//! - `PacketOptions` / `encode_packet` / `decode_packet`: packet framing
//! - `Retry`: retry policy passed by value into each operation
//! - one-shot helpers (`tcp_send_recv_pkg`, `udp_send_recv`, ...) and free
//!   port discovery
//!
//! # Wire Format
//!
//! A packet is a big-endian length header of 1 to 4 bytes (2 by default)
//! followed by that many payload bytes.

pub use addr::{
    free_tcp_port, free_tcp_ports, free_udp_port, free_udp_ports, resolve_addr, FREE_PORT_ADDRESS,
};
pub(crate) use addr::dialable;
pub use connection::{Connection, DEFAULT_BUFFER_WAIT, READ_BUFFER_SIZE};
pub use deadline::{Deadline, DeadlineOverride};
pub use helpers::{
    tcp_send, tcp_send_pkg, tcp_send_pkg_with_timeout, tcp_send_recv, tcp_send_recv_pkg,
    tcp_send_recv_pkg_with_timeout, tcp_send_recv_with_timeout, tcp_send_with_timeout, udp_send,
    udp_send_recv, udp_send_recv_with_timeout,
};
pub use packet::{
    decode_packet, encode_packet, max_payload_size, PacketOptions, DEFAULT_HEADER_SIZE,
    MAX_HEADER_SIZE,
};
pub use retry::{Retry, DEFAULT_RETRY_INTERVAL};
pub use stream::{ServerStream, SocketInfo};
pub use udp::{UdpConn, UDP_READ_BUFFER_SIZE};

mod addr;
mod connection;
mod deadline;
mod helpers;
mod packet;
mod retry;
mod stream;
mod udp;
