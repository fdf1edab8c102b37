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

mod network;
mod service;

pub use network::{
    decode_packet, encode_packet, free_tcp_port, free_tcp_ports, free_udp_port, free_udp_ports,
    max_payload_size, resolve_addr, tcp_send, tcp_send_pkg, tcp_send_pkg_with_timeout,
    tcp_send_recv, tcp_send_recv_pkg, tcp_send_recv_pkg_with_timeout, tcp_send_recv_with_timeout,
    tcp_send_with_timeout, udp_send, udp_send_recv, udp_send_recv_with_timeout, Connection,
    Deadline, DeadlineOverride, PacketOptions, Retry, ServerStream, SocketInfo, UdpConn,
    DEFAULT_BUFFER_WAIT, DEFAULT_HEADER_SIZE, DEFAULT_RETRY_INTERVAL, FREE_PORT_ADDRESS,
    MAX_HEADER_SIZE, READ_BUFFER_SIZE, UDP_READ_BUFFER_SIZE,
};
pub use service::{
    load_tls_config, server_dispatch, setup_local_tracing, setup_tracing, verbosity_level,
    AppConfig, AppError, AppResult, LogConfig, PacketConfig, RetryConfig, Shutdown, TcpConfig,
    TcpMode, TcpServer, TlsConfig, UdpConfig, UdpServer, DEFAULT_HANDSHAKE_TIMEOUT,
};
