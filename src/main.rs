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

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use framenet::{
    load_tls_config, setup_local_tracing, setup_tracing, verbosity_level, AppConfig, AppError,
    AppResult, Connection, Retry, ServerStream, TcpConfig, TcpMode, TcpServer, UdpConn,
    UdpServer,
};
use tracing::{debug, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("conf.toml"), PathBuf::from);
    let config = AppConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let level = verbosity_level(commandline.verbose);
    let _worker_guard = match &config.log {
        Some(log) => Some(setup_tracing(log, level)?),
        None => {
            setup_local_tracing(level)?;
            None
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| AppError::io(e, "build tokio runtime failed"))?;
    runtime.block_on(serve(config))
}

async fn serve(config: AppConfig) -> AppResult<()> {
    let tls = match &config.tcp.tls {
        Some(tls) => Some(load_tls_config(&tls.cert_path, &tls.key_path)?),
        None => None,
    };
    let tcp_config = Arc::new(config.tcp);
    let handler_config = tcp_config.clone();
    let tcp_server = TcpServer::new(
        tcp_config.address.clone(),
        move |conn: Connection<ServerStream>| echo_tcp(conn, handler_config.clone()),
        tls,
    );
    tcp_server.listen().await?;
    info!(
        "tcp echo server ({:?} mode) on port {}",
        tcp_config.mode,
        tcp_server.listened_port()?
    );

    let udp_server = config.udp.map(|udp| {
        let buffer_size = udp.buffer_size;
        UdpServer::new(udp.address, move |conn: UdpConn| echo_udp(conn, buffer_size))
    });

    let res = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            res.map_err(|e| AppError::io(e, "listen for ctrl-c failed"))
        }
        res = tcp_server.run() => res,
        res = run_optional(udp_server.as_ref()) => res,
    };

    tcp_server.close();
    if let Some(udp_server) = &udp_server {
        udp_server.close();
    }
    res
}

async fn run_optional<F, Fut>(server: Option<&UdpServer<F>>) -> AppResult<()>
where
    F: Fn(UdpConn) -> Fut + Send + Sync,
    Fut: Future<Output = AppResult<()>> + Send,
{
    match server {
        Some(server) => server.run().await,
        None => std::future::pending().await,
    }
}

async fn echo_tcp(mut conn: Connection<ServerStream>, config: Arc<TcpConfig>) -> AppResult<()> {
    let peer = conn.peer_addr()?;
    debug!("client {} connected, tls: {}", peer, conn.get_ref().is_tls());
    conn.set_buffer_wait_recv(config.buffer_wait());
    let options = config.packet_options();

    let err = loop {
        let received = match (config.mode, config.read_timeout()) {
            (TcpMode::Packet, Some(timeout)) => conn.recv_pkg_with_timeout(timeout, options).await,
            (TcpMode::Packet, None) => conn.recv_pkg(options).await,
            (TcpMode::Raw, Some(timeout)) => conn.recv_with_timeout(-1, timeout, options.retry).await,
            (TcpMode::Raw, None) => conn.recv(-1, options.retry).await,
        };
        let data = match received {
            Ok(data) => data,
            Err(e) => break e,
        };
        let sent = match config.mode {
            TcpMode::Packet => conn.send_pkg(&data, options).await,
            TcpMode::Raw => conn.send(&data, options.retry).await,
        };
        if let Err(e) = sent {
            break e;
        }
    };

    if err.is_eof() {
        debug!("client {} disconnected", peer);
        return Ok(());
    }
    Err(err)
}

async fn echo_udp(conn: UdpConn, buffer_size: usize) -> AppResult<()> {
    loop {
        let (data, peer) = conn.recv(buffer_size, Retry::none()).await?;
        debug!("echo {} bytes to {}", data.len(), peer);
        conn.send_to(&data, peer, Retry::none()).await?;
    }
}
