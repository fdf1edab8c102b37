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
use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, Dispatch};

use crate::network::{dialable, UdpConn};
use crate::{AppError, AppResult};

use super::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Idle,
    Running(SocketAddr),
    Closed,
}

/// Binds one datagram socket and hands it to `handler`.
///
/// There is no per-message accept for datagrams, so the handler is called once
/// per [`run`](Self::run) and runs its own receive loop on the [`UdpConn`].
pub struct UdpServer<F> {
    address: String,
    handler: F,
    state: Mutex<SocketState>,
    notify_shutdown: broadcast::Sender<()>,
    dispatch: Option<Dispatch>,
}

impl<F, Fut> UdpServer<F>
where
    F: Fn(UdpConn) -> Fut + Send + Sync,
    Fut: Future<Output = AppResult<()>> + Send,
{
    pub fn new(address: impl Into<String>, handler: F) -> UdpServer<F> {
        let (notify_shutdown, _) = broadcast::channel(1);
        UdpServer {
            address: address.into(),
            handler,
            state: Mutex::new(SocketState::Idle),
            notify_shutdown,
            dispatch: None,
        }
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> UdpServer<F> {
        self.dispatch = Some(dispatch);
        self
    }

    /// Binds the socket and runs the handler until it returns or the server is
    /// closed.
    ///
    /// Returns the handler's result, or `Ok(())` when [`close`](Self::close)
    /// interrupted it. Closing drops the handler and with it the socket.
    pub async fn run(&self) -> AppResult<()> {
        match &self.dispatch {
            Some(dispatch) => self.serve().with_subscriber(dispatch.clone()).await,
            None => self.serve().await,
        }
    }

    #[tracing::instrument(name = "udp_server", skip(self), fields(address = %self.address))]
    async fn serve(&self) -> AppResult<()> {
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        self.check_idle()?;

        let conn = UdpConn::bind(&self.address).await?;
        let local_addr = conn.local_addr()?;
        {
            let mut state = self.state.lock();
            match *state {
                SocketState::Idle => *state = SocketState::Running(local_addr),
                SocketState::Running(_) => {
                    return Err(AppError::IllegalState(format!(
                        "udp server {} is already running",
                        self.address
                    )))
                }
                SocketState::Closed => {
                    return Err(AppError::IllegalState(format!(
                        "udp server {} is closed",
                        self.address
                    )))
                }
            }
        }
        info!("udp server bound on {}", local_addr);

        let res = tokio::select! {
            res = (self.handler)(conn) => res,
            _ = shutdown.recv() => {
                debug!("udp server handler cancelled after close");
                Ok(())
            }
        };

        let mut state = self.state.lock();
        if *state == SocketState::Running(local_addr) {
            *state = SocketState::Idle;
        }
        res
    }

    fn check_idle(&self) -> AppResult<()> {
        match *self.state.lock() {
            SocketState::Idle => Ok(()),
            SocketState::Running(_) => Err(AppError::IllegalState(format!(
                "udp server {} is already running",
                self.address
            ))),
            SocketState::Closed => Err(AppError::IllegalState(format!(
                "udp server {} is closed",
                self.address
            ))),
        }
    }

    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), SocketState::Closed);
        if previous != SocketState::Closed {
            info!("closing udp server {}", self.address);
            let _ = self.notify_shutdown.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock() == SocketState::Closed
    }

    /// Address of the bound socket while the server runs, with an unspecified
    /// IP replaced by loopback.
    pub fn listened_address(&self) -> AppResult<SocketAddr> {
        match *self.state.lock() {
            SocketState::Running(addr) => Ok(dialable(addr)),
            _ => Err(AppError::IllegalState(format!(
                "udp server {} is not running",
                self.address
            ))),
        }
    }

    pub fn listened_port(&self) -> AppResult<u16> {
        Ok(self.listened_address()?.port())
    }
}

impl<F> std::fmt::Debug for UdpServer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpServer")
            .field("address", &self.address)
            .field("state", &*self.state.lock())
            .finish()
    }
}
