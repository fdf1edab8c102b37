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
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch};

use crate::network::{dialable, resolve_addr, Connection, ServerStream};
use crate::{AppError, AppResult};

use super::Shutdown;

/// Time a client gets to complete the TLS handshake before it is dropped.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum ListenerSlot {
    Unbound,
    Bound(Arc<TcpListener>),
    Closed,
}

/// Accepts stream connections and runs `handler` on each of them in its own task.
///
/// The server puts no limit on the number of concurrent connections. A handler
/// owns its [`Connection`] and is responsible for closing it; the connection is
/// also closed when the handler's future completes and drops it.
pub struct TcpServer<F> {
    address: String,
    handler: Arc<F>,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    listener: Mutex<ListenerSlot>,
    notify_shutdown: broadcast::Sender<()>,
    dispatch: Option<Dispatch>,
}

impl<F, Fut> TcpServer<F>
where
    F: Fn(Connection<ServerStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    /// `address` is `host:port`, `:port` for all interfaces, or
    /// [`FREE_PORT_ADDRESS`](crate::FREE_PORT_ADDRESS) for a port picked by the OS.
    /// Connections are TLS when `tls` is given.
    pub fn new(
        address: impl Into<String>,
        handler: F,
        tls: Option<Arc<ServerConfig>>,
    ) -> TcpServer<F> {
        let (notify_shutdown, _) = broadcast::channel(1);
        TcpServer {
            address: address.into(),
            handler: Arc::new(handler),
            tls: tls.map(TlsAcceptor::from),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            listener: Mutex::new(ListenerSlot::Unbound),
            notify_shutdown,
            dispatch: None,
        }
    }

    /// Sends the server's own logs, and those of its handler tasks, to `dispatch`
    /// instead of the default subscriber.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> TcpServer<F> {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> TcpServer<F> {
        self.handshake_timeout = timeout;
        self
    }

    /// Binds the listening socket. Calling it on a listening server does nothing.
    pub async fn listen(&self) -> AppResult<()> {
        self.bound_listener().await.map(|_| ())
    }

    async fn bound_listener(&self) -> AppResult<Arc<TcpListener>> {
        {
            let slot = self.listener.lock();
            match &*slot {
                ListenerSlot::Bound(listener) => return Ok(listener.clone()),
                ListenerSlot::Closed => {
                    return Err(AppError::IllegalState(format!(
                        "tcp server {} is closed",
                        self.address
                    )))
                }
                ListenerSlot::Unbound => {}
            }
        }

        let addr = resolve_addr(&self.address).await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::io(e, format!("listen on {} failed", addr)))?;

        // another caller may have bound or closed the server while we were binding
        let mut slot = self.listener.lock();
        match &*slot {
            ListenerSlot::Bound(existing) => Ok(existing.clone()),
            ListenerSlot::Closed => Err(AppError::IllegalState(format!(
                "tcp server {} is closed",
                self.address
            ))),
            ListenerSlot::Unbound => {
                let listener = Arc::new(listener);
                *slot = ListenerSlot::Bound(listener.clone());
                Ok(listener)
            }
        }
    }

    /// Accepts connections until the server is closed or accepting fails.
    ///
    /// Binds first if [`listen`](Self::listen) was not called. Always returns an
    /// error: [`AppError::Accept`] once the server is closed or the listener
    /// fails, or the bind error.
    pub async fn run(&self) -> AppResult<()> {
        match &self.dispatch {
            Some(dispatch) => self.serve().with_subscriber(dispatch.clone()).await,
            None => self.serve().await,
        }
    }

    #[tracing::instrument(name = "tcp_server", skip(self), fields(address = %self.address))]
    async fn serve(&self) -> AppResult<()> {
        // subscribe before looking at the slot so a concurrent close is never missed
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let listener = self.bound_listener().await?;
        info!(
            "tcp server listening on {}{}",
            listener.local_addr()?,
            if self.tls.is_some() { " with tls" } else { "" }
        );

        loop {
            let (stream, peer) = tokio::select! {
                res = listener.accept() => res.map_err(|e| {
                    error!("accept failed: {}", e);
                    AppError::Accept(format!("accept on {} failed: {}", self.address, e))
                })?,
                _ = shutdown.recv() => {
                    debug!("tcp server exit accept loop after close");
                    return Err(AppError::Accept(format!("tcp server {} closed", self.address)));
                }
            };
            debug!("accepted connection from {}", peer);
            self.spawn_handler(stream, peer);
        }
    }

    fn spawn_handler(&self, stream: TcpStream, peer: SocketAddr) {
        let handler = self.handler.clone();
        let tls = self.tls.clone();
        let handshake_timeout = self.handshake_timeout;
        let task = async move {
            let stream = match tls {
                Some(acceptor) => {
                    match time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                        Ok(Ok(stream)) => ServerStream::Tls(Box::new(stream)),
                        Ok(Err(e)) => {
                            warn!("tls handshake with {} failed: {}", peer, e);
                            return;
                        }
                        Err(_) => {
                            warn!(
                                "tls handshake with {} timed out after {:?}",
                                peer, handshake_timeout
                            );
                            return;
                        }
                    }
                }
                None => ServerStream::Plain(stream),
            };
            if let Err(e) = handler(Connection::new(stream)).await {
                debug!("connection {} ended with error: {}", peer, e);
            }
        };
        tokio::spawn(task.with_current_subscriber());
    }

    /// Stops accepting and releases the listening socket once the accept loop
    /// has observed it. Connections already handed to handlers stay open.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.listener.lock(), ListenerSlot::Closed);
        if !matches!(previous, ListenerSlot::Closed) {
            info!("closing tcp server {}", self.address);
            // nobody running is fine
            let _ = self.notify_shutdown.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.listener.lock(), ListenerSlot::Closed)
    }

    /// Address the server listens on, with an unspecified IP replaced by
    /// loopback so it can be dialled.
    pub fn listened_address(&self) -> AppResult<SocketAddr> {
        match &*self.listener.lock() {
            ListenerSlot::Bound(listener) => Ok(dialable(listener.local_addr()?)),
            ListenerSlot::Unbound => Err(AppError::IllegalState(format!(
                "tcp server {} is not listening",
                self.address
            ))),
            ListenerSlot::Closed => Err(AppError::IllegalState(format!(
                "tcp server {} is closed",
                self.address
            ))),
        }
    }

    pub fn listened_port(&self) -> AppResult<u16> {
        Ok(self.listened_address()?.port())
    }
}

impl<F> std::fmt::Debug for TcpServer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("address", &self.address)
            .field("tls", &self.tls.is_some())
            .field("listener", &*self.listener.lock())
            .finish()
    }
}

impl<F> Drop for TcpServer<F> {
    fn drop(&mut self) {
        debug!("tcp server {} dropped", self.address);
    }
}
