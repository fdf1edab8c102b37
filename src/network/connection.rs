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
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ErrorKind};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::{client, TlsConnector};
use tracing::{debug, trace};

use crate::network::addr::resolve_addr;
use crate::network::deadline::{with_deadline, Deadline};
use crate::network::stream::SocketInfo;
use crate::network::Retry;
use crate::{AppError, AppResult};

/// Initial size of the buffer used by single and unbounded reads.
pub const READ_BUFFER_SIZE: usize = 128;

/// Default time an unbounded read waits for more data once something arrived.
pub const DEFAULT_BUFFER_WAIT: Duration = Duration::from_millis(1);

/// A stream connection with deadline and retry handling.
///
/// `Connection` is not meant to be shared between tasks; reads and writes are
/// performed in the order they are issued.
///
/// Reads go through a buffered reader, writes go straight to the stream and
/// are flushed before a send returns.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: BufReader<S>,
    deadline_recv: Option<Instant>,
    deadline_send: Option<Instant>,
    buffer_wait_recv: Duration,
}

impl Connection<TcpStream> {
    /// Dials `address`, giving up after `timeout` if one is given.
    pub async fn connect(address: &str, timeout: Option<Duration>) -> AppResult<Self> {
        let stream = dial(address, timeout).await?;
        Ok(Connection::new(stream))
    }
}

impl Connection<client::TlsStream<TcpStream>> {
    /// Dials `address` and performs a TLS handshake for `server_name`.
    pub async fn connect_tls(
        address: &str,
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> AppResult<Self> {
        let stream = dial(address, None).await?;
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| AppError::Tls(format!("invalid server name {}: {}", server_name, e)))?;
        let stream = TlsConnector::from(config)
            .connect(server_name, stream)
            .await
            .map_err(|e| AppError::Tls(format!("handshake with {} failed: {}", address, e)))?;
        Ok(Connection::new(stream))
    }
}

async fn dial(address: &str, timeout: Option<Duration>) -> AppResult<TcpStream> {
    let addr = resolve_addr(address).await?;
    let connect = TcpStream::connect(addr);
    let res = match timeout {
        Some(timeout) => time::timeout(timeout, connect)
            .await
            .map_err(|_| AppError::Timeout(format!("connect to {} timed out", addr)))?,
        None => connect.await,
    };
    res.map_err(|e| AppError::io(e, format!("connect to {} failed", addr)))
}

impl<S: SocketInfo + AsyncRead> Connection<S> {
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.stream.get_ref().local_addr()?)
    }

    pub fn peer_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.stream.get_ref().peer_addr()?)
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Connection<S> {
        Connection {
            stream: BufReader::new(stream),
            deadline_recv: None,
            deadline_send: None,
            buffer_wait_recv: DEFAULT_BUFFER_WAIT,
        }
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// Returns the underlying stream. Bytes already buffered for reading are lost.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// Sets how long an unbounded [`recv`](Self::recv) waits for further data
    /// after the first chunk arrived.
    ///
    /// This is a heuristic: a sender pausing longer than the wait has its
    /// message split across two reads. Keep it short, it delays every
    /// unbounded read by at least this amount.
    pub fn set_buffer_wait_recv(&mut self, wait: Duration) {
        self.buffer_wait_recv = wait;
    }

    pub fn buffer_wait_recv(&self) -> Duration {
        self.buffer_wait_recv
    }

    /// Writes all of `data`.
    ///
    /// Failed writes are attempted again as long as `retry` allows, picking up
    /// after the bytes already written. An end-of-stream condition is returned
    /// at once.
    pub async fn send(&mut self, data: &[u8], retry: Retry) -> AppResult<()> {
        let mut retry = retry;
        // advanced by every partial write, also when a deadline cuts one short
        let mut remaining = data;
        loop {
            let res = with_deadline(self.deadline_send, async {
                self.stream.write_all_buf(&mut remaining).await?;
                self.stream.flush().await
            })
            .await;
            let err = match res {
                Ok(()) => return Ok(()),
                Err(err) => AppError::io(err, "write data failed"),
            };
            if err.is_eof() {
                return Err(err);
            }
            match retry.next_wait() {
                Some(wait) => {
                    debug!("{}, {} retries left, next in {:?}", err, retry.count, wait);
                    time::sleep(wait).await;
                }
                None => return Err(err),
            }
        }
    }

    /// Reads from the connection.
    ///
    /// - `length == 0`: one read, returns whatever arrived.
    /// - `length > 0`: reads until exactly `length` bytes are collected.
    /// - `length < 0`: reads until no more data arrives within the buffer wait
    ///   (see [`set_buffer_wait_recv`](Self::set_buffer_wait_recv)); the first
    ///   read waits for as long as the read deadline allows.
    ///
    /// If the peer closes the stream, [`AppError::Eof`] carries the bytes read so far.
    pub async fn recv(&mut self, length: isize, retry: Retry) -> AppResult<Bytes> {
        let mut retry = retry;
        self.recv_with_budget(length, &mut retry).await
    }

    pub(crate) async fn recv_with_budget(&mut self, length: isize, retry: &mut Retry) -> AppResult<Bytes> {
        let mut buffer = if length > 0 {
            BytesMut::zeroed(length as usize)
        } else {
            BytesMut::zeroed(READ_BUFFER_SIZE)
        };
        let mut index = 0;
        loop {
            let buffer_wait = length < 0 && index > 0;
            let deadline = if buffer_wait {
                let probe = Instant::now() + self.buffer_wait_recv;
                Some(self.deadline_recv.map_or(probe, |d| d.min(probe)))
            } else {
                self.deadline_recv
            };

            match with_deadline(deadline, self.stream.read(&mut buffer[index..])).await {
                Ok(0) => {
                    buffer.truncate(index);
                    return Err(AppError::Eof(buffer.freeze()));
                }
                Ok(size) => {
                    index += size;
                    if length == 0 || index as isize == length {
                        break;
                    }
                    if length < 0 && index == buffer.len() {
                        let grow = buffer.len();
                        buffer.resize(grow * 2, 0);
                    }
                }
                // nothing more arrived in time, what we have is the result
                Err(err) if buffer_wait && err.kind() == ErrorKind::TimedOut => break,
                Err(err) => match retry.next_wait() {
                    Some(wait) => {
                        debug!("read data failed: {}, {} retries left", err, retry.count);
                        time::sleep(wait).await;
                    }
                    None => {
                        buffer.truncate(index);
                        return Err(AppError::io(err, "read data failed").with_partial(buffer.freeze()));
                    }
                },
            }
        }
        buffer.truncate(index);
        trace!("received {} bytes", index);
        Ok(buffer.freeze())
    }

    /// Reads up to a `\n`. The newline is not part of the result.
    pub async fn recv_line(&mut self, retry: Retry) -> AppResult<Bytes> {
        let mut retry = retry;
        let mut data = BytesMut::new();
        loop {
            match self.recv_with_budget(1, &mut retry).await {
                Ok(byte) if byte[0] == b'\n' => return Ok(data.freeze()),
                Ok(byte) => data.extend_from_slice(&byte),
                Err(err) => return Err(err.with_partial(data.freeze())),
            }
        }
    }

    /// Reads until the data ends with `delimiter`. The delimiter is part of the result.
    pub async fn recv_till(&mut self, delimiter: &[u8], retry: Retry) -> AppResult<Bytes> {
        if delimiter.is_empty() {
            return Err(AppError::InvalidValue("empty delimiter".into()));
        }
        let mut retry = retry;
        let mut data = BytesMut::new();
        loop {
            match self.recv_with_budget(1, &mut retry).await {
                Ok(byte) => {
                    data.extend_from_slice(&byte);
                    if data.ends_with(delimiter) {
                        return Ok(data.freeze());
                    }
                }
                Err(err) => return Err(err.with_partial(data.freeze())),
            }
        }
    }

    /// [`recv`](Self::recv) with a read deadline of `now + timeout`. The previous
    /// read deadline is back in place when this returns.
    pub async fn recv_with_timeout(
        &mut self,
        length: isize,
        timeout: Duration,
        retry: Retry,
    ) -> AppResult<Bytes> {
        let mut conn = self.scoped_deadline_recv(timeout);
        let data = conn.recv(length, retry).await?;
        Ok(data)
    }

    pub async fn send_with_timeout(
        &mut self,
        data: &[u8],
        timeout: Duration,
        retry: Retry,
    ) -> AppResult<()> {
        let mut conn = self.scoped_deadline_send(timeout);
        conn.send(data, retry).await?;
        Ok(())
    }

    /// Sends `data` and reads the response with [`recv`](Self::recv).
    pub async fn send_recv(&mut self, data: &[u8], length: isize, retry: Retry) -> AppResult<Bytes> {
        self.send(data, retry).await?;
        self.recv(length, retry).await
    }

    /// Sends `data` and reads the response, the read bounded by `timeout`.
    pub async fn send_recv_with_timeout(
        &mut self,
        data: &[u8],
        length: isize,
        timeout: Duration,
        retry: Retry,
    ) -> AppResult<Bytes> {
        self.send(data, retry).await?;
        self.recv_with_timeout(length, timeout, retry).await
    }

    /// Shuts down the write side. The peer sees end-of-stream.
    pub async fn close(&mut self) -> AppResult<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| AppError::io(e, "close connection failed"))
    }
}

impl<S> Deadline for Connection<S> {
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

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    use tokio::io::{self, duplex, DuplexStream, ReadBuf};

    use super::*;

    fn pair() -> (Connection<DuplexStream>, DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        (Connection::new(client), server)
    }

    #[tokio::test]
    async fn test_recv_exact_length() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"hello world").await.unwrap();

        let data = conn.recv(5, Retry::none()).await.unwrap();
        assert_eq!(&data[..], b"hello");
        let data = conn.recv(6, Retry::none()).await.unwrap();
        assert_eq!(&data[..], b" world");
    }

    #[tokio::test]
    async fn test_recv_exact_length_across_writes() {
        let (mut conn, mut peer) = pair();
        tokio::spawn(async move {
            for chunk in [&b"ab"[..], b"cd", b"ef"] {
                peer.write_all(chunk).await.unwrap();
                time::sleep(Duration::from_millis(10)).await;
            }
            // keep the stream open until the reader is done
            time::sleep(Duration::from_millis(200)).await;
        });

        let data = conn.recv(6, Retry::none()).await.unwrap();
        assert_eq!(&data[..], b"abcdef");
    }

    #[tokio::test]
    async fn test_recv_truncated_by_eof() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"abc").await.unwrap();
        drop(peer);

        let err = conn.recv(10, Retry::times(3)).await.unwrap_err();
        match err {
            AppError::Eof(partial) => assert_eq!(&partial[..], b"abc"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recv_single_read() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"xyz").await.unwrap();

        let data = conn.recv(0, Retry::none()).await.unwrap();
        assert_eq!(&data[..], b"xyz");
    }

    #[tokio::test]
    async fn test_recv_unbounded_stops_after_pause() {
        let (mut conn, mut peer) = pair();
        conn.set_buffer_wait_recv(Duration::from_millis(50));
        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let sent = payload.clone();
        tokio::spawn(async move {
            peer.write_all(&sent[..400]).await.unwrap();
            time::sleep(Duration::from_millis(5)).await;
            peer.write_all(&sent[400..]).await.unwrap();
            // longer than the buffer wait, the reader must not wait for this
            time::sleep(Duration::from_millis(500)).await;
            peer.write_all(b"late").await.unwrap();
        });

        let started = Instant::now();
        let data = conn.recv(-1, Retry::none()).await.unwrap();
        assert_eq!(&data[..], &payload[..]);
        assert!(started.elapsed() < Duration::from_millis(400));
        // the probe deadline does not stick to the connection
        assert!(conn.deadline_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_unbounded_grows_buffer() {
        let (mut conn, mut peer) = pair();
        conn.set_buffer_wait_recv(Duration::from_millis(50));
        let payload = vec![7u8; READ_BUFFER_SIZE * 10 + 3];
        peer.write_all(&payload).await.unwrap();

        let data = conn.recv(-1, Retry::none()).await.unwrap();
        assert_eq!(data.len(), payload.len());
    }

    #[tokio::test]
    async fn test_recv_line_and_till() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"abc\nabc\nhello").await.unwrap();

        let line = conn.recv_line(Retry::none()).await.unwrap();
        assert_eq!(&line[..], b"abc");
        let till = conn.recv_till(b"\n", Retry::none()).await.unwrap();
        assert_eq!(&till[..], b"abc\n");
        let till = conn.recv_till(b"llo", Retry::none()).await.unwrap();
        assert_eq!(&till[..], b"hello");
    }

    #[tokio::test]
    async fn test_recv_line_eof_keeps_partial() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"no newline").await.unwrap();
        drop(peer);

        let err = conn.recv_line(Retry::none()).await.unwrap_err();
        assert!(matches!(err, AppError::Eof(ref data) if &data[..] == b"no newline"));
    }

    #[tokio::test]
    async fn test_recv_till_empty_delimiter() {
        let (mut conn, _peer) = pair();
        let err = conn.recv_till(b"", Retry::none()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidValue(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_with_timeout_restores_deadline() {
        let (mut conn, mut peer) = pair();

        let err = conn
            .recv_with_timeout(4, Duration::from_millis(50), Retry::none())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(conn.deadline_recv().is_none());

        peer.write_all(b"ping").await.unwrap();
        let data = conn
            .recv_with_timeout(4, Duration::from_millis(500), Retry::none())
            .await
            .unwrap();
        assert_eq!(&data[..], b"ping");
        assert!(conn.deadline_recv().is_none());
    }

    #[tokio::test]
    async fn test_with_timeout_restores_previous_deadline() {
        let (mut conn, mut peer) = pair();
        let previous = Instant::now() + Duration::from_secs(30);
        conn.set_deadline(Some(previous));

        peer.write_all(b"pong").await.unwrap();
        conn.send_with_timeout(b"ping", Duration::from_millis(100), Retry::none())
            .await
            .unwrap();
        let data = conn
            .send_recv_with_timeout(b"x", 4, Duration::from_millis(100), Retry::none())
            .await
            .unwrap();
        assert_eq!(&data[..], b"pong");
        assert_eq!(conn.deadline_recv(), Some(previous));
        assert_eq!(conn.deadline_send(), Some(previous));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_recv_restores_deadline() {
        let (mut conn, _peer) = pair();
        let res = time::timeout(
            Duration::from_millis(20),
            conn.recv_with_timeout(1, Duration::from_secs(10), Retry::none()),
        )
        .await;
        assert!(res.is_err());
        assert!(conn.deadline_recv().is_none());
    }

    #[tokio::test]
    async fn test_send_recv() {
        let (mut conn, mut peer) = pair();
        tokio::spawn(async move {
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).await.unwrap();
            peer.write_all(&buf).await.unwrap();
            time::sleep(Duration::from_millis(200)).await;
        });

        let data = conn.send_recv(b"hello", 5, Retry::none()).await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn test_close_signals_eof() {
        let (mut conn, mut peer) = pair();
        conn.send(b"bye", Retry::none()).await.unwrap();
        conn.close().await.unwrap();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retry_resumes_partial_write() {
        let (client, mut peer) = duplex(16);
        let mut conn = Connection::new(client);
        let data: Vec<u8> = (0..32).collect();
        let reader = tokio::spawn(async move {
            // the first attempt fills the pipe and runs into the deadline
            time::sleep(Duration::from_millis(50)).await;
            let mut received = Vec::new();
            peer.read_to_end(&mut received).await.unwrap();
            received
        });

        conn.set_deadline_send(Some(Instant::now() + Duration::from_millis(30)));
        conn.send(&data, Retry::new(20, Duration::from_millis(20)))
            .await
            .unwrap();
        conn.close().await.unwrap();

        assert_eq!(reader.await.unwrap(), data);
    }

    /// Stream whose writes always fail with `err`.
    struct FailingStream {
        writes: Arc<AtomicUsize>,
        err: ErrorKind,
    }

    impl AsyncRead for FailingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for FailingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Err(self.err.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_send_retry_exhaustion() {
        let writes = Arc::new(AtomicUsize::new(0));
        let mut conn = Connection::new(FailingStream {
            writes: writes.clone(),
            err: ErrorKind::BrokenPipe,
        });

        let retry = Retry::new(3, Duration::from_millis(1));
        let err = conn.send(b"data", retry).await.unwrap_err();
        assert!(matches!(err, AppError::Io { .. }));
        assert_eq!(writes.load(Ordering::SeqCst), 4);
        // the caller's policy is untouched
        assert_eq!(retry.count, 3);
    }

    #[tokio::test]
    async fn test_send_eof_is_not_retried() {
        let writes = Arc::new(AtomicUsize::new(0));
        let mut conn = Connection::new(FailingStream {
            writes: writes.clone(),
            err: ErrorKind::WriteZero,
        });

        let err = conn
            .send(b"data", Retry::new(5, Duration::from_millis(1)))
            .await
            .unwrap_err();
        assert!(err.is_eof());
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recv_retry_exhaustion() {
        let writes = Arc::new(AtomicUsize::new(0));
        let mut conn = Connection::new(FailingStream {
            writes,
            err: ErrorKind::BrokenPipe,
        });

        let err = conn
            .recv(4, Retry::new(2, Duration::from_millis(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Io { .. }));
    }
}
