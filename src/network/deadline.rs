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

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use tokio::io;
use tokio::time::{timeout_at, Instant};

/// Read and write deadlines of a connection.
///
/// `None` disables a deadline. Connections check their deadlines on every raw
/// read or write, so a value set here applies to the next socket operation.
pub trait Deadline {
    fn deadline_recv(&self) -> Option<Instant>;

    fn deadline_send(&self) -> Option<Instant>;

    fn set_deadline_recv(&mut self, deadline: Option<Instant>);

    fn set_deadline_send(&mut self, deadline: Option<Instant>);

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_deadline_recv(deadline);
        self.set_deadline_send(deadline);
    }

    /// Sets the read deadline to `now + timeout` until the returned guard is dropped,
    /// then puts the previous read deadline back.
    fn scoped_deadline_recv(&mut self, timeout: Duration) -> DeadlineOverride<'_, Self>
    where
        Self: Sized,
    {
        DeadlineOverride::new(self, Direction::Recv, Instant::now() + timeout)
    }

    /// Write side counterpart of [`Deadline::scoped_deadline_recv`].
    fn scoped_deadline_send(&mut self, timeout: Duration) -> DeadlineOverride<'_, Self>
    where
        Self: Sized,
    {
        DeadlineOverride::new(self, Direction::Send, Instant::now() + timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Recv,
    Send,
}

/// A temporarily overridden deadline.
///
/// Dereferences to the connection. Restoration happens in `Drop`, so it also
/// runs when the operation fails or its future is cancelled.
#[derive(Debug)]
pub struct DeadlineOverride<'a, C: Deadline> {
    conn: &'a mut C,
    direction: Direction,
    previous: Option<Instant>,
}

impl<'a, C: Deadline> DeadlineOverride<'a, C> {
    fn new(conn: &'a mut C, direction: Direction, deadline: Instant) -> Self {
        let previous = match direction {
            Direction::Recv => {
                let previous = conn.deadline_recv();
                conn.set_deadline_recv(Some(deadline));
                previous
            }
            Direction::Send => {
                let previous = conn.deadline_send();
                conn.set_deadline_send(Some(deadline));
                previous
            }
        };
        DeadlineOverride {
            conn,
            direction,
            previous,
        }
    }
}

impl<C: Deadline> Deref for DeadlineOverride<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn
    }
}

impl<C: Deadline> DerefMut for DeadlineOverride<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn
    }
}

impl<C: Deadline> Drop for DeadlineOverride<'_, C> {
    fn drop(&mut self) {
        match self.direction {
            Direction::Recv => self.conn.set_deadline_recv(self.previous),
            Direction::Send => self.conn.set_deadline_send(self.previous),
        }
    }
}

/// Runs a socket operation, failing with `TimedOut` once `deadline` has passed.
pub(crate) async fn with_deadline<T, F>(deadline: Option<Instant>, op: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match deadline {
        Some(deadline) => match timeout_at(deadline, op).await {
            Ok(res) => res,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        },
        None => op.await,
    }
}
