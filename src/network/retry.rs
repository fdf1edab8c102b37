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

use std::time::Duration;

/// Interval used between attempts when a retry policy does not set one.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// How often a failed socket operation is attempted again.
///
/// `Retry` is a plain value: operations copy it and count down on their own
/// copy, the caller's value never changes. `Retry::default()` means no retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Retry {
    /// Remaining attempts after the first one.
    pub count: u32,
    /// Pause between attempts. Zero falls back to [`DEFAULT_RETRY_INTERVAL`].
    pub interval: Duration,
}

impl Retry {
    pub fn new(count: u32, interval: Duration) -> Self {
        Retry { count, interval }
    }

    pub fn times(count: u32) -> Self {
        Retry {
            count,
            interval: Duration::ZERO,
        }
    }

    pub fn none() -> Self {
        Retry::default()
    }

    pub fn is_exhausted(&self) -> bool {
        self.count == 0
    }

    /// Consumes one attempt and returns how long to wait before it, or `None`
    /// when the budget is spent.
    pub fn next_wait(&mut self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        if self.interval.is_zero() {
            Some(DEFAULT_RETRY_INTERVAL)
        } else {
            Some(self.interval)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_no_retry() {
        let mut retry = Retry::default();
        assert!(retry.is_exhausted());
        assert_eq!(retry.next_wait(), None);
    }

    #[test]
    fn test_countdown_on_local_copy() {
        let policy = Retry::new(2, Duration::from_millis(5));
        let mut local = policy;
        assert_eq!(local.next_wait(), Some(Duration::from_millis(5)));
        assert_eq!(local.next_wait(), Some(Duration::from_millis(5)));
        assert_eq!(local.next_wait(), None);
        assert_eq!(policy.count, 2);
    }

    #[test]
    fn test_zero_interval_uses_default() {
        let mut retry = Retry::times(1);
        assert_eq!(retry.next_wait(), Some(DEFAULT_RETRY_INTERVAL));
    }
}
