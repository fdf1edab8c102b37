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

use std::io::{self, ErrorKind};

use bytes::Bytes;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing init error: {0}")]
    TracingInit(#[from] tracing_subscriber::util::TryInitError),

    /// network errors
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The peer closed its write side. Holds whatever was read before the close.
    #[error("connection closed by peer after {} bytes", .0.len())]
    Eof(Bytes),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("tls error: {0}")]
    Tls(String),

    /// packet errors
    #[error("payload of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid header size {0}, must be between 1 and 4")]
    InvalidHeaderSize(usize),

    #[error("invalid package size {size}, the maximum is {max}")]
    InvalidPackage { size: usize, max: usize },

    /// marker error
    #[error("incomplete packet")]
    Incomplete,
}

impl AppError {
    /// Classifies a raw socket error and attaches `context`.
    ///
    /// Timeouts and end-of-stream conditions get their own variants so that
    /// callers can tell them apart from transient failures.
    pub fn io(err: io::Error, context: impl Into<String>) -> AppError {
        match err.kind() {
            ErrorKind::TimedOut => AppError::Timeout(context.into()),
            ErrorKind::UnexpectedEof | ErrorKind::WriteZero => AppError::Eof(Bytes::new()),
            _ => AppError::Io {
                context: context.into(),
                source: err,
            },
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, AppError::Eof(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout(_))
    }

    /// Replaces the partial data carried by an end-of-stream error.
    pub(crate) fn with_partial(self, data: Bytes) -> AppError {
        match self {
            AppError::Eof(_) => AppError::Eof(data),
            other => other,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::io(err, "io error")
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_io_error_keeps_source() {
        let err = AppError::io(
            io::Error::new(ErrorKind::ConnectionRefused, "refused"),
            "write data failed",
        );
        assert!(matches!(err, AppError::Io { .. }));
        assert!(err.to_string().starts_with("write data failed"));
        let source = err.source().unwrap();
        let io_err = source.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io_err.kind(), ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_io_error_classification() {
        assert!(AppError::io(ErrorKind::TimedOut.into(), "read").is_timeout());
        assert!(AppError::io(ErrorKind::UnexpectedEof.into(), "read").is_eof());
        assert!(AppError::io(ErrorKind::WriteZero.into(), "write").is_eof());
        assert!(!AppError::io(ErrorKind::BrokenPipe.into(), "write").is_eof());
    }

    #[test]
    fn test_with_partial_only_touches_eof() {
        let err = AppError::Eof(Bytes::new()).with_partial(Bytes::from_static(b"abc"));
        assert!(matches!(err, AppError::Eof(ref data) if data.as_ref() == b"abc"));

        let err = AppError::Timeout("read".into()).with_partial(Bytes::from_static(b"abc"));
        assert!(err.is_timeout());
    }
}
