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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::{PacketOptions, Retry, DEFAULT_BUFFER_WAIT, DEFAULT_HEADER_SIZE};

use super::{AppError, AppResult};

/// How the echo server reads client data.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpMode {
    /// one length-prefixed packet at a time
    #[default]
    Packet,
    /// whatever arrives, using unbounded reads
    Raw,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PacketConfig {
    #[serde(default = "default_header_size")]
    pub header_size: usize,
    /// 0 means the largest size the header can express
    #[serde(default)]
    pub max_data_size: usize,
}

fn default_header_size() -> usize {
    DEFAULT_HEADER_SIZE
}

impl Default for PacketConfig {
    fn default() -> Self {
        PacketConfig {
            header_size: DEFAULT_HEADER_SIZE,
            max_data_size: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub count: u32,
    /// 0 means the default interval
    #[serde(default)]
    pub interval_ms: u64,
}

impl From<&RetryConfig> for Retry {
    fn from(config: &RetryConfig) -> Self {
        Retry::new(config.count, Duration::from_millis(config.interval_ms))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpConfig {
    pub address: String,
    #[serde(default)]
    pub mode: TcpMode,
    #[serde(default = "default_buffer_wait_ms")]
    pub buffer_wait_ms: u64,
    /// idle time after which a client connection is dropped, 0 to wait forever
    #[serde(default)]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub packet: PacketConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub tls: Option<TlsConfig>,
}

fn default_buffer_wait_ms() -> u64 {
    DEFAULT_BUFFER_WAIT.as_millis() as u64
}

impl TcpConfig {
    pub fn packet_options(&self) -> PacketOptions {
        PacketOptions::with_header_size(self.packet.header_size)
            .max_data_size(self.packet.max_data_size)
            .retry(Retry::from(&self.retry))
    }

    pub fn buffer_wait(&self) -> Duration {
        Duration::from_millis(self.buffer_wait_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpConfig {
    pub address: String,
    /// 0 means the default datagram buffer
    #[serde(default)]
    pub buffer_size: usize,
}

/// File logging, in addition to stdout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    pub dir: String,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

fn default_file_prefix() -> String {
    format!("{}.log", env!("CARGO_PKG_NAME"))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub tcp: TcpConfig,
    pub udp: Option<UdpConfig>,
    pub log: Option<LogConfig>,
}

impl AppConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<AppConfig> {
        let path_str = path.as_ref().to_str().ok_or(AppError::InvalidValue(format!(
            "config file path: {}",
            path.as_ref().to_string_lossy()
        )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> AppResult<()> {
        self.tcp.packet_options().max_payload()?;
        if self.tcp.mode == TcpMode::Raw && self.tcp.buffer_wait_ms == 0 {
            return Err(AppError::InvalidValue(
                "tcp.buffer_wait_ms must be positive in raw mode".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::Builder;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config() {
        let file = write_config(
            r#"
            [tcp]
            address = ":8999"
            "#,
        );
        let config = AppConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.tcp.mode, TcpMode::Packet);
        assert_eq!(config.tcp.buffer_wait(), DEFAULT_BUFFER_WAIT);
        assert_eq!(config.tcp.read_timeout(), None);
        assert_eq!(
            config.tcp.packet_options(),
            PacketOptions::with_header_size(DEFAULT_HEADER_SIZE)
        );
        assert!(config.tcp.tls.is_none());
        assert!(config.udp.is_none());
        assert!(config.log.is_none());
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"
            [tcp]
            address = "127.0.0.1:9000"
            mode = "raw"
            buffer_wait_ms = 5
            read_timeout_ms = 30000

            [tcp.packet]
            header_size = 4
            max_data_size = 1048576

            [tcp.retry]
            count = 3
            interval_ms = 50

            [udp]
            address = ":9001"
            buffer_size = 2048

            [log]
            dir = "logs"
            "#,
        );
        let config = AppConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.tcp.mode, TcpMode::Raw);
        assert_eq!(config.tcp.read_timeout(), Some(Duration::from_secs(30)));
        let options = config.tcp.packet_options();
        assert_eq!(options.header_size, 4);
        assert_eq!(options.max_data_size, 1048576);
        assert_eq!(options.retry, Retry::new(3, Duration::from_millis(50)));
        assert_eq!(config.udp.unwrap().buffer_size, 2048);
        assert_eq!(config.log.unwrap().file_prefix, "framenet.log");
    }

    #[test]
    fn test_invalid_header_size() {
        let file = write_config(
            r#"
            [tcp]
            address = ":8999"
            [tcp.packet]
            header_size = 8
            "#,
        );
        let err = AppConfig::set_up_config(file.path()).unwrap_err();
        assert!(matches!(err, AppError::InvalidHeaderSize(8)));
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::set_up_config("/nonexistent/framenet.toml").unwrap_err();
        assert!(matches!(err, AppError::ConfigFileError(_)));
    }
}
