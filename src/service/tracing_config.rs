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

use dotenv::dotenv;
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::config::LogConfig;
use super::AppResult;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn env_filter(default_level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy()
}

/// Maps the `-v` count of the command line to a level.
pub fn verbosity_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Installs a stdout subscriber as the global default. `RUST_LOG` (also read
/// from `.env`) overrides `default_level`.
pub fn setup_local_tracing(default_level: LevelFilter) -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(default_level))
        .try_init()?;
    Ok(())
}

/// Like [`setup_local_tracing`], and also writes to an hourly rolling file.
///
/// Keep the returned guard alive, buffered lines are written out when it drops.
pub fn setup_tracing(config: &LogConfig, default_level: LevelFilter) -> AppResult<WorkerGuard> {
    dotenv().ok();
    let file_appender = tracing_appender::rolling::hourly(&config.dir, &config.file_prefix);
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(default_level))
        .try_init()?;
    Ok(worker_guard)
}

/// A subscriber that is not installed globally, for handing to a single server
/// with `with_dispatch`.
pub fn server_dispatch(default_level: LevelFilter) -> Dispatch {
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let subscriber = tracing_subscriber::fmt()
        .with_timer(timer)
        .with_target(true)
        .with_line_number(true)
        .with_env_filter(env_filter(default_level))
        .finish();
    Dispatch::new(subscriber)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_level() {
        assert_eq!(verbosity_level(0), LevelFilter::WARN);
        assert_eq!(verbosity_level(2), LevelFilter::DEBUG);
        assert_eq!(verbosity_level(9), LevelFilter::TRACE);
    }

    #[test]
    fn test_server_dispatch_is_scoped() {
        let dispatch = server_dispatch(LevelFilter::DEBUG);
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::debug!("scoped to this closure");
        });
    }
}
