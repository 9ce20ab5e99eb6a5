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
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::{AppError, AppResult};

/// Keeps the non-blocking file writer alive; dropping it flushes pending log lines.
pub struct LogGuard {
    _worker_guard: WorkerGuard,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        tracing::info!("flushing log writer");
    }
}

fn timer() -> ChronoLocal {
    ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string())
}

/// Console-only logging, filtered by `RUST_LOG`.
pub fn setup_local_tracing() -> AppResult<()> {
    dotenv().ok();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer())
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("install tracing subscriber: {}", e)))
}

/// Logs to stdout and to an hourly rolling file under `log_dir`.
pub fn setup_tracing(log_dir: &str) -> AppResult<LogGuard> {
    dotenv().ok();
    let file_appender = tracing_appender::rolling::hourly(log_dir, "stonewire.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    let writer = non_blocking.and(std::io::stdout);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer())
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("install tracing subscriber: {}", e)))?;

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}
