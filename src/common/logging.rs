// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

use crate::common::app_config::MicarocksConfig;

static INIT: OnceLock<()> = OnceLock::new();

/// Formats events on one glog-shaped line so worker logs interleave cleanly
/// with the other engine components:
/// `Lyyyymmdd hh:mm:ss.uuuuuu tid file:line] message`
struct WorkerLogFormatter;

fn level_tag(level: tracing::Level) -> char {
    match level {
        tracing::Level::ERROR => 'E',
        tracing::Level::WARN => 'W',
        tracing::Level::INFO => 'I',
        tracing::Level::DEBUG => 'D',
        tracing::Level::TRACE => 'T',
    }
}

/// Stable per-thread ordinal for the log prefix. `std::thread::ThreadId` has
/// no numeric accessor, so threads draw a number from a process-wide counter
/// the first time they log.
fn thread_ordinal() -> u64 {
    static NEXT_THREAD_ORDINAL: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ORDINAL: u64 = NEXT_THREAD_ORDINAL.fetch_add(1, Ordering::Relaxed);
    }
    ORDINAL.with(|ordinal| *ordinal)
}

impl<S, N> FormatEvent<S, N> for WorkerLogFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "{}{} {} {}:{}] ",
            level_tag(*metadata.level()),
            Local::now().format("%Y%m%d %H:%M:%S%.6f"),
            thread_ordinal(),
            metadata.file().unwrap_or("unknown"),
            metadata.line().unwrap_or(0),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

pub fn init_with_level(level: &str) {
    INIT.get_or_init(|| {
        // The caller provides the full filter expression; per-target
        // overrides belong in the config, not here.
        let _ = tracing_fmt()
            .with_env_filter(EnvFilter::new(level))
            .with_writer(std::io::stderr)
            // ANSI colors only when stderr is a terminal.
            .with_ansi(atty::is(atty::Stream::Stderr))
            .event_format(WorkerLogFormatter)
            .try_init();
    });
}

/// Initialize from the loaded worker config; `log_filter` wins over
/// `log_level` when set.
pub fn init_from_config(config: &MicarocksConfig) {
    init_with_level(&config.effective_log_filter());
}

pub fn init() {
    init_with_level("info");
}

pub use tracing::{debug, error, info, trace, warn};
