// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Sets up the `tracing` subscriber.
//!
//! `LIGHTNVR_LOG` holds an `env_filter` spec (default `info`). `LIGHTNVR_FORMAT`
//! selects the output shape: human-readable with local timestamps by default,
//! `systemd` for sd-daemon(3) level prefixes, or `json` for log collectors.
//! Panics are routed through the subscriber too, so they carry timestamps and
//! land in the same sink; `LIGHTNVR_PANIC_HOOK=false` restores the default
//! hook.

use tracing::error;
use tracing_core::{Event, Level, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{format::Writer, time::FormatTime, FmtContext, FormatFields, FormattedFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    EnvFilter, Layer, Registry,
};

#[derive(Copy, Clone, Debug)]
enum Format {
    Full,
    Systemd,
    Json,
}

impl Format {
    fn from_env() -> Self {
        match std::env::var("LIGHTNVR_FORMAT").as_deref() {
            Ok("systemd") => Format::Systemd,
            Ok("json") => Format::Json,
            _ => Format::Full,
        }
    }
}

/// Local wall-clock timestamps via jiff, microsecond precision.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", jiff::Zoned::now().strftime("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}

/// sd-daemon(3) log prefix for a level. systemd strips these and maps them to
/// journal priorities.
fn sd_prefix(level: Level) -> &'static str {
    if level == Level::ERROR {
        "<3>"
    } else if level == Level::WARN {
        "<4>"
    } else if level == Level::INFO {
        "<5>"
    } else if level == Level::DEBUG {
        "<6>"
    } else {
        "<7>"
    }
}

/// Event format for the `systemd` output shape: no timestamp (the journal
/// adds its own), a level prefix, the thread, the span path, then the event.
struct SystemdFormat;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for SystemdFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        // Events forwarded from the `log` crate carry their real metadata in
        // normalized form.
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());

        writer.write_str(sd_prefix(*meta.level()))?;
        let thread = std::thread::current();
        write!(writer, "{} ", thread.name().unwrap_or("unnamed-thread"))?;

        let mut in_scope = false;
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                match ext.get::<FormattedFields<N>>() {
                    Some(fields) if !fields.is_empty() => write!(writer, "{{{fields}}}:")?,
                    _ => writer.write_char(':')?,
                }
                in_scope = true;
            }
        }
        if in_scope {
            writer.write_char(' ')?;
        }

        write!(writer, "{}: ", meta.target())?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Panic hook that logs through the subscriber instead of writing raw text to
/// stderr.
fn log_panic(info: &std::panic::PanicHookInfo) {
    let payload = info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str));
    error!(
        target: std::env!("CARGO_CRATE_NAME"),
        location = info.location().map(tracing::field::display),
        payload = message.map(tracing::field::display),
        backtrace = %std::backtrace::Backtrace::force_capture(),
        "panic",
    );
}

fn fmt_layer(format: Format, test_writer: bool) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = tracing_subscriber::fmt::Layer::new().with_thread_names(true);
    if test_writer {
        // Captured per-test output; format selection doesn't apply.
        return base.with_timer(LocalTimer).with_test_writer().boxed();
    }
    match format {
        Format::Full => base
            .with_timer(LocalTimer)
            .with_writer(std::io::stderr)
            .boxed(),
        Format::Systemd => base
            .with_ansi(false)
            .event_format(SystemdFormat)
            .with_writer(std::io::stderr)
            .boxed(),
        Format::Json => base.json().with_writer(std::io::stderr).boxed(),
    }
}

fn install_inner(format: Format, test_writer: bool) {
    tracing_log::LogTracer::init().expect("no global logger set yet");
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("LIGHTNVR_LOG")
        .from_env_lossy();
    let subscriber = Registry::default().with(fmt_layer(format, test_writer).with_filter(filter));
    tracing::subscriber::set_global_default(subscriber).expect("no global subscriber set yet");
}

pub fn install() {
    install_inner(Format::from_env(), false);
    let hook_disabled = matches!(
        std::env::var("LIGHTNVR_PANIC_HOOK").as_deref(),
        Ok("false") | Ok("0")
    );
    if !hook_disabled {
        std::panic::set_hook(Box::new(log_panic));
    }
}

pub fn install_for_tests() {
    install_inner(Format::Full, true);
}
