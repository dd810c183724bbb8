use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const DEBUG_ENV: &str = "REPLAY_DEBUG";

/// Logs panics through `tracing` so that they end up in the same (JSON) stream as everything
/// else, on a single line unless a backtrace was captured.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // noop unless RUST_BACKTRACE or RUST_LIB_BACKTRACE is set
    let backtrace = Backtrace::capture();
    let backtrace_captured = backtrace.status() == BacktraceStatus::Captured;
    let payload = match panic_info.payload().downcast_ref::<&str>() {
        Some(s) => Some(*s),
        None => panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::as_str),
    };

    match (panic_info.location(), payload, backtrace_captured) {
        (Some(location), Some(payload), false) => {
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => {
            tracing::error!("{}\n{}", panic_info, backtrace);
        }
    };
}

fn debug_mode() -> bool {
    std::env::var(DEBUG_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("true"))
}

pub(super) fn register() {
    // RUST_LOG overrides the default level. The AWS SDK logs every request at debug.
    let debug_mode = debug_mode();
    let default_log_level = if debug_mode {
        "debug,aws_smithy_runtime=info,aws_config=info,hyper=info"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(default_log_level).unwrap_or_else(|_| EnvFilter::new(Level::INFO.as_str()))
    });

    let layer = if debug_mode {
        fmt::layer().boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
