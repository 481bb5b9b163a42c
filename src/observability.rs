//! Logging and diagnostics for the pipeline engine.
//!
//! The engine logs through the `log` facade: stage boundaries and transport
//! transitions at `info`, per-chunk detail at `debug`. Binaries and tests that want
//! to see the output call [`init_logging`] once. The `log_metric!` macro is the
//! tool for structured key/value events that are meant to be grepped out of a run.

use std::fs::OpenOptions;
use std::sync::Once;

use log::LevelFilter;

use crate::error::Result;

static INIT_LOGGER: Once = Once::new();

/// Logs a structured key-value metric at debug level under the `sliceflow::metric`
/// target.
///
/// # Example
/// ```
/// use sliceflow::log_metric;
/// let stage = 2;
/// log_metric!("event"="stage_complete", "stage"=&stage);
/// ```
#[macro_export]
macro_rules! log_metric {
    ($($key:literal = $value:expr),+ $(,)?) => {
        if log::log_enabled!(target: "sliceflow::metric", log::Level::Debug) {
            let mut parts = Vec::new();
            $(
                parts.push(format!("\"{}\": \"{}\"", $key, $value));
            )+
            log::debug!(target: "sliceflow::metric", "SLICEFLOW_METRIC: {{ {} }}", parts.join(", "));
        }
    };
}

/// Installs a global `env_logger` once per process.
///
/// `level` is parsed as a `log::LevelFilter` (`"info"`, `"debug"`, ...); when the
/// `RUST_LOG` environment variable is set it takes precedence. If `log_file` is
/// given, output is appended there instead of stderr. Later calls are no-ops.
pub fn init_logging(level: &str, log_file: Option<&str>) -> Result<()> {
    let filter: LevelFilter = level.parse().unwrap_or(LevelFilter::Info);
    let target = match log_file {
        Some(path) => Some(OpenOptions::new().append(true).create(true).open(path)?),
        None => None,
    };

    INIT_LOGGER.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(filter);
        builder.parse_default_env();

        // Prefix each line with the level and the worker thread name.
        builder.format(|buf, record| {
            use std::io::Write;
            let thread = std::thread::current();
            writeln!(
                buf,
                "[{}] [{}] {}",
                record.level(),
                thread.name().unwrap_or("main"),
                record.args()
            )
        });

        if let Some(file) = target {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }

        let _ = builder.try_init();
    });
    Ok(())
}
