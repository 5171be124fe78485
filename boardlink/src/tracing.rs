//! Provide tracing, tailored to this program.
//!
//! Programs embedding boardlink should call one of the init_* functions at
//! startup to install a tracing subscriber (i.e., something that emits events
//! to a log).
//!
//! The rest of the crate includes `use crate::tracing::prelude::*` for
//! convenient access to the `trace!()`, `debug!()`, `info!()`, `warn!()`, and
//! `error!()` macros.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
    util::TryInitError,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
///
/// # Panics
///
/// Panics if a global subscriber was already installed.
pub fn init_journald_or_stdout() {
    if let Err(e) = try_init_journald_or_stdout() {
        panic!("failed to install tracing subscriber: {e}");
    }
}

/// Like [`init_journald_or_stdout`], but reports an already-installed
/// subscriber instead of panicking.
pub fn try_init_journald_or_stdout() -> Result<(), TryInitError> {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            return tracing_subscriber::registry().with(layer).try_init();
        }
        try_use_stdout()?;
        error!("Failed to initialize journald logging, using stdout.");
        Ok(())
    } else {
        try_use_stdout()
    }
}

// Log to stdout, filtering according to environment variable RUST_LOG,
// overriding the default level (ERROR) to INFO.
fn try_use_stdout() -> Result<(), TryInitError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .try_init()
}

// Format timestamps in local time and to the nearest second, falling back to
// UTC where the local offset is unavailable.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
