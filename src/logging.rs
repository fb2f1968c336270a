//! Default wiring from the crash subsystem's injected alert/report
//! callbacks onto `tracing`, mirroring `common/debug.h`'s
//! `log_FATAL..log_TRACE` ladder.
//!
//! A binary embedding this crate is expected to install its own
//! `tracing` subscriber; this module only supplies the callbacks
//! [`crate::crash::init`] needs, it does not configure a subscriber
//! itself.

/// Wire `crash::init`'s alert (fatal) and report (diagnostic) hooks to
/// `tracing::error!`/`tracing::warn!` respectively.
pub fn install_default_crash_logging() {
    crate::crash::init(
        |msg| tracing::error!(target: "crash", "{}", msg),
        |msg| tracing::warn!(target: "crash", "{}", msg),
    );
}

/// Log level ladder mirrored from `common/debug.h`, kept as named
/// functions so collaborators that pass around a level enum (rather
/// than calling a macro directly) have somewhere to dispatch to.
pub fn fatal(msg: &str) {
    tracing::error!("{}", msg);
}

pub fn error(msg: &str) {
    tracing::error!("{}", msg);
}

pub fn warn(msg: &str) {
    tracing::warn!("{}", msg);
}

pub fn info(msg: &str) {
    tracing::info!("{}", msg);
}

pub fn debug(msg: &str) {
    tracing::debug!("{}", msg);
}

pub fn trace(msg: &str) {
    tracing::trace!("{}", msg);
}
