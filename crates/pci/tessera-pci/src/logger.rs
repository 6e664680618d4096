//! `log` backend for environments without their own logger.
//!
//! The engine itself only uses the `log` facade. Embedders that already run
//! a logger need nothing from this module; everyone else registers a sink
//! with [`set_sink`] and installs the backend once with [`init`]. Records
//! emitted before a sink is registered are dropped.

use core::sync::atomic::{AtomicPtr, Ordering};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// The signature of a log sink.
pub type SinkFn = fn(&Record<'_>);

fn null_sink(_record: &Record<'_>) {}

static SINK_FN: AtomicPtr<()> = AtomicPtr::new(null_sink as SinkFn as *mut ());

/// Registers the function that receives every enabled record.
///
/// May be called more than once; the latest sink wins. Uses `Release`
/// ordering so a subsequent [`Log::log`] sees the new function.
pub fn set_sink(sink: SinkFn) {
    SINK_FN.store(sink as *mut (), Ordering::Release);
}

#[inline]
fn load_sink() -> SinkFn {
    let ptr = SINK_FN.load(Ordering::Acquire);
    // SAFETY: Only `SinkFn` pointers (or the initial `null_sink`) are ever
    // stored into SINK_FN.
    unsafe { core::mem::transmute::<*mut (), SinkFn>(ptr) }
}

/// Forwards `log` records to the registered sink.
pub struct SinkLogger;

impl Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            load_sink()(record);
        }
    }

    fn flush(&self) {}
}

static LOGGER: SinkLogger = SinkLogger;

/// Installs [`SinkLogger`] as the global `log` backend.
///
/// # Errors
///
/// Fails if another logger has already been installed.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    fn counting_sink(record: &Record<'_>) {
        if record.target() == "logger-test" {
            SEEN.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn records_reach_registered_sink() {
        set_sink(counting_sink);
        log::set_max_level(LevelFilter::Trace);

        SinkLogger.log(
            &Record::builder()
                .args(format_args!("enabling device"))
                .level(log::Level::Info)
                .target("logger-test")
                .build(),
        );

        assert_eq!(SEEN.load(Ordering::Relaxed), 1);
        set_sink(null_sink);
    }
}
