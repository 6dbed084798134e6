//! Log sinks for the sync core.
//!
//! Sync traces (send, replay, reconcile, presence transitions) are emitted at debug level under
//! the `courier_core` target. Each platform routes them to its native sink:
//! unified logging on iOS, logcat on Android, stderr elsewhere.

use tracing_subscriber::EnvFilter;

/// Overrides the default filter on every platform, e.g. `COURIER_LOG=courier_core::messages=trace`.
const FILTER_ENV: &str = "COURIER_LOG";

/// Our own modules at debug, HTTP client chatter capped at info.
const DEFAULT_FILTER: &str = "courier_core=debug,reqwest=info,hyper=info,info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber. Later calls are no-ops, so every app instance may call it.
pub fn init_logging(#[allow(unused)] data_dir: &str) {
    #[cfg(target_os = "ios")]
    init_ios(data_dir);

    #[cfg(target_os = "android")]
    {
        use tracing_subscriber::prelude::*;

        let logcat = paranoid_android::layer("courier").with_filter(filter());
        let _ = tracing_subscriber::registry().with(logcat).try_init();
    }

    #[cfg(not(any(target_os = "ios", target_os = "android")))]
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(true)
            .try_init();
    }
}

/// os_log keeps debug records only while a console is attached, so sync traces also go to
/// `<data_dir>/sync.log`, which bug reports attach.
#[cfg(target_os = "ios")]
fn init_ios(data_dir: &str) {
    use tracing_subscriber::prelude::*;

    let trace_file = std::fs::create_dir_all(data_dir)
        .and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(std::path::Path::new(data_dir).join("sync.log"))
        })
        .map_err(|e| eprintln!("courier: sync.log unavailable: {e}"))
        .ok()
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
        });

    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(tracing_oslog::OsLogger::new("com.courier.sync", "core"))
        .with(trace_file)
        .try_init();
}
