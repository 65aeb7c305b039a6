use tracing_subscriber::filter::LevelFilter;

/// Initialize tracing/logging for the process.
///
/// Verbosity is process-wide and should be configured before any other call.
/// `off` silences everything, matching the quietest level the library
/// supports; unknown strings fall back to `info`.
pub fn init(default_level: &str) {
    let filter = match default_level.to_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" | "warning" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    };

    // Use try_init so tests and embedding applications can call this multiple
    // times without panicking
    let _ = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .try_init();
}
