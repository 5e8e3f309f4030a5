use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// The default level is INFO, or DEBUG when `ACT_DEBUG=1`; `RUST_LOG` directives still apply on top.
pub fn initialize_logging() {
    let is_debug = std::env::var("ACT_DEBUG")
        .unwrap_or_default()
        .contains('1');

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
