//! provides logging helpers

use tracing_subscriber::filter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// Defaults to INFO and reads `RUST_LOG` for overrides. The http2 frame
/// targets are capped at warn so debug runs stay readable.
pub fn init() {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
        .add_directive("h2=warn".parse().expect("static directive"))
        .add_directive("tower=warn".parse().expect("static directive"));

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    registry().with(fmt_layer).init();
}
