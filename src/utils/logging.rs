use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub fn init() {
    init_with(None);
}

/// `RUST_LOG` wins, then `level`, then `info`. A second call is a no-op.
pub fn init_with(level: Option<&str>) {
    let fmt_layer = fmt::layer().with_target(true);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
