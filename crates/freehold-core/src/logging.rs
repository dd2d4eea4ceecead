//! Logger bootstrap shared by the Freehold binaries.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialise the global logger once, honouring `RUST_LOG` when set.
pub fn init(default_filter: &str) {
    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    INIT.call_once(|| {
        env_logger::Builder::new().parse_filters(&filter).init();
    });
}
