//! An HTTP service that converts, recompresses and resizes uploaded JPEG and
//! PNG images. Nothing is stored: every request is decoded, transformed and
//! re-encoded in memory.

pub mod codec;
pub mod config;
pub mod server;

/// Logging setup shared by the binary
pub mod util {
    use tracing_subscriber::EnvFilter;

    /// Install the global fmt subscriber. `RUST_LOG` wins over `default_level`.
    pub fn init_tracing(default_level: &str) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
