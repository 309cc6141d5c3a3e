//! Service configuration. Values are layered: built-in defaults, then an
//! optional TOML file, then `IMGCONV_*` environment variables, and finally the
//! bare `PORT` variable set by container hosts.

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;

/// Config file read from the working directory unless `IMGCONV_CONFIG` is set
pub const CONFIG_FILE: &str = "imgconv.toml";

/// Default quality for the compress routes
pub const DEFAULT_QUALITY: i64 = 50;

/// Default resize target, in pixels
pub const DEFAULT_WIDTH: i64 = 100;
pub const DEFAULT_HEIGHT: i64 = 100;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
const DEFAULT_MAX_DIMENSION: u32 = 10_000;
const DEFAULT_MAX_DECODE_ALLOC: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Interface to bind
    pub host: String,

    /// Listening port
    pub port: u16,

    /// Largest accepted `file` field, in bytes
    pub max_upload_bytes: usize,

    /// Largest accepted resize width or height
    pub max_dimension: u32,

    /// Allocation ceiling handed to the decoder
    pub max_decode_alloc: u64,

    /// Tracing filter used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_dimension: DEFAULT_MAX_DIMENSION,
            max_decode_alloc: DEFAULT_MAX_DECODE_ALLOC,
            log_level: "info".into(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment
    pub fn load() -> Result<Self, ConfigError> {
        let file = env::var("IMGCONV_CONFIG").unwrap_or_else(|_| CONFIG_FILE.into());
        Self::build(&file, env::var("PORT").ok())
    }

    /// Layer the config file, `IMGCONV_*` variables and a `PORT` override
    /// over the defaults
    pub fn build(file: &str, port: Option<String>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::new(file, FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix("IMGCONV").try_parsing(true));

        if let Some(port) = port {
            builder = builder.set_override("port", port)?;
        }

        builder.build()?.try_deserialize()
    }
}
