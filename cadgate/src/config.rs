//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `CADGATE_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **Built-in defaults** - See the `Default` implementations below
//! 2. **YAML config file** - Base configuration (default: `config.yaml`)
//! 3. **Environment variables** - Variables prefixed with `CADGATE_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `CADGATE_CONVERSION__LINEAR_DEFLECTION=0.05` sets the `conversion.linear_deflection` field.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use cadgate::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//!
//! println!("Server will bind to {}:{}", config.host, config.port);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Structure
//!
//! - **Server**: `host`, `port` - HTTP server binding configuration
//! - **Routes**: `routes.step_only`, `routes.multi_format`, `routes.mesh` - which upload endpoints
//!   are mounted
//! - **Conversion**: `conversion.linear_deflection` - tessellation tolerance handed to the kernel
//! - **Uploads**: `uploads.temp_dir`, `uploads.max_file_size` - transient file handling
//! - **Limits**: `limits.max_concurrent_conversions` and friends - kernel capacity protection
//! - **CORS**: `cors.allowed_origins`, `cors.max_age`
//! - **Features**: `enable_metrics`, `enable_otel_export` - optional feature toggles
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! CADGATE_PORT=8080
//! CADGATE_ROUTES__STEP_ONLY__ENABLED=false
//! CADGATE_UPLOADS__TEMP_DIR=/var/tmp/cadgate
//! CADGATE_LIMITS__MAX_CONCURRENT_CONVERSIONS=4
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// Linear deflection used when tessellating shapes, in the model units of the uploaded file.
pub const DEFAULT_LINEAR_DEFLECTION: f64 = 0.1;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "CADGATE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty (or missing) YAML file yields a working server with
/// both upload endpoints mounted.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Upload endpoints to mount
    pub routes: RoutesConfig,
    /// Parameters handed to the geometry kernel
    pub conversion: ConversionConfig,
    /// Transient upload storage
    pub uploads: UploadsConfig,
    /// Resource limits for protecting kernel capacity
    pub limits: LimitsConfig,
    /// CORS configuration for browser clients
    pub cors: CorsConfig,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

/// The upload endpoints.
///
/// All share the same gateway. The face-count routes differ only in how uploads are dispatched to
/// the kernel; the mesh route dispatches like `multi_format` and answers with the triangles.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutesConfig {
    /// Every upload goes to the STEP reader regardless of its suffix.
    pub step_only: RouteConfig,
    /// Uploads are dispatched by suffix: STEP, STL, and a stub for OBJ.
    pub multi_format: RouteConfig,
    /// Tessellated vertices and triangles instead of a face count. Off by default.
    pub mesh: RouteConfig,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            step_only: RouteConfig {
                enabled: true,
                path: "/upload-step/".to_string(),
            },
            multi_format: RouteConfig {
                enabled: true,
                path: "/api/convert-step".to_string(),
            },
            mesh: RouteConfig {
                enabled: false,
                path: "/api/convert-mesh".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub enabled: bool,
    /// Absolute path the endpoint is mounted at
    pub path: String,
}

/// Kernel parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConversionConfig {
    /// Maximum chordal deviation of the tessellation from the exact surface, in model units.
    /// Not adaptive and not settable per request.
    pub linear_deflection: f64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            linear_deflection: DEFAULT_LINEAR_DEFLECTION,
        }
    }
}

/// Transient upload storage.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadsConfig {
    /// Directory for transient upload copies. Defaults to the system temp directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    /// Maximum upload size in bytes.
    /// Default: 256MB
    pub max_file_size: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            max_file_size: 256 * 1024 * 1024, // 256MB
        }
    }
}

/// Resource limits for protecting kernel capacity.
///
/// Parsing and meshing are CPU bound; these limits bound how many run at once rather than letting
/// every request compete for the blocking pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Maximum number of kernel conversions running at once.
    /// Default: 0 (unlimited)
    pub max_concurrent_conversions: usize,
    /// Maximum number of conversions that can wait for a slot.
    /// When this limit is reached, new uploads receive HTTP 429 immediately.
    /// Set to 0 for an unlimited waiting queue.
    /// Default: 20
    pub max_waiting_conversions: usize,
    /// Maximum time to wait for a conversion slot before returning HTTP 429.
    /// Zero rejects immediately when no slot is available.
    /// Default: 60s
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_conversions: 0,
            max_waiting_conversions: 20,
            max_wait: Duration::from_secs(60),
        }
    }
}

/// CORS (Cross-Origin Resource Sharing) configuration.
///
/// The default allows every origin, method and header. That is a development setting; list the
/// frontend origins explicitly in production.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests
    pub allowed_origins: Vec<CorsOrigin>,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Wildcard],
            max_age: Some(3600), // Cache preflight for 1 hour
        }
    }
}

/// CORS origin specification.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

// Written back as the same strings the deserializers accept, so the defaults survive a round
// trip through figment.
impl Serialize for CorsOrigin {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CorsOrigin::Wildcard => serializer.serialize_str("*"),
            CorsOrigin::Url(url) => serializer.serialize_str(url.as_str()),
        }
    }
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            routes: RoutesConfig::default(),
            conversion: ConversionConfig::default(),
            uploads: UploadsConfig::default(),
            limits: LimitsConfig::default(),
            cors: CorsConfig::default(),
            enable_metrics: false,
            enable_otel_export: false,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        let deflection = self.conversion.linear_deflection;
        if !deflection.is_finite() || deflection <= 0.0 {
            return Err(Error::Internal {
                operation: format!("Config validation: conversion.linear_deflection must be a positive number, got {deflection}"),
            });
        }

        if self.uploads.max_file_size == 0 {
            return Err(Error::Internal {
                operation: "Config validation: uploads.max_file_size must be greater than 0".to_string(),
            });
        }

        let enabled: Vec<(&str, &RouteConfig)> = [
            ("step_only", &self.routes.step_only),
            ("multi_format", &self.routes.multi_format),
            ("mesh", &self.routes.mesh),
        ]
        .into_iter()
        .filter(|(_, route)| route.enabled)
        .collect();

        if enabled.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: no upload route is enabled. \
                 Enable routes.step_only, routes.multi_format or routes.mesh."
                    .to_string(),
            });
        }

        for (_, route) in &enabled {
            if !route.path.starts_with('/') {
                return Err(Error::Internal {
                    operation: format!("Config validation: route path '{}' must start with '/'", route.path),
                });
            }
        }

        for (i, (name, route)) in enabled.iter().enumerate() {
            if let Some((other, _)) = enabled[i + 1..].iter().find(|(_, r)| r.path == route.path) {
                return Err(Error::Internal {
                    operation: format!("Config validation: routes.{name} and routes.{other} share the path '{}'", route.path),
                });
            }
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values.
            // CADGATE_CONFIG names the file itself and is not a config key.
            .merge(Env::prefixed("CADGATE_").ignore(&["config"]).split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
