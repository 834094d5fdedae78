//! Ambient engine configuration: the HTTP notification sink and the
//! response-size limits `spec.md` §4.3 hard-codes. Modeled on
//! `services/forwarder/src/config.rs`'s TOML-first, `Option`-field-with-
//! defaults loading pattern.

use serde::Deserialize;
use std::path::Path;

use crate::error::Error;
use crate::template::{MAX_RESPONSE_BYTES, MAX_RESPONSE_PARTS};

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig { host: "127.0.0.1".into(), port: 3480 }
    }
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub max_response_bytes: usize,
    pub max_response_parts: usize,
    pub read_chunk_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_response_bytes: MAX_RESPONSE_BYTES,
            max_response_parts: MAX_RESPONSE_PARTS,
            read_chunk_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub http: HttpConfig,
    pub limits: Limits,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    http: Option<RawHttpConfig>,
    limits: Option<RawLimits>,
}

#[derive(Debug, Deserialize, Default)]
struct RawHttpConfig {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct RawLimits {
    max_response_bytes: Option<usize>,
    max_response_parts: Option<usize>,
    read_chunk_bytes: Option<usize>,
}

impl EngineConfig {
    /// Load from a TOML file, falling back to `spec.md`-fixed defaults for
    /// any field the file omits.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self, Error> {
        let raw: RawConfig = toml::from_str(text).map_err(|e| Error::BadArgument(e.to_string()))?;
        let defaults = EngineConfig::default();
        let http = raw.http.map_or(defaults.http.clone(), |h| HttpConfig {
            host: h.host.unwrap_or(defaults.http.host.clone()),
            port: h.port.unwrap_or(defaults.http.port),
        });
        let limits = raw.limits.map_or(defaults.limits.clone(), |l| Limits {
            max_response_bytes: l.max_response_bytes.unwrap_or(defaults.limits.max_response_bytes),
            max_response_parts: l.max_response_parts.unwrap_or(defaults.limits.max_response_parts),
            read_chunk_bytes: l.read_chunk_bytes.unwrap_or(defaults.limits.read_chunk_bytes),
        });
        Ok(EngineConfig { http, limits })
    }
}
