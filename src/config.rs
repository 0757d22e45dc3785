//! Tunnel configuration
//!
//! Both endpoints read the same settings once at startup: a TOML file
//! supplies defaults, command-line flags override, and everything is
//! validated into an immutable [`TunnelConfig`] before any socket opens.
//! Misconfiguration is fatal here, never a runtime surprise.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::codec;

/// Listen and target address when none is configured.
pub const DEFAULT_SERVER: &str = "127.0.0.1:5354";

/// Plaintext bytes per chunk when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 40;

/// Per-query timeout in seconds when none is configured.
pub const DEFAULT_TIMEOUT_SECS: u64 = 4;

/// Retransmission cap per chunk when none is configured.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Longest tunnel domain that still leaves QNAME room for payload labels.
pub const MAX_DOMAIN_LEN: usize = 190;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {0:?}: {1}")]
    File(PathBuf, std::io::Error),

    #[error("config file {0:?}: {1}")]
    Parse(PathBuf, Box<toml::de::Error>),

    #[error("key file {0:?}: {1}")]
    KeyFile(PathBuf, std::io::Error),

    #[error("no key configured; pass --key, --key-file, or set `key` in the config file")]
    MissingKey,

    #[error("key is not valid hex")]
    BadKeyHex,

    #[error("key must be 32 bytes (64 hex characters), got {0} bytes")]
    BadKeyLength(usize),

    #[error("no tunnel domain configured; pass --domain or set `domain` in the config file")]
    MissingDomain,

    #[error("domain must be non-empty ASCII of at most {MAX_DOMAIN_LEN} octets: {0:?}")]
    BadDomain(String),

    #[error("invalid server address {0:?}: {1}")]
    BadServer(String, std::net::AddrParseError),

    #[error("chunk size must be at least 1")]
    ChunkTooSmall,

    #[error("chunk size {got} exceeds the QNAME budget for this domain (max {max})")]
    ChunkTooLarge { got: usize, max: usize },

    #[error("message of {got} bytes exceeds the {max}-byte ceiling for this chunk size")]
    MessageTooLarge { got: usize, max: usize },
}

/// Raw settings as they arrive from a TOML file or from flags. Every
/// field optional; [`resolve`] merges and validates.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// Pre-shared key, 64 hex characters.
    pub key: Option<String>,

    /// File containing the key as hex text (overrides `key` when both set).
    pub key_file: Option<PathBuf>,

    /// Tunnel base domain, e.g. `t.example.com`.
    pub domain: Option<String>,

    /// Plaintext bytes per chunk.
    pub chunk_size: Option<usize>,

    /// Server listen/target address, `ip:port`.
    pub server: Option<String>,

    /// Per-query timeout in seconds.
    pub timeout_secs: Option<u64>,

    /// Retransmission cap per chunk.
    pub max_retries: Option<u32>,
}

impl RawConfig {
    /// Load raw settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::File(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), Box::new(e)))
    }

    /// Overlay `self` on top of `base`, field by field.
    pub fn over(self, base: RawConfig) -> RawConfig {
        RawConfig {
            key: self.key.or(base.key),
            key_file: self.key_file.or(base.key_file),
            domain: self.domain.or(base.domain),
            chunk_size: self.chunk_size.or(base.chunk_size),
            server: self.server.or(base.server),
            timeout_secs: self.timeout_secs.or(base.timeout_secs),
            max_retries: self.max_retries.or(base.max_retries),
        }
    }
}

/// Validated settings shared by sender and receiver.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub key: [u8; 32],
    pub domain: String,
    pub chunk_size: usize,
    pub server: SocketAddr,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Merge raw settings into a validated config. All CONFIG_ERR detection
/// lives here.
pub fn resolve(raw: RawConfig) -> Result<TunnelConfig, ConfigError> {
    let key = resolve_key(&raw)?;

    let domain = raw.domain.ok_or(ConfigError::MissingDomain)?;
    let domain = domain.trim_end_matches('.').to_string();
    if domain.is_empty() || !domain.is_ascii() || domain.len() > MAX_DOMAIN_LEN {
        return Err(ConfigError::BadDomain(domain));
    }

    let chunk_size = raw.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
    if chunk_size == 0 {
        return Err(ConfigError::ChunkTooSmall);
    }
    let max = codec::max_chunk_size(&domain);
    if chunk_size > max {
        return Err(ConfigError::ChunkTooLarge {
            got: chunk_size,
            max,
        });
    }

    let server = raw.server.unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let server: SocketAddr = server
        .parse()
        .map_err(|e| ConfigError::BadServer(server.clone(), e))?;

    Ok(TunnelConfig {
        key,
        domain,
        chunk_size,
        server,
        timeout: Duration::from_secs(raw.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        max_retries: raw.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
    })
}

fn resolve_key(raw: &RawConfig) -> Result<[u8; 32], ConfigError> {
    let hex_text = match (&raw.key_file, &raw.key) {
        (Some(path), _) => std::fs::read_to_string(path)
            .map_err(|e| ConfigError::KeyFile(path.clone(), e))?,
        (None, Some(text)) => text.clone(),
        (None, None) => return Err(ConfigError::MissingKey),
    };
    let bytes = hex::decode(hex_text.trim()).map_err(|_| ConfigError::BadKeyHex)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| ConfigError::BadKeyLength(len))
}

impl TunnelConfig {
    /// Largest message the acknowledgment encoding can confirm under the
    /// configured chunk size.
    pub fn max_message_len(&self) -> usize {
        codec::MAX_SEQ as usize * self.chunk_size
    }

    /// Reject messages whose chunk count cannot be acknowledged.
    pub fn check_message(&self, len: usize) -> Result<(), ConfigError> {
        if len > self.max_message_len() {
            return Err(ConfigError::MessageTooLarge {
                got: len,
                max: self.max_message_len(),
            });
        }
        Ok(())
    }
}
