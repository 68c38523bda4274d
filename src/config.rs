//! Context configuration.
//!
//! [`ContextConfig`] is the plain data handed to the engine at start;
//! the fluent way to assemble one is
//! [`ContextBuilder`](crate::ContextBuilder). Both structs derive serde so
//! embedders can load them from configuration files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Engine-interpreted context option bits.
///
/// Engines ignore bits they do not implement.
pub mod options {
    /// Allow rebinding the listen address (SO_REUSEADDR).
    pub const REUSE_ADDR: u32 = 0b0001;
    /// Disable Nagle on accepted connections (TCP_NODELAY).
    pub const TCP_NODELAY: u32 = 0b0010;

    /// Check if a specific option bit is set.
    #[inline]
    pub fn has(options: u32, option: u32) -> bool {
        options & option != 0
    }
}

/// TLS material locations for engines that terminate TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the PEM certificate chain.
    pub cert_path: PathBuf,
    /// Path to the PEM private key.
    pub key_path: PathBuf,
}

/// Configuration handed to the engine at context construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Listen port; 0 picks an ephemeral port (or none at all for
    /// client-only engines).
    pub port: u16,
    /// Bind interface; `None` binds all interfaces.
    pub interface: Option<String>,
    /// TLS material; `None` serves plaintext.
    pub tls: Option<TlsConfig>,
    /// Group id to drop to after binding (unix engines only).
    pub gid: Option<u32>,
    /// User id to drop to after binding (unix engines only).
    pub uid: Option<u32>,
    /// Option bits (see [`options`]).
    pub options: u32,
    /// Extension names to request from the engine; engines ignore ones they
    /// do not support.
    pub extensions: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            port: 0,
            interface: None,
            tls: None,
            gid: None,
            uid: None,
            options: 0,
            extensions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.port, 0);
        assert!(config.interface.is_none());
        assert!(config.tls.is_none());
        assert_eq!(config.options, 0);
        assert!(config.extensions.is_empty());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ContextConfig =
            serde_json::from_str(r#"{"port": 8080, "interface": "127.0.0.1"}"#).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.interface.as_deref(), Some("127.0.0.1"));
        assert!(config.tls.is_none());
        assert_eq!(config.options, 0);
    }

    #[test]
    fn test_json_roundtrip_with_tls() {
        let config = ContextConfig {
            port: 443,
            tls: Some(TlsConfig {
                cert_path: PathBuf::from("/etc/ssl/server.pem"),
                key_path: PathBuf::from("/etc/ssl/server.key"),
            }),
            options: options::REUSE_ADDR | options::TCP_NODELAY,
            ..ContextConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ContextConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_options_has() {
        let opts = options::REUSE_ADDR | options::TCP_NODELAY;
        assert!(options::has(opts, options::REUSE_ADDR));
        assert!(options::has(opts, options::TCP_NODELAY));
        assert!(!options::has(options::REUSE_ADDR, options::TCP_NODELAY));
    }
}
