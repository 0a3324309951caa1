//! Server Configuration
//!
//! Parsed from the command line with clap. `Config::default()` gives the
//! same values as running the binary without arguments.

use crate::protocol::decoder::{DEFAULT_MAX_ARRAY_LEN, DEFAULT_MAX_BULK_LEN};
use crate::protocol::DecoderConfig;
use clap::Parser;

/// JollyKV server
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "jollykv")]
#[command(about = "In-memory key-value server speaking RESP")]
#[command(version)]
pub struct Config {
    /// Host to bind to
    #[arg(long, default_value = crate::DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = crate::DEFAULT_PORT)]
    pub port: u16,

    /// Decoded frames that may wait for the coordinator across all clients
    #[arg(long, default_value_t = 1024)]
    pub inbound_capacity: usize,

    /// Replies that may wait for one client's writer before it counts as slow
    #[arg(long, default_value_t = 256)]
    pub reply_capacity: usize,

    /// Largest accepted bulk string, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_BULK_LEN)]
    pub max_bulk_len: usize,

    /// Largest accepted array, in elements
    #[arg(long, default_value_t = DEFAULT_MAX_ARRAY_LEN)]
    pub max_array_len: usize,

    /// Maximum number of keys in the store (0 means unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_keys: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            inbound_capacity: 1024,
            reply_capacity: 256,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
            max_keys: 0,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Decoder limits for each connection.
    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            max_bulk_len: self.max_bulk_len,
            max_array_len: self.max_array_len,
            ..DecoderConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_cli() {
        let parsed = Config::try_parse_from(["jollykv"]).unwrap();
        assert_eq!(parsed, Config::default());
        assert_eq!(parsed.bind_address(), "127.0.0.1:5001");
    }

    #[test]
    fn test_flags() {
        let parsed = Config::try_parse_from([
            "jollykv",
            "--host",
            "0.0.0.0",
            "-p",
            "7000",
            "--max-keys",
            "10",
            "--max-bulk-len",
            "1024",
            "--reply-capacity",
            "4",
        ])
        .unwrap();

        assert_eq!(parsed.bind_address(), "0.0.0.0:7000");
        assert_eq!(parsed.max_keys, 10);
        assert_eq!(parsed.reply_capacity, 4);

        let decoder = parsed.decoder_config();
        assert_eq!(decoder.max_bulk_len, 1024);
        assert_eq!(decoder.max_array_len, DEFAULT_MAX_ARRAY_LEN);
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        assert!(Config::try_parse_from(["jollykv", "--port", "not-a-port"]).is_err());
    }
}
