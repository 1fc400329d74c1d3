/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// What happens when a consumer rejects a firehose event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerFailurePolicy {
    /// Drop the connection without advancing the cursor; the event replays
    /// on reconnect. Default.
    #[default]
    FailFast,
    /// Record the event in the dead-letter table and advance past it.
    DeadLetter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bind: String,
    pub database_path: String,
    /// Base URL of the PDS this instance provisions community accounts on.
    pub pds_url: String,
    pub jetstream_url: String,
    /// Instance domain; community handles are minted under
    /// `communities.<instance_domain>`.
    pub instance_domain: String,
    pub instance_did: String,
    /// Hex-encoded 32-byte AES key for sealed session tokens.
    pub seal_key: String,
    #[serde(default)]
    pub admin_email_domain: Option<String>,
    #[serde(default)]
    pub consumer_failure_policy: ConsumerFailurePolicy,
    #[serde(default = "default_true")]
    pub verify_hosted_by: bool,
    #[serde(default = "default_identity_cache_ttl_secs")]
    pub identity_cache_ttl_secs: i64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_identity_cache_ttl_secs() -> i64 {
    3600
}

fn default_session_ttl_secs() -> i64 {
    24 * 3600
}

fn default_cleanup_interval_secs() -> u64 {
    600
}

impl AppConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: AppConfig = serde_json::from_str(text).context("parse config json")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &PathBuf) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.bind.trim().is_empty() {
            anyhow::bail!("bind is required");
        }
        if self.database_path.trim().is_empty() {
            anyhow::bail!("database_path is required");
        }
        if !self.pds_url.starts_with("http://") && !self.pds_url.starts_with("https://") {
            anyhow::bail!("pds_url must be an http(s) URL");
        }
        if !self.jetstream_url.starts_with("ws://") && !self.jetstream_url.starts_with("wss://") {
            anyhow::bail!("jetstream_url must be a ws(s) URL");
        }
        if self.instance_domain.trim().is_empty() {
            anyhow::bail!("instance_domain is required");
        }
        if !self.instance_did.starts_with("did:") {
            anyhow::bail!("instance_did must be a DID");
        }
        if self.seal_key.trim().len() != 64 {
            anyhow::bail!("seal_key must be 32 bytes hex encoded");
        }
        Ok(())
    }
}

/// Resolves the config path from `--config <path>` or `COVES_CONFIG`.
pub fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("COVES_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Err(anyhow::anyhow!(
        "no config given: pass --config <path> or set COVES_CONFIG"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> String {
        format!(
            r#"{{
                "bind": "127.0.0.1:8080",
                "database_path": "/tmp/coves.db",
                "pds_url": "https://pds.example",
                "jetstream_url": "wss://jetstream.example/subscribe",
                "instance_domain": "coves.social",
                "instance_did": "did:web:coves.social",
                "seal_key": "{}"
            }}"#,
            "ab".repeat(32)
        )
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = AppConfig::from_json(&minimal()).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8080");
        assert_eq!(cfg.consumer_failure_policy, ConsumerFailurePolicy::FailFast);
        assert!(cfg.verify_hosted_by);
        assert_eq!(cfg.identity_cache_ttl_secs, 3600);
        assert_eq!(cfg.session_ttl_secs, 24 * 3600);
    }

    #[test]
    fn parses_dead_letter_policy() {
        let text = minimal().replacen(
            "\"bind\"",
            "\"consumer_failure_policy\": \"dead_letter\", \"bind\"",
            1,
        );
        let cfg = AppConfig::from_json(&text).unwrap();
        assert_eq!(cfg.consumer_failure_policy, ConsumerFailurePolicy::DeadLetter);
    }

    #[test]
    fn rejects_bad_urls_and_keys() {
        let bad_pds = minimal().replace("https://pds.example", "ftp://pds.example");
        assert!(AppConfig::from_json(&bad_pds).is_err());

        let bad_js = minimal().replace("wss://jetstream.example/subscribe", "https://x");
        assert!(AppConfig::from_json(&bad_js).is_err());

        let bad_key = minimal().replace(&"ab".repeat(32), "abcd");
        assert!(AppConfig::from_json(&bad_key).is_err());

        let bad_did = minimal().replace("did:web:coves.social", "coves.social");
        assert!(AppConfig::from_json(&bad_did).is_err());
    }
}
