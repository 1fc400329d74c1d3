/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde_json::Value;
use tracing::debug;

use crate::appview_db::AppViewDb;
use crate::error::{AppError, AppResult};
use crate::pds_client::send_retry_once;

const PLC_DIRECTORY: &str = "https://plc.directory";

/// Resolves handles to DIDs and DIDs to their PDS endpoints, with a
/// persistent TTL cache in front of the network.
#[derive(Clone)]
pub struct IdentityResolver {
    db: AppViewDb,
    http: reqwest::Client,
    /// XRPC base used for com.atproto.identity.resolveHandle.
    xrpc_base: String,
    cache_ttl_secs: i64,
}

impl IdentityResolver {
    pub fn new(db: AppViewDb, http: reqwest::Client, xrpc_base: String, cache_ttl_secs: i64) -> Self {
        Self {
            db,
            http,
            xrpc_base: xrpc_base.trim_end_matches('/').to_string(),
            cache_ttl_secs,
        }
    }

    pub async fn resolve_handle(&self, handle: &str) -> AppResult<String> {
        let handle = handle.trim().trim_start_matches('@').to_ascii_lowercase();
        if handle.is_empty() {
            return Err(AppError::validation("handle is required"));
        }
        let cache_key = format!("handle:{handle}");
        if let Some(did) = self.db.identity_cache_get(&cache_key)? {
            return Ok(did);
        }

        let url = format!(
            "{}/xrpc/com.atproto.identity.resolveHandle?handle={}",
            self.xrpc_base,
            urlencoding::encode(&handle)
        );
        let resp = send_retry_once(|| Ok(self.http.get(&url))).await?;
        if resp.status() == reqwest::StatusCode::BAD_REQUEST
            || resp.status() == reqwest::StatusCode::NOT_FOUND
        {
            return Err(AppError::not_found(format!("handle {handle} not found")));
        }
        if !resp.status().is_success() {
            return Err(AppError::unavailable(format!(
                "resolveHandle returned {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await?;
        let did = body
            .get("did")
            .and_then(|v| v.as_str())
            .filter(|d| d.starts_with("did:"))
            .ok_or_else(|| AppError::unavailable("resolveHandle returned no did"))?
            .to_string();

        self.db
            .identity_cache_put(&cache_key, &did, self.cache_ttl_secs)?;
        debug!("resolved handle {handle} -> {did}");
        Ok(did)
    }

    /// Resolves the PDS service endpoint for a DID from its DID document.
    pub async fn resolve_did_pds(&self, did: &str) -> AppResult<String> {
        let did = did.trim();
        let cache_key = format!("pds:{did}");
        if let Some(url) = self.db.identity_cache_get(&cache_key)? {
            return Ok(url);
        }

        let doc_url = did_document_url(did)?;
        let resp = send_retry_once(|| Ok(self.http.get(&doc_url))).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::not_found(format!("did {did} not found")));
        }
        if !resp.status().is_success() {
            return Err(AppError::unavailable(format!(
                "did document fetch returned {}",
                resp.status()
            )));
        }
        let doc: Value = resp.json().await?;
        let endpoint = pds_endpoint(&doc).ok_or_else(|| {
            AppError::not_found(format!("did {did} has no atproto_pds service"))
        })?;

        self.db
            .identity_cache_put(&cache_key, &endpoint, self.cache_ttl_secs)?;
        debug!("resolved pds for {did}: {endpoint}");
        Ok(endpoint)
    }
}

/// URL of the DID document for plc and web DIDs.
pub fn did_document_url(did: &str) -> AppResult<String> {
    if did.starts_with("did:plc:") {
        return Ok(format!("{PLC_DIRECTORY}/{did}"));
    }
    if let Some(domain) = did.strip_prefix("did:web:") {
        if domain.is_empty() || domain.contains('/') {
            return Err(AppError::validation(format!("invalid did:web DID {did}")));
        }
        return Ok(format!("https://{domain}/.well-known/did.json"));
    }
    Err(AppError::validation(format!("unsupported DID method: {did}")))
}

/// Picks the `#atproto_pds` service endpoint out of a DID document.
pub fn pds_endpoint(doc: &Value) -> Option<String> {
    let services = doc.get("service")?.as_array()?;
    for service in services {
        let id = service.get("id").and_then(|v| v.as_str()).unwrap_or("");
        let kind = service.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if id.ends_with("#atproto_pds") || kind == "AtprotoPersonalDataServer" {
            if let Some(endpoint) = service.get("serviceEndpoint").and_then(|v| v.as_str()) {
                return Some(endpoint.trim_end_matches('/').to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_document_urls_per_method() {
        assert_eq!(
            did_document_url("did:plc:abc123").unwrap(),
            "https://plc.directory/did:plc:abc123"
        );
        assert_eq!(
            did_document_url("did:web:pds.example").unwrap(),
            "https://pds.example/.well-known/did.json"
        );
        assert!(did_document_url("did:key:z6Mk").is_err());
        assert!(did_document_url("did:web:").is_err());
        assert!(did_document_url("did:web:a/b").is_err());
    }

    #[test]
    fn extracts_pds_service_endpoint() {
        let doc = json!({
            "id": "did:plc:abc123",
            "service": [
                {"id": "#other", "type": "SomethingElse", "serviceEndpoint": "https://no"},
                {"id": "#atproto_pds", "type": "AtprotoPersonalDataServer",
                 "serviceEndpoint": "https://pds.example/"}
            ]
        });
        assert_eq!(pds_endpoint(&doc).as_deref(), Some("https://pds.example"));
    }

    #[test]
    fn matches_on_type_when_id_differs() {
        let doc = json!({
            "service": [
                {"id": "did:plc:x#pds", "type": "AtprotoPersonalDataServer",
                 "serviceEndpoint": "https://pds.example"}
            ]
        });
        assert_eq!(pds_endpoint(&doc).as_deref(), Some("https://pds.example"));
        assert!(pds_endpoint(&json!({"service": []})).is_none());
        assert!(pds_endpoint(&json!({})).is_none());
    }
}
