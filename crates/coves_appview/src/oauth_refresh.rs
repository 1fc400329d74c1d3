/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::appview_db::now_ms;
use crate::dpop::DpopKey;
use crate::error::{AppError, AppResult};
use crate::oauth_store::{OAuthSession, OAuthStore};
use crate::seal::SessionSealer;

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RefreshedSession {
    pub sealed_token: String,
    pub did: String,
    pub handle: String,
    pub expires_at_ms: i64,
}

/// Rotates OAuth sessions: validates the caller's sealed token against the
/// stored session, then runs a DPoP-bound refresh grant against the
/// session's authorization server.
#[derive(Clone)]
pub struct OAuthRefresher {
    store: OAuthStore,
    sealer: SessionSealer,
    http: reqwest::Client,
    client_id: String,
    session_ttl_secs: i64,
}

impl OAuthRefresher {
    pub fn new(
        store: OAuthStore,
        sealer: SessionSealer,
        http: reqwest::Client,
        client_id: String,
        session_ttl_secs: i64,
    ) -> Self {
        Self {
            store,
            sealer,
            http,
            client_id,
            session_ttl_secs,
        }
    }

    /// Checks run in order: token present, token unseals, DID matches,
    /// session id matches, session row exists and is unexpired. Every
    /// failure collapses to `Unauthorized` so callers learn nothing about
    /// which check tripped.
    pub async fn refresh(
        &self,
        sealed_token: Option<&str>,
        did: &str,
        session_id: &str,
    ) -> AppResult<RefreshedSession> {
        let token = sealed_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::unauthorized("missing session token"))?;
        let claims = self.sealer.unseal(token)?;
        if claims.did != did {
            return Err(AppError::unauthorized("session mismatch"));
        }
        if claims.sid != session_id {
            return Err(AppError::unauthorized("session mismatch"));
        }
        let session = self
            .store
            .get_session(did, session_id)?
            .ok_or_else(|| AppError::unauthorized("session not found"))?;

        let rotated = self.run_refresh_grant(&session).await?;

        // The session lives until the access token does, capped by our own
        // ceiling; the client comes back here before either runs out.
        let ttl_secs = effective_ttl(self.session_ttl_secs, rotated.expires_in);
        let expires_at_ms = now_ms() + ttl_secs * 1000;
        let updated = OAuthSession {
            access_token: rotated.access_token,
            refresh_token: rotated.refresh_token,
            expires_at_ms,
            ..session
        };
        self.store.upsert_session(&updated)?;

        let sealed = self
            .sealer
            .seal(&updated.did, &updated.session_id, ttl_secs)?;
        debug!("refreshed oauth session for {}", updated.did);
        Ok(RefreshedSession {
            sealed_token: sealed,
            did: updated.did,
            handle: updated.handle,
            expires_at_ms,
        })
    }

    /// refresh_token grant with a DPoP proof bound to the session key. One
    /// replay when the server demands a fresh nonce; the new nonce is
    /// persisted either way.
    async fn run_refresh_grant(&self, session: &OAuthSession) -> AppResult<TokenResponse> {
        let key = DpopKey::from_hex(&session.dpop_key_hex)?;
        let nonce = if session.dpop_auth_nonce.is_empty() {
            None
        } else {
            Some(session.dpop_auth_nonce.clone())
        };

        let resp = self
            .send_grant(session, &key, nonce.as_deref())
            .await?;
        if resp.status().is_success() {
            return Ok(resp.json().await?);
        }

        let server_nonce = resp
            .headers()
            .get("dpop-nonce")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if let Some(server_nonce) = server_nonce {
            self.store
                .update_auth_nonce(&session.did, &session.session_id, &server_nonce)?;
            if body.contains("use_dpop_nonce") {
                let retry = self.send_grant(session, &key, Some(&server_nonce)).await?;
                if retry.status().is_success() {
                    return Ok(retry.json().await?);
                }
                let retry_status = retry.status();
                let retry_body = retry.text().await.unwrap_or_default();
                return Err(grant_error(retry_status, &retry_body));
            }
        }
        Err(grant_error(status, &body))
    }

    async fn send_grant(
        &self,
        session: &OAuthSession,
        key: &DpopKey,
        nonce: Option<&str>,
    ) -> AppResult<reqwest::Response> {
        let proof = key.proof("POST", &session.token_endpoint, nonce, None)?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", session.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        self.http
            .post(&session.token_endpoint)
            .header("dpop", proof)
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::unavailable(format!("token endpoint: {e}")))
    }
}

fn grant_error(status: StatusCode, body: &str) -> AppError {
    if status.is_client_error() {
        warn!("refresh grant rejected: {status}");
        return AppError::unauthorized("refresh rejected");
    }
    AppError::unavailable(format!("token endpoint returned {status}: {body}"))
}

/// Session TTL after a rotation: the configured ceiling, shortened to the
/// auth server's `expires_in` when it answers with one.
fn effective_ttl(configured_secs: i64, expires_in: Option<i64>) -> i64 {
    match expires_in {
        Some(secs) if secs > 0 => secs.min(configured_secs),
        _ => configured_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appview_db::AppViewDb;
    use crate::error::ErrorKind;
    use rand::RngCore;

    fn refresher(tag: &str) -> (OAuthRefresher, OAuthStore, SessionSealer) {
        let mut nonce = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let path = std::env::temp_dir().join(format!(
            "coves_refresh_{tag}_{}.db",
            hex::encode(nonce)
        ));
        let store = OAuthStore::new(AppViewDb::open(path).unwrap());
        let sealer = SessionSealer::new([3u8; 32]);
        let refresher = OAuthRefresher::new(
            store.clone(),
            sealer.clone(),
            reqwest::Client::new(),
            "https://coves.social/oauth/client-metadata.json".to_string(),
            3600,
        );
        (refresher, store, sealer)
    }

    fn seed_session(store: &OAuthStore, did: &str, sid: &str, expires_at_ms: i64) {
        store
            .upsert_session(&OAuthSession {
                did: did.to_string(),
                session_id: sid.to_string(),
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                dpop_key_hex: DpopKey::generate().to_hex(),
                dpop_auth_nonce: String::new(),
                dpop_pds_nonce: String::new(),
                auth_server_url: "https://auth.example".to_string(),
                token_endpoint: "https://auth.example/token".to_string(),
                pds_url: "https://pds.example".to_string(),
                handle: "alice.test".to_string(),
                expires_at_ms,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let (refresher, _, _) = refresher("missing");
        let err = refresher.refresh(None, "did:plc:a", "sid-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        let err = refresher
            .refresh(Some(""), "did:plc:a", "sid-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn garbage_token_is_unauthorized() {
        let (refresher, _, _) = refresher("garbage");
        let err = refresher
            .refresh(Some("not-a-token"), "did:plc:a", "sid-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn did_mismatch_is_unauthorized() {
        let (refresher, store, sealer) = refresher("did_mismatch");
        seed_session(&store, "did:plc:a", "sid-1", now_ms() + 60_000);
        let token = sealer.seal("did:plc:a", "sid-1", 3600).unwrap();
        let err = refresher
            .refresh(Some(&token), "did:plc:other", "sid-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn session_id_mismatch_is_unauthorized() {
        let (refresher, store, sealer) = refresher("sid_mismatch");
        seed_session(&store, "did:plc:a", "sid-1", now_ms() + 60_000);
        let token = sealer.seal("did:plc:a", "sid-1", 3600).unwrap();
        let err = refresher
            .refresh(Some(&token), "did:plc:a", "sid-other")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn unknown_session_is_unauthorized() {
        let (refresher, _, sealer) = refresher("no_session");
        let token = sealer.seal("did:plc:a", "sid-1", 3600).unwrap();
        let err = refresher
            .refresh(Some(&token), "did:plc:a", "sid-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn expired_session_is_unauthorized() {
        let (refresher, store, sealer) = refresher("expired_session");
        seed_session(&store, "did:plc:a", "sid-1", now_ms() - 1);
        let token = sealer.seal("did:plc:a", "sid-1", 3600).unwrap();
        let err = refresher
            .refresh(Some(&token), "did:plc:a", "sid-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn server_expiry_shortens_but_never_extends_the_ttl() {
        assert_eq!(effective_ttl(3600, Some(600)), 600);
        assert_eq!(effective_ttl(3600, Some(86_400)), 3600);
        assert_eq!(effective_ttl(3600, Some(0)), 3600);
        assert_eq!(effective_ttl(3600, Some(-5)), 3600);
        assert_eq!(effective_ttl(3600, None), 3600);
    }
}
