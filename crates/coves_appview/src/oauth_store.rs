/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rusqlite::{params, OptionalExtension};

use crate::appview_db::{now_ms, AppViewDb};
use crate::error::AppResult;

/// One OAuth session: the server-side half of a sealed token. A user may
/// hold several concurrent sessions (one per device), keyed by
/// (did, session_id).
#[derive(Debug, Clone)]
pub struct OAuthSession {
    pub did: String,
    pub session_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub dpop_key_hex: String,
    pub dpop_auth_nonce: String,
    pub dpop_pds_nonce: String,
    pub auth_server_url: String,
    pub token_endpoint: String,
    pub pds_url: String,
    pub handle: String,
    pub expires_at_ms: i64,
}

/// In-flight authorization request, keyed by the unique `state` value.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub state: String,
    pub did: Option<String>,
    pub handle: Option<String>,
    pub pkce_verifier: String,
    pub dpop_key_hex: String,
    pub auth_server_url: String,
    pub token_endpoint: String,
    pub pds_url: String,
}

const AUTH_REQUEST_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Clone)]
pub struct OAuthStore {
    db: AppViewDb,
}

impl OAuthStore {
    pub fn new(db: AppViewDb) -> Self {
        Self { db }
    }

    /// Inserts or rotates a session. The (did, session_id) pair is the
    /// session's identity and survives token rotation.
    pub fn upsert_session(&self, session: &OAuthSession) -> AppResult<()> {
        let conn = self.db.conn()?;
        conn.execute(
            r#"
            INSERT INTO oauth_sessions(
              did, session_id, access_token, refresh_token, dpop_key_hex,
              dpop_auth_nonce, dpop_pds_nonce, auth_server_url, token_endpoint,
              pds_url, handle, expires_at_ms, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            ON CONFLICT(did, session_id) DO UPDATE SET
              access_token=excluded.access_token,
              refresh_token=excluded.refresh_token,
              dpop_key_hex=excluded.dpop_key_hex,
              dpop_auth_nonce=excluded.dpop_auth_nonce,
              dpop_pds_nonce=excluded.dpop_pds_nonce,
              auth_server_url=excluded.auth_server_url,
              token_endpoint=excluded.token_endpoint,
              pds_url=excluded.pds_url,
              handle=excluded.handle,
              expires_at_ms=excluded.expires_at_ms,
              updated_at_ms=excluded.updated_at_ms
            "#,
            params![
                session.did,
                session.session_id,
                session.access_token,
                session.refresh_token,
                session.dpop_key_hex,
                session.dpop_auth_nonce,
                session.dpop_pds_nonce,
                session.auth_server_url,
                session.token_endpoint,
                session.pds_url,
                session.handle,
                session.expires_at_ms,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    /// Fetches an unexpired session. Expired rows are invisible here and
    /// only reaped by cleanup.
    pub fn get_session(&self, did: &str, session_id: &str) -> AppResult<Option<OAuthSession>> {
        let conn = self.db.conn()?;
        conn.query_row(
            r#"
            SELECT did, session_id, access_token, refresh_token, dpop_key_hex,
                   dpop_auth_nonce, dpop_pds_nonce, auth_server_url, token_endpoint,
                   pds_url, handle, expires_at_ms
            FROM oauth_sessions
            WHERE did=?1 AND session_id=?2 AND expires_at_ms > ?3
            "#,
            params![did, session_id, now_ms()],
            |r| {
                Ok(OAuthSession {
                    did: r.get(0)?,
                    session_id: r.get(1)?,
                    access_token: r.get(2)?,
                    refresh_token: r.get(3)?,
                    dpop_key_hex: r.get(4)?,
                    dpop_auth_nonce: r.get(5)?,
                    dpop_pds_nonce: r.get(6)?,
                    auth_server_url: r.get(7)?,
                    token_endpoint: r.get(8)?,
                    pds_url: r.get(9)?,
                    handle: r.get(10)?,
                    expires_at_ms: r.get(11)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn update_pds_nonce(&self, did: &str, session_id: &str, nonce: &str) -> AppResult<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE oauth_sessions SET dpop_pds_nonce=?3, updated_at_ms=?4 WHERE did=?1 AND session_id=?2",
            params![did, session_id, nonce, now_ms()],
        )?;
        Ok(())
    }

    pub fn update_auth_nonce(&self, did: &str, session_id: &str, nonce: &str) -> AppResult<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE oauth_sessions SET dpop_auth_nonce=?3, updated_at_ms=?4 WHERE did=?1 AND session_id=?2",
            params![did, session_id, nonce, now_ms()],
        )?;
        Ok(())
    }

    pub fn delete_session(&self, did: &str, session_id: &str) -> AppResult<bool> {
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM oauth_sessions WHERE did=?1 AND session_id=?2",
            params![did, session_id],
        )?;
        Ok(removed > 0)
    }

    pub fn cleanup_expired_sessions(&self) -> AppResult<usize> {
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM oauth_sessions WHERE expires_at_ms <= ?1",
            params![now_ms()],
        )?;
        Ok(removed)
    }

    /// Stores an in-flight authorization request. A duplicate `state` is a
    /// `Conflict`: states are single use.
    pub fn create_auth_request(&self, request: &AuthRequest) -> AppResult<()> {
        let conn = self.db.conn()?;
        let now = now_ms();
        conn.execute(
            r#"
            INSERT INTO oauth_requests(
              state, did, handle, pkce_verifier, dpop_key_hex,
              auth_server_url, token_endpoint, pds_url, created_at_ms, expires_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                request.state,
                request.did,
                request.handle,
                request.pkce_verifier,
                request.dpop_key_hex,
                request.auth_server_url,
                request.token_endpoint,
                request.pds_url,
                now,
                now + AUTH_REQUEST_TTL_MS,
            ],
        )?;
        Ok(())
    }

    /// Consumes an authorization request by state: returns it and removes
    /// the row, so a replayed callback fails.
    pub fn take_auth_request(&self, state: &str) -> AppResult<Option<AuthRequest>> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let request: Option<AuthRequest> = tx
            .query_row(
                r#"
                SELECT state, did, handle, pkce_verifier, dpop_key_hex,
                       auth_server_url, token_endpoint, pds_url
                FROM oauth_requests WHERE state=?1 AND expires_at_ms > ?2
                "#,
                params![state, now_ms()],
                |r| {
                    Ok(AuthRequest {
                        state: r.get(0)?,
                        did: r.get(1)?,
                        handle: r.get(2)?,
                        pkce_verifier: r.get(3)?,
                        dpop_key_hex: r.get(4)?,
                        auth_server_url: r.get(5)?,
                        token_endpoint: r.get(6)?,
                        pds_url: r.get(7)?,
                    })
                },
            )
            .optional()?;
        tx.execute("DELETE FROM oauth_requests WHERE state=?1", params![state])?;
        tx.commit()?;
        Ok(request)
    }

    pub fn cleanup_expired_requests(&self) -> AppResult<usize> {
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM oauth_requests WHERE expires_at_ms <= ?1",
            params![now_ms()],
        )?;
        Ok(removed)
    }
}

impl OAuthSession {
    pub fn is_expired(&self) -> bool {
        self.expires_at_ms <= now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn store(tag: &str) -> OAuthStore {
        let mut nonce = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let path = std::env::temp_dir().join(format!(
            "coves_oauth_{tag}_{}.db",
            hex::encode(nonce)
        ));
        OAuthStore::new(AppViewDb::open(path).unwrap())
    }

    fn session(did: &str, sid: &str, expires_at_ms: i64) -> OAuthSession {
        OAuthSession {
            did: did.to_string(),
            session_id: sid.to_string(),
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            dpop_key_hex: "00".repeat(32),
            dpop_auth_nonce: String::new(),
            dpop_pds_nonce: String::new(),
            auth_server_url: "https://auth.example".to_string(),
            token_endpoint: "https://auth.example/token".to_string(),
            pds_url: "https://pds.example".to_string(),
            handle: "alice.test".to_string(),
            expires_at_ms,
        }
    }

    #[test]
    fn rotation_preserves_session_identity() {
        let store = store("rotate");
        let far = now_ms() + 60_000;
        store.upsert_session(&session("did:plc:a", "sid-1", far)).unwrap();

        let mut rotated = session("did:plc:a", "sid-1", far + 60_000);
        rotated.access_token = "access-2".to_string();
        rotated.refresh_token = "refresh-2".to_string();
        store.upsert_session(&rotated).unwrap();

        let loaded = store.get_session("did:plc:a", "sid-1").unwrap().unwrap();
        assert_eq!(loaded.access_token, "access-2");
        assert_eq!(loaded.refresh_token, "refresh-2");
    }

    #[test]
    fn expired_sessions_are_invisible() {
        let store = store("expired");
        store
            .upsert_session(&session("did:plc:a", "sid-1", now_ms() - 1))
            .unwrap();
        assert!(store.get_session("did:plc:a", "sid-1").unwrap().is_none());
        assert_eq!(store.cleanup_expired_sessions().unwrap(), 1);
    }

    #[test]
    fn sessions_are_scoped_to_did_and_sid() {
        let store = store("scope");
        let far = now_ms() + 60_000;
        store.upsert_session(&session("did:plc:a", "sid-1", far)).unwrap();
        store.upsert_session(&session("did:plc:a", "sid-2", far)).unwrap();
        assert!(store.get_session("did:plc:a", "sid-2").unwrap().is_some());
        assert!(store.get_session("did:plc:b", "sid-1").unwrap().is_none());
        assert!(store.delete_session("did:plc:a", "sid-1").unwrap());
        assert!(store.get_session("did:plc:a", "sid-1").unwrap().is_none());
        assert!(store.get_session("did:plc:a", "sid-2").unwrap().is_some());
    }

    #[test]
    fn duplicate_state_is_conflict() {
        let store = store("state");
        let request = AuthRequest {
            state: "state-1".to_string(),
            did: Some("did:plc:a".to_string()),
            handle: Some("alice.test".to_string()),
            pkce_verifier: "verifier".to_string(),
            dpop_key_hex: "00".repeat(32),
            auth_server_url: "https://auth.example".to_string(),
            token_endpoint: "https://auth.example/token".to_string(),
            pds_url: "https://pds.example".to_string(),
        };
        store.create_auth_request(&request).unwrap();
        assert!(store.create_auth_request(&request).unwrap_err().is_conflict());
    }

    #[test]
    fn auth_requests_are_single_use() {
        let store = store("single_use");
        let request = AuthRequest {
            state: "state-2".to_string(),
            did: None,
            handle: None,
            pkce_verifier: "verifier".to_string(),
            dpop_key_hex: "00".repeat(32),
            auth_server_url: "https://auth.example".to_string(),
            token_endpoint: "https://auth.example/token".to_string(),
            pds_url: "https://pds.example".to_string(),
        };
        store.create_auth_request(&request).unwrap();
        let taken = store.take_auth_request("state-2").unwrap().unwrap();
        assert_eq!(taken.pkce_verifier, "verifier");
        assert!(store.take_auth_request("state-2").unwrap().is_none());
    }
}
