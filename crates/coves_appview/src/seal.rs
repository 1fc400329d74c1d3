/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use aes_gcm::{aead::Aead, aead::KeyInit, Aes256Gcm, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

const NONCE_LEN: usize = 12;

/// Claims sealed into a client-visible session token. No secrets: the
/// access and refresh tokens stay server-side, keyed by (did, sid).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedSession {
    pub did: String,
    pub sid: String,
    pub exp: i64,
}

/// AEAD sealer for session tokens. Token layout is
/// base64url(nonce || ciphertext || tag) over the JSON claims, so any bit
/// flip fails authentication before the claims are even parsed.
#[derive(Clone)]
pub struct SessionSealer {
    key: [u8; 32],
}

impl SessionSealer {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Builds a sealer from a hex-encoded 32-byte key (config format).
    pub fn from_hex(hex_key: &str) -> AppResult<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| AppError::validation(format!("seal key is not hex: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AppError::validation("seal key must be 32 bytes"))?;
        Ok(Self::new(key))
    }

    pub fn seal(&self, did: &str, session_id: &str, ttl_secs: i64) -> AppResult<String> {
        if did.is_empty() {
            return Err(AppError::validation("did is required"));
        }
        if session_id.is_empty() {
            return Err(AppError::validation("session id is required"));
        }

        let claims = SealedSession {
            did: did.to_string(),
            sid: session_id.to_string(),
            exp: now_secs() + ttl_secs,
        };
        let plaintext = serde_json::to_vec(&claims)
            .map_err(|e| AppError::internal(format!("seal encode: {e}")))?;

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| AppError::internal(format!("seal cipher: {e}")))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| AppError::internal(format!("seal encrypt: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(B64URL.encode(out))
    }

    /// Decrypts and validates a sealed token. Every failure mode collapses
    /// to `Unauthorized` so the token is not an oracle.
    pub fn unseal(&self, token: &str) -> AppResult<SealedSession> {
        if token.is_empty() {
            return Err(AppError::unauthorized("missing session token"));
        }
        let raw = B64URL
            .decode(token.as_bytes())
            .map_err(|_| AppError::unauthorized("invalid session token"))?;
        if raw.len() <= NONCE_LEN {
            return Err(AppError::unauthorized("invalid session token"));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| AppError::internal(format!("seal cipher: {e}")))?;
        let nonce = Nonce::from_slice(&raw[..NONCE_LEN]);
        let plaintext = cipher
            .decrypt(nonce, &raw[NONCE_LEN..])
            .map_err(|_| AppError::unauthorized("invalid session token"))?;

        let claims: SealedSession = serde_json::from_slice(&plaintext)
            .map_err(|_| AppError::unauthorized("invalid session token"))?;
        if claims.did.is_empty() || claims.sid.is_empty() {
            return Err(AppError::unauthorized("invalid session token"));
        }
        if claims.exp <= now_secs() {
            return Err(AppError::unauthorized("session token expired"));
        }
        Ok(claims)
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sealer() -> SessionSealer {
        SessionSealer::new([7u8; 32])
    }

    #[test]
    fn seal_unseal_round_trips() {
        let token = sealer().seal("did:plc:alice", "sess-1", 3600).unwrap();
        let claims = sealer().unseal(&token).unwrap();
        assert_eq!(claims.did, "did:plc:alice");
        assert_eq!(claims.sid, "sess-1");
        assert!(claims.exp > now_secs());
    }

    #[test]
    fn any_bit_flip_is_rejected() {
        let token = sealer().seal("did:plc:alice", "sess-1", 3600).unwrap();
        let mut raw = B64URL.decode(token.as_bytes()).unwrap();
        for i in 0..raw.len() {
            raw[i] ^= 0x01;
            let tampered = B64URL.encode(&raw);
            let err = sealer().unseal(&tampered).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unauthorized, "byte {i} accepted");
            raw[i] ^= 0x01;
        }
    }

    #[test]
    fn expired_token_is_unauthorized() {
        let token = sealer().seal("did:plc:alice", "sess-1", -1).unwrap();
        let err = sealer().unseal(&token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn wrong_key_is_unauthorized() {
        let token = sealer().seal("did:plc:alice", "sess-1", 3600).unwrap();
        let other = SessionSealer::new([9u8; 32]);
        assert_eq!(
            other.unseal(&token).unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
    }

    #[test]
    fn empty_token_is_unauthorized() {
        assert_eq!(
            sealer().unseal("").unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
    }

    #[test]
    fn from_hex_validates_length() {
        assert!(SessionSealer::from_hex(&"ab".repeat(32)).is_ok());
        assert!(SessionSealer::from_hex("abcd").is_err());
        assert!(SessionSealer::from_hex("not hex").is_err());
    }
}
