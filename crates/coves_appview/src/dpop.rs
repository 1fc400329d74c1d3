/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};
use p256::ecdsa::{signature::Signer, Signature, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

/// P-256 keypair backing the DPoP proofs of one OAuth session. The secret
/// scalar is persisted hex-encoded alongside the session row so proofs
/// stay bound to the same key across restarts.
#[derive(Clone)]
pub struct DpopKey {
    signing: SigningKey,
}

impl DpopKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn from_hex(hex_key: &str) -> AppResult<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| AppError::internal(format!("dpop key is not hex: {e}")))?;
        let signing = SigningKey::from_slice(&bytes)
            .map_err(|e| AppError::internal(format!("dpop key invalid: {e}")))?;
        Ok(Self { signing })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing.verifying_key()
    }

    /// Public key as a JWK, embedded in every proof header.
    pub fn public_jwk(&self) -> serde_json::Value {
        let point = self.signing.verifying_key().to_encoded_point(false);
        // Uncompressed SEC1 point: 0x04 || x (32 bytes) || y (32 bytes).
        let x = point.x().map(|b| B64URL.encode(b)).unwrap_or_default();
        let y = point.y().map(|b| B64URL.encode(b)).unwrap_or_default();
        json!({"kty": "EC", "crv": "P-256", "x": x, "y": y})
    }

    /// RFC 7638 thumbprint of the public JWK, used as the `jkt` binding.
    pub fn thumbprint(&self) -> String {
        let jwk = self.public_jwk();
        let canonical = format!(
            r#"{{"crv":"P-256","kty":"EC","x":{},"y":{}}}"#,
            jwk["x"], jwk["y"]
        );
        B64URL.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Assembles and signs one DPoP proof JWT for a request. `nonce` is the
    /// server-issued replay nonce when we have one; `access_token` adds the
    /// `ath` hash claim for resource-server requests.
    pub fn proof(
        &self,
        htm: &str,
        htu: &str,
        nonce: Option<&str>,
        access_token: Option<&str>,
    ) -> AppResult<String> {
        let header = json!({
            "typ": "dpop+jwt",
            "alg": "ES256",
            "jwk": self.public_jwk(),
        });

        let mut jti = [0u8; 16];
        OsRng.fill_bytes(&mut jti);
        let mut claims = json!({
            "jti": hex::encode(jti),
            "htm": htm,
            "htu": htu,
            "iat": now_secs(),
        });
        if let Some(nonce) = nonce {
            claims["nonce"] = json!(nonce);
        }
        if let Some(token) = access_token {
            claims["ath"] = json!(B64URL.encode(Sha256::digest(token.as_bytes())));
        }

        let header_b64 = B64URL.encode(
            serde_json::to_vec(&header)
                .map_err(|e| AppError::internal(format!("dpop header: {e}")))?,
        );
        let claims_b64 = B64URL.encode(
            serde_json::to_vec(&claims)
                .map_err(|e| AppError::internal(format!("dpop claims: {e}")))?,
        );
        let signing_input = format!("{header_b64}.{claims_b64}");

        // ES256 JWS signature is the raw r || s pair, not DER.
        let signature: Signature = self.signing.sign(signing_input.as_bytes());
        let sig_b64 = B64URL.encode(signature.to_bytes());
        Ok(format!("{signing_input}.{sig_b64}"))
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
