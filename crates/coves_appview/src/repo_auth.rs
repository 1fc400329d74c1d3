/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::appview_db::AppViewDb;
use crate::dpop::DpopKey;
use crate::error::{AppError, AppResult};
use crate::oauth_store::OAuthStore;
use crate::pds_client::{PdsAuth, PdsClient};

/// Write access to a user's own repository, backed by their OAuth session.
/// Call [`UserRepo::persist_nonce`] after the last PDS call so a rotated
/// DPoP nonce survives for the next request.
pub struct UserRepo {
    pub client: PdsClient,
    pub auth: PdsAuth,
    store: OAuthStore,
    did: String,
    session_id: String,
}

impl UserRepo {
    pub fn open(
        store: &OAuthStore,
        http: &reqwest::Client,
        did: &str,
        session_id: &str,
    ) -> AppResult<Self> {
        let session = store
            .get_session(did, session_id)?
            .ok_or_else(|| AppError::unauthorized("session not found"))?;
        let key = DpopKey::from_hex(&session.dpop_key_hex)?;
        let nonce = if session.dpop_pds_nonce.is_empty() {
            None
        } else {
            Some(session.dpop_pds_nonce.clone())
        };
        Ok(Self {
            client: PdsClient::new(http.clone(), &session.pds_url),
            auth: PdsAuth::Dpop {
                access_token: session.access_token,
                key,
                nonce,
            },
            store: store.clone(),
            did: did.to_string(),
            session_id: session_id.to_string(),
        })
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn persist_nonce(&self) -> AppResult<()> {
        if let PdsAuth::Dpop {
            nonce: Some(nonce), ..
        } = &self.auth
        {
            self.store
                .update_pds_nonce(&self.did, &self.session_id, nonce)?;
        }
        Ok(())
    }
}

/// Write access to a community's repository using the PDS account this
/// instance provisioned for it. Only communities hosted here have
/// credentials; anything else is `Forbidden`.
pub struct CommunityRepo {
    pub client: PdsClient,
    pub auth: PdsAuth,
    pub did: String,
}

impl CommunityRepo {
    pub async fn open(
        db: &AppViewDb,
        http: &reqwest::Client,
        community_did: &str,
    ) -> AppResult<Self> {
        let creds = db.get_community_credentials(community_did)?.ok_or_else(|| {
            AppError::forbidden(format!(
                "community {community_did} is not hosted on this instance"
            ))
        })?;
        let client = PdsClient::new(http.clone(), &creds.pds_url);
        let session = client.create_session(&creds.email, &creds.password).await?;
        Ok(Self {
            client,
            auth: PdsAuth::Bearer(session.access_jwt),
            did: session.did,
        })
    }
}
