/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::oauth_store::OAuthStore;
use crate::repo_auth::UserRepo;
use coves_protocol::COLLECTION_ACTOR_PROFILE;

const MAX_DISPLAY_NAME_LEN: usize = 64;
const MAX_DESCRIPTION_LEN: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// Raw avatar bytes, passed through to uploadBlob untouched.
    pub avatar: Option<(Vec<u8>, String)>,
}

/// Updates the caller's `app.bsky.actor.profile` record in their own
/// repository, merging over whatever is already there.
#[derive(Clone)]
pub struct ProfileService {
    store: OAuthStore,
    http: reqwest::Client,
}

impl ProfileService {
    pub fn new(store: OAuthStore, http: reqwest::Client) -> Self {
        Self { store, http }
    }

    pub async fn update(
        &self,
        caller_did: &str,
        session_id: &str,
        update: &ProfileUpdate,
    ) -> AppResult<(String, String)> {
        if update.display_name.is_none() && update.description.is_none() && update.avatar.is_none()
        {
            return Err(AppError::validation("nothing to update"));
        }
        if update
            .display_name
            .as_deref()
            .is_some_and(|v| v.len() > MAX_DISPLAY_NAME_LEN)
        {
            return Err(AppError::validation(format!(
                "display name exceeds {MAX_DISPLAY_NAME_LEN} characters"
            )));
        }
        if update
            .description
            .as_deref()
            .is_some_and(|v| v.len() > MAX_DESCRIPTION_LEN)
        {
            return Err(AppError::validation(format!(
                "description exceeds {MAX_DESCRIPTION_LEN} characters"
            )));
        }

        let mut repo = UserRepo::open(&self.store, &self.http, caller_did, session_id)?;

        // The profile may not exist yet; start from an empty record then.
        let current = match repo
            .client
            .get_record(caller_did, COLLECTION_ACTOR_PROFILE, "self")
            .await
        {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let (mut record, swap_cid) = match &current {
            Some(fetched) => (fetched.value.clone(), fetched.cid.clone()),
            None => (json!({"$type": COLLECTION_ACTOR_PROFILE}), None),
        };

        if let Some(v) = &update.display_name {
            record["displayName"] = json!(v);
        }
        if let Some(v) = &update.description {
            record["description"] = json!(v);
        }
        if let Some((bytes, mime_type)) = &update.avatar {
            let blob = repo
                .client
                .upload_blob(&mut repo.auth, bytes.clone(), mime_type)
                .await?;
            record["avatar"] = blob;
        }

        let written = repo
            .client
            .put_record(
                &mut repo.auth,
                caller_did,
                COLLECTION_ACTOR_PROFILE,
                "self",
                &record,
                swap_cid.as_deref(),
            )
            .await?;
        repo.persist_nonce()?;
        Ok((written.uri, written.cid))
    }
}
