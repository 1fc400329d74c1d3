/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

use crate::appview_db::AppViewDb;
use crate::error::{AppError, AppResult};
use crate::oauth_store::OAuthStore;
use crate::provisioner::{CommunityProvisioner, ProvisionRequest, ProvisionedCommunity};
use crate::repo_auth::{CommunityRepo, UserRepo};
use crate::tid::next_tid;
use coves_protocol::{
    parse_record_uri, COLLECTION_COMMUNITY_BLOCK, COLLECTION_COMMUNITY_PROFILE,
    COLLECTION_SUBSCRIPTION,
};

pub const MIN_CONTENT_VISIBILITY: i64 = 0;
pub const MAX_CONTENT_VISIBILITY: i64 = 5;
pub const DEFAULT_CONTENT_VISIBILITY: i64 = 3;

#[derive(Debug, Clone, Default)]
pub struct CommunityUpdate {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub visibility: Option<String>,
    pub moderation_type: Option<String>,
    pub allow_external_discovery: Option<bool>,
}

/// Community lifecycle and membership commands. Writes go to the PDS; the
/// AppView rows only change when the matching firehose event comes back
/// around.
#[derive(Clone)]
pub struct CommunityService {
    db: AppViewDb,
    store: OAuthStore,
    http: reqwest::Client,
    provisioner: CommunityProvisioner,
}

impl CommunityService {
    pub fn new(
        db: AppViewDb,
        store: OAuthStore,
        http: reqwest::Client,
        provisioner: CommunityProvisioner,
    ) -> Self {
        Self {
            db,
            store,
            http,
            provisioner,
        }
    }

    pub async fn create(
        &self,
        caller_did: &str,
        req: &ProvisionRequest,
    ) -> AppResult<ProvisionedCommunity> {
        if caller_did != req.creator_did {
            return Err(AppError::forbidden(
                "communities can only be created on the caller's behalf",
            ));
        }
        self.provisioner.provision(req).await
    }

    /// Updates the community profile with a CID swap: a concurrent write on
    /// the PDS between our read and our put comes back as `Conflict`.
    pub async fn update(
        &self,
        caller_did: &str,
        community_did: &str,
        update: &CommunityUpdate,
    ) -> AppResult<(String, String)> {
        let community = self
            .db
            .get_community(community_did)?
            .ok_or_else(|| AppError::not_found(format!("community {community_did}")))?;
        if community.creator_did != caller_did {
            return Err(AppError::forbidden(
                "only the community creator can update the profile",
            ));
        }

        let mut repo = CommunityRepo::open(&self.db, &self.http, community_did).await?;
        let current = repo
            .client
            .get_record(community_did, COLLECTION_COMMUNITY_PROFILE, "self")
            .await?;

        let mut record = current.value.clone();
        if let Some(v) = &update.display_name {
            record["displayName"] = json!(v);
        }
        if let Some(v) = &update.description {
            record["description"] = json!(v);
        }
        if let Some(v) = &update.visibility {
            record["visibility"] = json!(v);
        }
        if let Some(v) = &update.moderation_type {
            record["moderationType"] = json!(v);
        }
        if let Some(v) = update.allow_external_discovery {
            record["federation"] = json!({"allowExternalDiscovery": v});
        }

        let written = repo
            .client
            .put_record(
                &mut repo.auth,
                community_did,
                COLLECTION_COMMUNITY_PROFILE,
                "self",
                &record,
                current.cid.as_deref(),
            )
            .await?;
        info!("updated community profile {}", written.uri);
        Ok((written.uri, written.cid))
    }

    /// Subscribes the caller to a community. Idempotent at the service
    /// level: an existing active subscription returns its record URI
    /// without another PDS write.
    pub async fn subscribe(
        &self,
        caller_did: &str,
        session_id: &str,
        community_did: &str,
        content_visibility: Option<i64>,
    ) -> AppResult<String> {
        let community = self
            .db
            .get_community(community_did)?
            .ok_or_else(|| AppError::not_found(format!("community {community_did}")))?;
        if community.deleted {
            return Err(AppError::not_found(format!("community {community_did}")));
        }
        if let Some(existing) = self.db.get_subscription(caller_did, community_did)? {
            return Ok(existing.record_uri);
        }

        let visibility = content_visibility
            .unwrap_or(DEFAULT_CONTENT_VISIBILITY)
            .clamp(MIN_CONTENT_VISIBILITY, MAX_CONTENT_VISIBILITY);
        let record = json!({
            "$type": COLLECTION_SUBSCRIPTION,
            "subject": community_did,
            "contentVisibility": visibility,
            "createdAt": now_rfc3339()?,
        });

        let mut repo = UserRepo::open(&self.store, &self.http, caller_did, session_id)?;
        let rkey = next_tid();
        let written = repo
            .client
            .create_record(
                &mut repo.auth,
                caller_did,
                COLLECTION_SUBSCRIPTION,
                Some(&rkey),
                &record,
            )
            .await?;
        repo.persist_nonce()?;
        Ok(written.uri)
    }

    /// Deletes the caller's subscription record from their repository.
    pub async fn unsubscribe(
        &self,
        caller_did: &str,
        session_id: &str,
        community_did: &str,
    ) -> AppResult<()> {
        let subscription = self
            .db
            .get_subscription(caller_did, community_did)?
            .ok_or_else(|| AppError::not_found("no active subscription"))?;
        let (repo_did, collection, rkey) = parse_record_uri(&subscription.record_uri)
            .ok_or_else(|| AppError::internal("stored subscription uri is malformed"))?;
        if repo_did != caller_did {
            return Err(AppError::forbidden("subscription belongs to another repo"));
        }

        let mut repo = UserRepo::open(&self.store, &self.http, caller_did, session_id)?;
        repo.client
            .delete_record(&mut repo.auth, &repo_did, &collection, &rkey, None)
            .await?;
        repo.persist_nonce()?;
        Ok(())
    }

    pub async fn block(
        &self,
        caller_did: &str,
        session_id: &str,
        community_did: &str,
    ) -> AppResult<String> {
        if self.db.get_community(community_did)?.is_none() {
            return Err(AppError::not_found(format!("community {community_did}")));
        }
        if let Some(existing) = self.db.get_block(caller_did, community_did)? {
            return Ok(existing.record_uri);
        }

        let record = json!({
            "$type": COLLECTION_COMMUNITY_BLOCK,
            "subject": community_did,
            "createdAt": now_rfc3339()?,
        });
        let mut repo = UserRepo::open(&self.store, &self.http, caller_did, session_id)?;
        let rkey = next_tid();
        let written = repo
            .client
            .create_record(
                &mut repo.auth,
                caller_did,
                COLLECTION_COMMUNITY_BLOCK,
                Some(&rkey),
                &record,
            )
            .await?;
        repo.persist_nonce()?;
        Ok(written.uri)
    }

    pub async fn unblock(
        &self,
        caller_did: &str,
        session_id: &str,
        community_did: &str,
    ) -> AppResult<()> {
        let block = self
            .db
            .get_block(caller_did, community_did)?
            .ok_or_else(|| AppError::not_found("no active block"))?;
        let (repo_did, collection, rkey) = parse_record_uri(&block.record_uri)
            .ok_or_else(|| AppError::internal("stored block uri is malformed"))?;
        if repo_did != caller_did {
            return Err(AppError::forbidden("block belongs to another repo"));
        }

        let mut repo = UserRepo::open(&self.store, &self.http, caller_did, session_id)?;
        repo.client
            .delete_record(&mut repo.auth, &repo_did, &collection, &rkey, None)
            .await?;
        repo.persist_nonce()?;
        Ok(())
    }
}

pub(crate) fn now_rfc3339() -> AppResult<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| AppError::internal(format!("format timestamp: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_visibility_clamps_into_range() {
        assert_eq!(
            (-3i64).clamp(MIN_CONTENT_VISIBILITY, MAX_CONTENT_VISIBILITY),
            0
        );
        assert_eq!(9i64.clamp(MIN_CONTENT_VISIBILITY, MAX_CONTENT_VISIBILITY), 5);
        assert_eq!(3i64.clamp(MIN_CONTENT_VISIBILITY, MAX_CONTENT_VISIBILITY), 3);
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let ts = now_rfc3339().unwrap();
        assert!(OffsetDateTime::parse(&ts, &Rfc3339).is_ok());
    }
}
