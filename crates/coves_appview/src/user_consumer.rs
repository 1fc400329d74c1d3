/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use tracing::{debug, info};

use crate::appview_db::{AppViewDb, BlockRow, SubscriptionRow};
use crate::error::{AppError, AppResult};
use coves_protocol::{
    blob_cid, record_uri, ActorProfileRecord, BlockRecord, CommitEvent, JetstreamEvent,
    SubscriptionRecord, COLLECTION_ACTOR_PROFILE, COLLECTION_COMMUNITY_BLOCK,
    COLLECTION_SUBSCRIPTION,
};

const MIN_CONTENT_VISIBILITY: i64 = 0;
const MAX_CONTENT_VISIBILITY: i64 = 5;
const DEFAULT_CONTENT_VISIBILITY: i64 = 3;

/// Indexes everything written to a user's own repository: subscriptions,
/// community blocks and actor profile snapshots, plus identity and account
/// events from the firehose.
#[derive(Clone)]
pub struct UserConsumer {
    db: AppViewDb,
}

impl UserConsumer {
    pub fn new(db: AppViewDb) -> Self {
        Self { db }
    }

    pub fn handle_commit(&self, event: &JetstreamEvent, commit: &CommitEvent) -> AppResult<()> {
        match commit.collection.as_str() {
            COLLECTION_SUBSCRIPTION => self.handle_subscription(event, commit),
            COLLECTION_COMMUNITY_BLOCK => self.handle_block(event, commit),
            COLLECTION_ACTOR_PROFILE => self.handle_actor_profile(event, commit),
            other => Err(AppError::validation(format!(
                "unexpected collection {other} for user consumer"
            ))),
        }
    }

    /// Handle changes propagate to the user row and any active sessions.
    pub fn handle_identity(&self, event: &JetstreamEvent) -> AppResult<()> {
        let identity = event
            .identity
            .as_ref()
            .ok_or_else(|| AppError::validation("identity event has no payload"))?;
        if let Some(handle) = &identity.handle {
            self.db.update_user_handle(&event.did, handle)?;
            info!("handle change for {}: {handle}", event.did);
        }
        Ok(())
    }

    pub fn handle_account(&self, event: &JetstreamEvent) -> AppResult<()> {
        let account = event
            .account
            .as_ref()
            .ok_or_else(|| AppError::validation("account event has no payload"))?;
        self.db.upsert_user(&event.did, None)?;
        self.db.set_user_active(&event.did, account.active)?;
        debug!("account {} active={}", event.did, account.active);
        Ok(())
    }

    fn handle_subscription(&self, event: &JetstreamEvent, commit: &CommitEvent) -> AppResult<()> {
        let uri = record_uri(&event.did, &commit.collection, &commit.rkey);

        if commit.is_delete() {
            if self.db.remove_subscription(&uri)? {
                debug!("removed subscription {uri}");
            }
            return Ok(());
        }

        let record = commit
            .record
            .as_ref()
            .ok_or_else(|| AppError::validation("commit has no record payload"))?;
        let subscription: SubscriptionRecord = serde_json::from_value(record.clone())?;
        if !subscription.subject.starts_with("did:") {
            return Err(AppError::validation(
                "subscription subject must be a community DID",
            ));
        }
        if self.db.get_community(&subscription.subject)?.is_none() {
            return Err(AppError::not_found(format!(
                "community {} is not indexed",
                subscription.subject
            )));
        }

        let visibility = subscription
            .content_visibility
            .unwrap_or(DEFAULT_CONTENT_VISIBILITY)
            .clamp(MIN_CONTENT_VISIBILITY, MAX_CONTENT_VISIBILITY);

        self.db.upsert_user(&event.did, None)?;
        let inserted = self.db.index_subscription(&SubscriptionRow {
            record_uri: uri.clone(),
            user_did: event.did.clone(),
            community_did: subscription.subject,
            content_visibility: visibility,
            created_at: subscription.created_at,
        })?;
        if inserted {
            debug!("indexed subscription {uri}");
        }
        Ok(())
    }

    fn handle_block(&self, event: &JetstreamEvent, commit: &CommitEvent) -> AppResult<()> {
        let uri = record_uri(&event.did, &commit.collection, &commit.rkey);

        if commit.is_delete() {
            if self.db.remove_block(&uri)? {
                debug!("removed community block {uri}");
            }
            return Ok(());
        }

        let record = commit
            .record
            .as_ref()
            .ok_or_else(|| AppError::validation("commit has no record payload"))?;
        let block: BlockRecord = serde_json::from_value(record.clone())?;
        if !block.subject.starts_with("did:") {
            return Err(AppError::validation(
                "block subject must be a community DID",
            ));
        }

        self.db.upsert_user(&event.did, None)?;
        self.db.index_block(&BlockRow {
            record_uri: uri,
            user_did: event.did.clone(),
            community_did: block.subject,
            created_at: block.created_at,
        })?;
        Ok(())
    }

    fn handle_actor_profile(&self, event: &JetstreamEvent, commit: &CommitEvent) -> AppResult<()> {
        if commit.is_delete() {
            self.db.update_user_profile(&event.did, None, None, None)?;
            return Ok(());
        }
        let record = commit
            .record
            .as_ref()
            .ok_or_else(|| AppError::validation("commit has no record payload"))?;
        let profile: ActorProfileRecord = serde_json::from_value(record.clone())?;
        let avatar = record.get("avatar").and_then(blob_cid);
        self.db.update_user_profile(
            &event.did,
            profile.display_name.as_deref(),
            profile.description.as_deref(),
            avatar.as_deref(),
        )?;
        debug!("indexed actor profile for {}", event.did);
        Ok(())
    }
}
