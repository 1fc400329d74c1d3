/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde_json::json;

use crate::appview_db::AppViewDb;
use crate::community_service::now_rfc3339;
use crate::error::{AppError, AppResult};
use crate::oauth_store::OAuthStore;
use crate::repo_auth::UserRepo;
use crate::tid::next_tid;
use coves_protocol::{parse_record_uri, COLLECTION_COMMENT, COLLECTION_POST, COLLECTION_VOTE};

/// Votes live in the voter's repository. Changing direction is a delete of
/// the old record plus a create of the new one; the consumer folds that
/// into a single counter transaction when the events arrive.
#[derive(Clone)]
pub struct VoteService {
    db: AppViewDb,
    store: OAuthStore,
    http: reqwest::Client,
}

impl VoteService {
    pub fn new(db: AppViewDb, store: OAuthStore, http: reqwest::Client) -> Self {
        Self { db, store, http }
    }

    pub async fn vote(
        &self,
        caller_did: &str,
        session_id: &str,
        subject_uri: &str,
        direction: &str,
    ) -> AppResult<String> {
        if direction != "up" && direction != "down" {
            return Err(AppError::validation(format!(
                "vote direction must be up or down, got {direction}"
            )));
        }
        let subject_cid = self.subject_cid(subject_uri)?;

        if let Some(existing) = self.db.get_active_vote(caller_did, subject_uri)? {
            if existing.direction == direction {
                return Ok(existing.uri);
            }
            // Direction change: retract the old record first.
            self.delete_vote_record(caller_did, session_id, &existing.uri)
                .await?;
        }

        let record = json!({
            "$type": COLLECTION_VOTE,
            "subject": {"uri": subject_uri, "cid": subject_cid},
            "direction": direction,
            "createdAt": now_rfc3339()?,
        });

        let mut repo = UserRepo::open(&self.store, &self.http, caller_did, session_id)?;
        let rkey = next_tid();
        let written = repo
            .client
            .create_record(&mut repo.auth, caller_did, COLLECTION_VOTE, Some(&rkey), &record)
            .await?;
        repo.persist_nonce()?;
        Ok(written.uri)
    }

    pub async fn unvote(
        &self,
        caller_did: &str,
        session_id: &str,
        subject_uri: &str,
    ) -> AppResult<()> {
        let existing = self
            .db
            .get_active_vote(caller_did, subject_uri)?
            .ok_or_else(|| AppError::not_found("no active vote on this subject"))?;
        self.delete_vote_record(caller_did, session_id, &existing.uri)
            .await
    }

    fn subject_cid(&self, subject_uri: &str) -> AppResult<String> {
        let (_, collection, _) = parse_record_uri(subject_uri)
            .ok_or_else(|| AppError::validation(format!("malformed subject uri {subject_uri}")))?;
        match collection.as_str() {
            COLLECTION_POST => {
                let post = self
                    .db
                    .get_post(subject_uri)?
                    .filter(|p| !p.deleted)
                    .ok_or_else(|| AppError::not_found(format!("post {subject_uri}")))?;
                Ok(post.cid)
            }
            COLLECTION_COMMENT => {
                let comment = self
                    .db
                    .get_comment(subject_uri)?
                    .filter(|c| !c.deleted)
                    .ok_or_else(|| AppError::not_found(format!("comment {subject_uri}")))?;
                Ok(comment.cid)
            }
            other => Err(AppError::validation(format!(
                "votes apply to posts and comments, not {other}"
            ))),
        }
    }

    async fn delete_vote_record(
        &self,
        caller_did: &str,
        session_id: &str,
        vote_uri: &str,
    ) -> AppResult<()> {
        let (repo_did, collection, rkey) = parse_record_uri(vote_uri)
            .ok_or_else(|| AppError::internal("stored vote uri is malformed"))?;
        if repo_did != caller_did {
            return Err(AppError::forbidden("vote belongs to another repository"));
        }
        let mut repo = UserRepo::open(&self.store, &self.http, caller_did, session_id)?;
        repo.client
            .delete_record(&mut repo.auth, &repo_did, &collection, &rkey, None)
            .await?;
        repo.persist_nonce()?;
        Ok(())
    }
}
