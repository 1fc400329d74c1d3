/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use tracing::debug;

use crate::appview_db::{AppViewDb, PostRow};
use crate::error::{AppError, AppResult};
use coves_protocol::{record_uri, CommitEvent, JetstreamEvent, PostRecord};

/// Indexes `social.coves.community.post` events. Posts are only valid
/// coming from the community's own repository; a post record claiming a
/// different community is a forgery and gets rejected.
#[derive(Clone)]
pub struct PostConsumer {
    db: AppViewDb,
}

impl PostConsumer {
    pub fn new(db: AppViewDb) -> Self {
        Self { db }
    }

    pub fn handle(&self, event: &JetstreamEvent, commit: &CommitEvent) -> AppResult<()> {
        let uri = record_uri(&event.did, &commit.collection, &commit.rkey);

        if commit.is_delete() {
            if self.db.soft_delete_post(&uri)? {
                debug!("soft deleted post {uri}");
            }
            return Ok(());
        }

        let record = commit
            .record
            .as_ref()
            .ok_or_else(|| AppError::validation("commit has no record payload"))?;
        let post: PostRecord = serde_json::from_value(record.clone())?;

        if post.community != event.did {
            return Err(AppError::validation(format!(
                "repository DID ({}) does not match community DID ({})",
                event.did, post.community
            )));
        }
        if !post.author.starts_with("did:") {
            return Err(AppError::validation("post author must be a DID"));
        }
        if post.title.as_deref().map(str::trim).unwrap_or("").is_empty()
            && post.content.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(AppError::validation("post has neither title nor content"));
        }
        if self.db.get_community(&post.community)?.is_none() {
            return Err(AppError::not_found(format!(
                "community {} is not indexed",
                post.community
            )));
        }

        let cid = commit
            .cid
            .clone()
            .ok_or_else(|| AppError::validation("commit has no cid"))?;

        if commit.is_update() {
            if self
                .db
                .update_post(&uri, &cid, post.title.as_deref(), post.content.as_deref())?
            {
                return Ok(());
            }
            // Update for a post we never saw: fall through and index it.
        }

        let row = PostRow {
            uri: uri.clone(),
            cid,
            community_did: post.community,
            author_did: post.author,
            title: post.title,
            content: post.content,
            upvote_count: 0,
            downvote_count: 0,
            score: 0,
            comment_count: 0,
            deleted: false,
            created_at: post.created_at,
        };
        self.db.index_post(&row)?;
        debug!("indexed post {uri}");
        Ok(())
    }
}
