/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use tracing::debug;

use crate::appview_db::AppViewDb;
use crate::error::{AppError, AppResult};
use coves_protocol::{
    parse_record_uri, record_uri, CommitEvent, JetstreamEvent, VoteRecord, COLLECTION_COMMENT,
    COLLECTION_POST,
};

/// Indexes `social.coves.feed.vote` events. The vote record lives in the
/// voter's repository; the event repo DID is the voter.
#[derive(Clone)]
pub struct VoteConsumer {
    db: AppViewDb,
}

impl VoteConsumer {
    pub fn new(db: AppViewDb) -> Self {
        Self { db }
    }

    pub fn handle(&self, event: &JetstreamEvent, commit: &CommitEvent) -> AppResult<()> {
        let uri = record_uri(&event.did, &commit.collection, &commit.rkey);

        if commit.is_delete() {
            if self.db.retract_vote(&uri)? {
                debug!("retracted vote {uri}");
            }
            return Ok(());
        }

        let record = commit
            .record
            .as_ref()
            .ok_or_else(|| AppError::validation("commit has no record payload"))?;
        let vote: VoteRecord = serde_json::from_value(record.clone())?;

        if vote.direction != "up" && vote.direction != "down" {
            return Err(AppError::validation(format!(
                "vote direction must be up or down, got {}",
                vote.direction
            )));
        }
        let (_, subject_collection, _) = parse_record_uri(&vote.subject.uri).ok_or_else(|| {
            AppError::validation(format!("malformed vote subject {}", vote.subject.uri))
        })?;
        if subject_collection != COLLECTION_POST && subject_collection != COLLECTION_COMMENT {
            return Err(AppError::validation(format!(
                "votes apply to posts and comments, not {subject_collection}"
            )));
        }

        let cid = commit
            .cid
            .clone()
            .ok_or_else(|| AppError::validation("commit has no cid"))?;
        self.db.apply_vote(
            &uri,
            &cid,
            &event.did,
            &vote.subject.uri,
            &vote.direction,
            &vote.created_at,
        )?;
        debug!("applied vote {uri} ({})", vote.direction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appview_db::{CommunityRow, PostRow};
    use rand::RngCore;
    use serde_json::json;

    const POST_URI: &str = "at://did:plc:comm/social.coves.community.post/3kzpost";

    fn consumer(tag: &str) -> VoteConsumer {
        let mut nonce = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let path = std::env::temp_dir().join(format!(
            "coves_vote_consumer_{tag}_{}.db",
            hex::encode(nonce)
        ));
        let consumer = VoteConsumer::new(AppViewDb::open(path).unwrap());
        consumer
            .db
            .upsert_community_profile(&CommunityRow {
                did: "did:plc:comm".to_string(),
                handle: "c-gaming.coves.social".to_string(),
                name: "gaming".to_string(),
                display_name: String::new(),
                description: String::new(),
                creator_did: "did:plc:creator".to_string(),
                hosted_by: "did:web:coves.social".to_string(),
                visibility: "public".to_string(),
                moderation_type: "standard".to_string(),
                allow_external_discovery: true,
                subscriber_count: 0,
                post_count: 0,
                deleted: false,
                created_at: "t".to_string(),
            })
            .unwrap();
        consumer
            .db
            .index_post(&PostRow {
                uri: POST_URI.to_string(),
                cid: "bafypost".to_string(),
                community_did: "did:plc:comm".to_string(),
                author_did: "did:plc:author".to_string(),
                title: Some("hello".to_string()),
                content: None,
                upvote_count: 0,
                downvote_count: 0,
                score: 0,
                comment_count: 0,
                deleted: false,
                created_at: "t".to_string(),
            })
            .unwrap();
        consumer
    }

    fn vote_event(
        voter: &str,
        rkey: &str,
        operation: &str,
        direction: &str,
    ) -> (JetstreamEvent, CommitEvent) {
        let commit = CommitEvent {
            rev: "3kz".to_string(),
            operation: operation.to_string(),
            collection: "social.coves.feed.vote".to_string(),
            rkey: rkey.to_string(),
            cid: Some(format!("bafy{rkey}")),
            record: Some(json!({
                "$type": "social.coves.feed.vote",
                "subject": {"uri": POST_URI, "cid": "bafypost"},
                "direction": direction,
                "createdAt": "2026-01-04T00:00:00Z"
            })),
        };
        let event = JetstreamEvent {
            did: voter.to_string(),
            time_us: 1,
            kind: "commit".to_string(),
            commit: Some(commit.clone()),
            identity: None,
            account: None,
        };
        (event, commit)
    }

    #[test]
    fn upvote_then_direction_change() {
        let consumer = consumer("change");
        let (event, commit) = vote_event("did:plc:v", "3kzv1", "create", "up");
        consumer.handle(&event, &commit).unwrap();
        let post = consumer.db.get_post(POST_URI).unwrap().unwrap();
        assert_eq!((post.upvote_count, post.downvote_count, post.score), (1, 0, 1));

        let (event, commit) = vote_event("did:plc:v", "3kzv2", "create", "down");
        consumer.handle(&event, &commit).unwrap();
        let post = consumer.db.get_post(POST_URI).unwrap().unwrap();
        assert_eq!((post.upvote_count, post.downvote_count, post.score), (0, 1, -1));
    }

    #[test]
    fn replay_and_retraction_are_idempotent() {
        let consumer = consumer("idem");
        let (event, commit) = vote_event("did:plc:v", "3kzv1", "create", "up");
        consumer.handle(&event, &commit).unwrap();
        consumer.handle(&event, &commit).unwrap();
        let post = consumer.db.get_post(POST_URI).unwrap().unwrap();
        assert_eq!(post.upvote_count, 1);

        let (event, commit) = vote_event("did:plc:v", "3kzv1", "delete", "up");
        consumer.handle(&event, &commit).unwrap();
        consumer.handle(&event, &commit).unwrap();
        let post = consumer.db.get_post(POST_URI).unwrap().unwrap();
        assert_eq!((post.upvote_count, post.score), (0, 0));
    }

    #[test]
    fn rejects_invalid_direction_and_subject() {
        let consumer = consumer("invalid");
        let (event, mut commit) = vote_event("did:plc:v", "3kzv1", "create", "sideways");
        assert!(matches!(
            consumer.handle(&event, &commit).unwrap_err(),
            AppError::Validation(_)
        ));

        commit.record = Some(json!({
            "subject": {"uri": "at://did:plc:x/app.bsky.feed.post/1", "cid": "x"},
            "direction": "up",
            "createdAt": "t"
        }));
        assert!(matches!(
            consumer.handle(&event, &commit).unwrap_err(),
            AppError::Validation(_)
        ));
    }

    #[test]
    fn vote_without_cid_is_rejected() {
        let consumer = consumer("no_cid");
        let (event, mut commit) = vote_event("did:plc:v", "3kzv1", "create", "up");
        commit.cid = None;
        assert!(matches!(
            consumer.handle(&event, &commit).unwrap_err(),
            AppError::Validation(_)
        ));
        let post = consumer.db.get_post(POST_URI).unwrap().unwrap();
        assert_eq!(post.upvote_count, 0);
    }

    #[test]
    fn vote_on_unknown_subject_is_not_found() {
        let consumer = consumer("orphan");
        let (event, mut commit) = vote_event("did:plc:v", "3kzv1", "create", "up");
        commit.record = Some(json!({
            "subject": {"uri": "at://did:plc:comm/social.coves.community.post/missing", "cid": "x"},
            "direction": "up",
            "createdAt": "t"
        }));
        assert!(consumer.handle(&event, &commit).unwrap_err().is_not_found());
    }
}
