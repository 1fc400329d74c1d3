/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use tracing::debug;

use crate::appview_db::{AppViewDb, CommentRow};
use crate::error::{AppError, AppResult};
use coves_protocol::{
    parse_record_uri, record_uri, CommentRecord, CommitEvent, JetstreamEvent, COLLECTION_COMMENT,
    COLLECTION_POST,
};

/// Indexes `social.coves.community.comment` events. Comments live in the
/// commenter's repository, so the event repo DID is the commenter.
#[derive(Clone)]
pub struct CommentConsumer {
    db: AppViewDb,
}

impl CommentConsumer {
    pub fn new(db: AppViewDb) -> Self {
        Self { db }
    }

    pub fn handle(&self, event: &JetstreamEvent, commit: &CommitEvent) -> AppResult<()> {
        let uri = record_uri(&event.did, &commit.collection, &commit.rkey);

        if commit.is_delete() {
            if self.db.soft_delete_comment(&uri)? {
                debug!("soft deleted comment {uri}");
            }
            return Ok(());
        }

        let record = commit
            .record
            .as_ref()
            .ok_or_else(|| AppError::validation("commit has no record payload"))?;
        let comment: CommentRecord = serde_json::from_value(record.clone())?;
        if comment.content.trim().is_empty() {
            return Err(AppError::validation("comment has no content"));
        }

        let root = &comment.reply.root;
        let (_, root_collection, _) = parse_record_uri(&root.uri)
            .ok_or_else(|| AppError::validation(format!("malformed reply root {}", root.uri)))?;
        if root_collection != COLLECTION_POST {
            return Err(AppError::validation(format!(
                "reply root must be a post, got {root_collection}"
            )));
        }

        let parent = &comment.reply.parent;
        let (_, parent_collection, _) = parse_record_uri(&parent.uri).ok_or_else(|| {
            AppError::validation(format!("malformed reply parent {}", parent.uri))
        })?;
        if parent_collection != COLLECTION_POST && parent_collection != COLLECTION_COMMENT {
            return Err(AppError::validation(format!(
                "reply parent must be a post or comment, got {parent_collection}"
            )));
        }
        if parent_collection == COLLECTION_POST && parent.uri != root.uri {
            return Err(AppError::validation(
                "reply parent post differs from reply root",
            ));
        }

        let cid = commit
            .cid
            .clone()
            .ok_or_else(|| AppError::validation("commit has no cid"))?;

        if commit.is_update() {
            if self.db.update_comment(&uri, &cid, &comment.content)? {
                return Ok(());
            }
        }

        let row = CommentRow {
            uri: uri.clone(),
            cid,
            post_uri: root.uri.clone(),
            parent_uri: parent.uri.clone(),
            commenter_did: event.did.clone(),
            content: comment.content,
            upvote_count: 0,
            downvote_count: 0,
            reply_count: 0,
            deleted: false,
            created_at: comment.created_at,
        };
        self.db.index_comment(&row)?;
        debug!("indexed comment {uri}");
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

    fn consumer(tag: &str) -> CommentConsumer {
        let mut nonce = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let path = std::env::temp_dir().join(format!(
            "coves_comment_consumer_{tag}_{}.db",
            hex::encode(nonce)
        ));
        let consumer = CommentConsumer::new(AppViewDb::open(path).unwrap());
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

    fn comment_event(
        repo_did: &str,
        rkey: &str,
        operation: &str,
        parent_uri: &str,
        parent_cid: &str,
    ) -> (JetstreamEvent, CommitEvent) {
        let commit = CommitEvent {
            rev: "3kz".to_string(),
            operation: operation.to_string(),
            collection: COLLECTION_COMMENT.to_string(),
            rkey: rkey.to_string(),
            cid: Some(format!("bafy{rkey}")),
            record: Some(json!({
                "$type": COLLECTION_COMMENT,
                "content": "a comment",
                "reply": {
                    "root": {"uri": POST_URI, "cid": "bafypost"},
                    "parent": {"uri": parent_uri, "cid": parent_cid}
                },
                "createdAt": "2026-01-03T00:00:00Z"
            })),
        };
        let event = JetstreamEvent {
            did: repo_did.to_string(),
            time_us: 1,
            kind: "commit".to_string(),
            commit: Some(commit.clone()),
            identity: None,
            account: None,
        };
        (event, commit)
    }

    #[test]
    fn top_level_comment_bumps_post_counter() {
        let consumer = consumer("top");
        let (event, commit) =
            comment_event("did:plc:alice", "3kzc1", "create", POST_URI, "bafypost");
        consumer.handle(&event, &commit).unwrap();
        consumer.handle(&event, &commit).unwrap();

        let post = consumer.db.get_post(POST_URI).unwrap().unwrap();
        assert_eq!(post.comment_count, 1);
    }

    #[test]
    fn nested_reply_bumps_parent_reply_counter() {
        let consumer = consumer("nested");
        let (event, commit) =
            comment_event("did:plc:alice", "3kzc1", "create", POST_URI, "bafypost");
        consumer.handle(&event, &commit).unwrap();

        let parent_uri = "at://did:plc:alice/social.coves.community.comment/3kzc1";
        let (event, commit) =
            comment_event("did:plc:bob", "3kzc2", "create", parent_uri, "bafy3kzc1");
        consumer.handle(&event, &commit).unwrap();

        let post = consumer.db.get_post(POST_URI).unwrap().unwrap();
        assert_eq!(post.comment_count, 2);
        let parent = consumer.db.get_comment(parent_uri).unwrap().unwrap();
        assert_eq!(parent.reply_count, 1);
    }

    #[test]
    fn comment_on_unknown_post_is_not_found() {
        let consumer = consumer("orphan");
        let missing = "at://did:plc:comm/social.coves.community.post/missing";
        let commit = CommitEvent {
            rev: "3kz".to_string(),
            operation: "create".to_string(),
            collection: COLLECTION_COMMENT.to_string(),
            rkey: "3kzc1".to_string(),
            cid: Some("bafyc1".to_string()),
            record: Some(json!({
                "content": "orphan",
                "reply": {
                    "root": {"uri": missing, "cid": "x"},
                    "parent": {"uri": missing, "cid": "x"}
                },
                "createdAt": "t"
            })),
        };
        let event = JetstreamEvent {
            did: "did:plc:alice".to_string(),
            time_us: 1,
            kind: "commit".to_string(),
            commit: Some(commit.clone()),
            identity: None,
            account: None,
        };
        assert!(consumer.handle(&event, &commit).unwrap_err().is_not_found());
    }

    #[test]
    fn rejects_root_that_is_not_a_post() {
        let consumer = consumer("bad_root");
        let bad_root = "at://did:plc:x/social.coves.feed.vote/3kz";
        let commit = CommitEvent {
            rev: "3kz".to_string(),
            operation: "create".to_string(),
            collection: COLLECTION_COMMENT.to_string(),
            rkey: "3kzc1".to_string(),
            cid: Some("bafyc1".to_string()),
            record: Some(json!({
                "content": "x",
                "reply": {
                    "root": {"uri": bad_root, "cid": "x"},
                    "parent": {"uri": bad_root, "cid": "x"}
                },
                "createdAt": "t"
            })),
        };
        let event = JetstreamEvent {
            did: "did:plc:alice".to_string(),
            time_us: 1,
            kind: "commit".to_string(),
            commit: Some(commit.clone()),
            identity: None,
            account: None,
        };
        let err = consumer.handle(&event, &commit).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn delete_decrements_counters() {
        let consumer = consumer("delete");
        let (event, commit) =
            comment_event("did:plc:alice", "3kzc1", "create", POST_URI, "bafypost");
        consumer.handle(&event, &commit).unwrap();

        let (event, commit) =
            comment_event("did:plc:alice", "3kzc1", "delete", POST_URI, "bafypost");
        consumer.handle(&event, &commit).unwrap();
        consumer.handle(&event, &commit).unwrap();

        let post = consumer.db.get_post(POST_URI).unwrap().unwrap();
        assert_eq!(post.comment_count, 0);
    }
}
