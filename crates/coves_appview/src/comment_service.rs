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
use coves_protocol::{parse_record_uri, COLLECTION_COMMENT};

const MAX_COMMENT_LEN: usize = 10_000;

/// Comments live in the commenter's own repository, written over their
/// OAuth session. `reply.root` always points at the post; `reply.parent`
/// is the post for top-level comments or another comment for replies.
#[derive(Clone)]
pub struct CommentService {
    db: AppViewDb,
    store: OAuthStore,
    http: reqwest::Client,
}

impl CommentService {
    pub fn new(db: AppViewDb, store: OAuthStore, http: reqwest::Client) -> Self {
        Self { db, store, http }
    }

    pub async fn create(
        &self,
        caller_did: &str,
        session_id: &str,
        post_uri: &str,
        parent_uri: Option<&str>,
        content: &str,
    ) -> AppResult<(String, String)> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::validation("comment content is required"));
        }
        if content.len() > MAX_COMMENT_LEN {
            return Err(AppError::validation(format!(
                "comment exceeds {MAX_COMMENT_LEN} characters"
            )));
        }

        let post = self
            .db
            .get_post(post_uri)?
            .ok_or_else(|| AppError::not_found(format!("post {post_uri}")))?;
        if post.deleted {
            return Err(AppError::not_found(format!("post {post_uri}")));
        }
        let root = json!({"uri": post.uri, "cid": post.cid});

        let parent = match parent_uri {
            None => root.clone(),
            Some(uri) if uri == post_uri => root.clone(),
            Some(uri) => {
                let parent = self
                    .db
                    .get_comment(uri)?
                    .ok_or_else(|| AppError::not_found(format!("parent comment {uri}")))?;
                if parent.deleted {
                    return Err(AppError::not_found(format!("parent comment {uri}")));
                }
                if parent.post_uri != post.uri {
                    return Err(AppError::validation(
                        "parent comment belongs to a different post",
                    ));
                }
                json!({"uri": parent.uri, "cid": parent.cid})
            }
        };

        let record = json!({
            "$type": COLLECTION_COMMENT,
            "content": content,
            "reply": {"root": root, "parent": parent},
            "createdAt": now_rfc3339()?,
        });

        let mut repo = UserRepo::open(&self.store, &self.http, caller_did, session_id)?;
        let rkey = next_tid();
        let written = repo
            .client
            .create_record(&mut repo.auth, caller_did, COLLECTION_COMMENT, Some(&rkey), &record)
            .await?;
        repo.persist_nonce()?;
        Ok((written.uri, written.cid))
    }

    /// Edits the caller's own comment in place. The put compare-and-swaps
    /// on the current CID so a concurrent edit surfaces as `Conflict`.
    pub async fn update(
        &self,
        caller_did: &str,
        session_id: &str,
        comment_uri: &str,
        content: &str,
    ) -> AppResult<(String, String)> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::validation("comment content is required"));
        }
        if content.len() > MAX_COMMENT_LEN {
            return Err(AppError::validation(format!(
                "comment exceeds {MAX_COMMENT_LEN} characters"
            )));
        }

        let comment = self
            .db
            .get_comment(comment_uri)?
            .ok_or_else(|| AppError::not_found(format!("comment {comment_uri}")))?;
        if comment.deleted {
            return Err(AppError::not_found(format!("comment {comment_uri}")));
        }
        if comment.commenter_did != caller_did {
            return Err(AppError::forbidden("only the commenter can edit a comment"));
        }
        let (repo_did, collection, rkey) = parse_record_uri(comment_uri)
            .ok_or_else(|| AppError::validation(format!("malformed comment uri {comment_uri}")))?;

        let mut repo = UserRepo::open(&self.store, &self.http, caller_did, session_id)?;
        let current = repo.client.get_record(&repo_did, &collection, &rkey).await?;
        let mut record = current.value.clone();
        record["content"] = json!(content);

        let written = repo
            .client
            .put_record(
                &mut repo.auth,
                &repo_did,
                &collection,
                &rkey,
                &record,
                current.cid.as_deref(),
            )
            .await?;
        repo.persist_nonce()?;
        Ok((written.uri, written.cid))
    }

    /// Deletes the caller's own comment record. The URI names the repo it
    /// lives in, so a foreign comment is `Forbidden` before any PDS call.
    pub async fn delete(
        &self,
        caller_did: &str,
        session_id: &str,
        comment_uri: &str,
    ) -> AppResult<()> {
        let (repo_did, collection, rkey) = parse_record_uri(comment_uri)
            .ok_or_else(|| AppError::validation(format!("malformed comment uri {comment_uri}")))?;
        if repo_did != caller_did {
            return Err(AppError::forbidden("comment belongs to another repository"));
        }
        if collection != COLLECTION_COMMENT {
            return Err(AppError::validation(format!(
                "{comment_uri} is not a comment record"
            )));
        }

        let mut repo = UserRepo::open(&self.store, &self.http, caller_did, session_id)?;
        repo.client
            .delete_record(&mut repo.auth, &repo_did, &collection, &rkey, None)
            .await?;
        repo.persist_nonce()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appview_db::{CommentRow, CommunityRow, PostRow};
    use rand::RngCore;

    const POST_URI: &str = "at://did:plc:comm/social.coves.community.post/3kzpost";
    const COMMENT_URI: &str = "at://did:plc:alice/social.coves.community.comment/3kzc1";

    fn service(tag: &str) -> CommentService {
        let mut nonce = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let path = std::env::temp_dir().join(format!(
            "coves_comment_service_{tag}_{}.db",
            hex::encode(nonce)
        ));
        let db = AppViewDb::open(path).unwrap();
        db.upsert_community_profile(&CommunityRow {
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
        db.index_post(&PostRow {
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
        db.index_comment(&CommentRow {
            uri: COMMENT_URI.to_string(),
            cid: "bafyc1".to_string(),
            post_uri: POST_URI.to_string(),
            parent_uri: POST_URI.to_string(),
            commenter_did: "did:plc:alice".to_string(),
            content: "original".to_string(),
            upvote_count: 0,
            downvote_count: 0,
            reply_count: 0,
            deleted: false,
            created_at: "t".to_string(),
        })
        .unwrap();
        CommentService::new(db.clone(), OAuthStore::new(db), reqwest::Client::new())
    }

    #[tokio::test]
    async fn update_rejects_empty_and_oversized_content() {
        let service = service("update_len");
        let err = service
            .update("did:plc:alice", "sid", COMMENT_URI, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let long = "x".repeat(MAX_COMMENT_LEN + 1);
        let err = service
            .update("did:plc:alice", "sid", COMMENT_URI, &long)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn update_of_unknown_comment_is_not_found() {
        let service = service("update_missing");
        let missing = "at://did:plc:alice/social.coves.community.comment/nope";
        let err = service
            .update("did:plc:alice", "sid", missing, "edited")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn update_of_foreign_comment_is_forbidden() {
        let service = service("update_foreign");
        let err = service
            .update("did:plc:bob", "sid", COMMENT_URI, "edited")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn update_of_deleted_comment_is_not_found() {
        let service = service("update_deleted");
        service.db.soft_delete_comment(COMMENT_URI).unwrap();
        let err = service
            .update("did:plc:alice", "sid", COMMENT_URI, "edited")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
