/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde_json::json;
use tracing::info;

use crate::appview_db::AppViewDb;
use crate::community_service::now_rfc3339;
use crate::error::{AppError, AppResult};
use crate::repo_auth::CommunityRepo;
use crate::tid::next_tid;
use coves_protocol::{parse_record_uri, COLLECTION_POST};

const MAX_TITLE_LEN: usize = 300;
const MAX_CONTENT_LEN: usize = 50_000;

#[derive(Debug, Clone)]
pub struct CreatePost {
    pub community_did: String,
    pub title: Option<String>,
    pub content: Option<String>,
}

/// Posts live in the community's repository, written with the community's
/// own credentials on behalf of the authoring member. The record carries
/// the author DID so consumers can attribute it.
#[derive(Clone)]
pub struct PostService {
    db: AppViewDb,
    http: reqwest::Client,
}

impl PostService {
    pub fn new(db: AppViewDb, http: reqwest::Client) -> Self {
        Self { db, http }
    }

    pub async fn create(&self, author_did: &str, req: &CreatePost) -> AppResult<(String, String)> {
        validate_post_body(req.title.as_deref(), req.content.as_deref())?;
        let community = self
            .db
            .get_community(&req.community_did)?
            .ok_or_else(|| AppError::not_found(format!("community {}", req.community_did)))?;
        if community.deleted {
            return Err(AppError::not_found(format!("community {}", req.community_did)));
        }
        if self.db.get_block(author_did, &community.did)?.is_some() {
            return Err(AppError::forbidden("author has blocked this community"));
        }

        let record = json!({
            "$type": COLLECTION_POST,
            "community": community.did,
            "author": author_did,
            "title": req.title,
            "content": req.content,
            "createdAt": now_rfc3339()?,
        });

        let mut repo = CommunityRepo::open(&self.db, &self.http, &community.did).await?;
        let rkey = next_tid();
        let written = repo
            .client
            .create_record(&mut repo.auth, &community.did, COLLECTION_POST, Some(&rkey), &record)
            .await?;
        info!("created post {} for {author_did}", written.uri);
        Ok((written.uri, written.cid))
    }

    /// Edits a post in place. Only the recorded author may edit; the write
    /// still happens with community credentials because the record lives in
    /// the community repo.
    pub async fn update(
        &self,
        caller_did: &str,
        post_uri: &str,
        title: Option<&str>,
        content: Option<&str>,
    ) -> AppResult<(String, String)> {
        validate_post_body(title, content)?;
        let post = self
            .db
            .get_post(post_uri)?
            .ok_or_else(|| AppError::not_found(format!("post {post_uri}")))?;
        if post.deleted {
            return Err(AppError::not_found(format!("post {post_uri}")));
        }
        if post.author_did != caller_did {
            return Err(AppError::forbidden("only the author can edit a post"));
        }
        let (repo_did, collection, rkey) = parse_record_uri(post_uri)
            .ok_or_else(|| AppError::validation(format!("malformed post uri {post_uri}")))?;

        let mut repo = CommunityRepo::open(&self.db, &self.http, &post.community_did).await?;
        let current = repo.client.get_record(&repo_did, &collection, &rkey).await?;
        let mut record = current.value.clone();
        record["title"] = json!(title);
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
        Ok((written.uri, written.cid))
    }

    /// Deletes a post from the community repository. Author-only; the
    /// AppView row is soft-deleted when the delete event arrives.
    pub async fn delete(&self, caller_did: &str, post_uri: &str) -> AppResult<()> {
        let post = self
            .db
            .get_post(post_uri)?
            .ok_or_else(|| AppError::not_found(format!("post {post_uri}")))?;
        if post.deleted {
            return Err(AppError::not_found(format!("post {post_uri}")));
        }
        if post.author_did != caller_did {
            return Err(AppError::forbidden("only the author can delete a post"));
        }
        let (repo_did, collection, rkey) = parse_record_uri(post_uri)
            .ok_or_else(|| AppError::validation(format!("malformed post uri {post_uri}")))?;

        let mut repo = CommunityRepo::open(&self.db, &self.http, &post.community_did).await?;
        repo.client
            .delete_record(&mut repo.auth, &repo_did, &collection, &rkey, None)
            .await?;
        info!("deleted post {post_uri}");
        Ok(())
    }
}

fn validate_post_body(title: Option<&str>, content: Option<&str>) -> AppResult<()> {
    let title_empty = title.map(str::trim).is_none_or(str::is_empty);
    let content_empty = content.map(str::trim).is_none_or(str::is_empty);
    if title_empty && content_empty {
        return Err(AppError::validation("a post needs a title or content"));
    }
    if title.is_some_and(|t| t.len() > MAX_TITLE_LEN) {
        return Err(AppError::validation(format!(
            "title exceeds {MAX_TITLE_LEN} characters"
        )));
    }
    if content.is_some_and(|c| c.len() > MAX_CONTENT_LEN) {
        return Err(AppError::validation(format!(
            "content exceeds {MAX_CONTENT_LEN} characters"
        )));
    }
    Ok(())
}
