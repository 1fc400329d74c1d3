/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

/// Derived index over firehose events plus the server-side session state.
/// Every record here can be rebuilt by replaying the firehose; the PDS
/// repositories stay the source of truth.
#[derive(Clone)]
pub struct AppViewDb {
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub did: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub avatar_cid: Option<String>,
    pub active: bool,
    pub indexed_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct CommunityRow {
    pub did: String,
    pub handle: String,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub creator_did: String,
    pub hosted_by: String,
    pub visibility: String,
    pub moderation_type: String,
    pub allow_external_discovery: bool,
    pub subscriber_count: i64,
    pub post_count: i64,
    pub deleted: bool,
    pub created_at: String,
}

/// PDS account credentials for a community this instance provisioned.
/// Absent for communities indexed off the firehose but hosted elsewhere.
#[derive(Debug, Clone)]
pub struct CommunityCredentials {
    pub pds_url: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct PostRow {
    pub uri: String,
    pub cid: String,
    pub community_did: String,
    pub author_did: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub upvote_count: i64,
    pub downvote_count: i64,
    pub score: i64,
    pub comment_count: i64,
    pub deleted: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CommentRow {
    pub uri: String,
    pub cid: String,
    pub post_uri: String,
    pub parent_uri: String,
    pub commenter_did: String,
    pub content: String,
    pub upvote_count: i64,
    pub downvote_count: i64,
    pub reply_count: i64,
    pub deleted: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct VoteRow {
    pub uri: String,
    pub voter_did: String,
    pub subject_uri: String,
    pub direction: String,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub record_uri: String,
    pub user_did: String,
    pub community_did: String,
    pub content_visibility: i64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct BlockRow {
    pub record_uri: String,
    pub user_did: String,
    pub community_did: String,
    pub created_at: String,
}

impl AppViewDb {
    pub fn open(db_path: impl AsRef<Path>) -> AppResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .map_err(|e| AppError::internal(format!("open db {}: {e}", path.display())))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS users (
              did TEXT PRIMARY KEY,
              handle TEXT NULL,
              display_name TEXT NULL,
              description TEXT NULL,
              avatar_cid TEXT NULL,
              active INTEGER NOT NULL DEFAULT 1,
              indexed_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_handle ON users(handle);

            CREATE TABLE IF NOT EXISTS communities (
              did TEXT PRIMARY KEY,
              handle TEXT NOT NULL UNIQUE,
              name TEXT NOT NULL,
              display_name TEXT NOT NULL DEFAULT '',
              description TEXT NOT NULL DEFAULT '',
              creator_did TEXT NOT NULL,
              hosted_by TEXT NOT NULL,
              visibility TEXT NOT NULL DEFAULT 'public',
              moderation_type TEXT NOT NULL DEFAULT 'standard',
              allow_external_discovery INTEGER NOT NULL DEFAULT 0,
              subscriber_count INTEGER NOT NULL DEFAULT 0,
              post_count INTEGER NOT NULL DEFAULT 0,
              deleted INTEGER NOT NULL DEFAULT 0,
              created_at TEXT NOT NULL,
              indexed_at_ms INTEGER NOT NULL,
              pds_url TEXT NULL,
              pds_email TEXT NULL,
              pds_password TEXT NULL
            );

            CREATE TABLE IF NOT EXISTS posts (
              uri TEXT PRIMARY KEY,
              cid TEXT NOT NULL,
              community_did TEXT NOT NULL,
              author_did TEXT NOT NULL,
              title TEXT NULL,
              content TEXT NULL,
              upvote_count INTEGER NOT NULL DEFAULT 0,
              downvote_count INTEGER NOT NULL DEFAULT 0,
              score INTEGER NOT NULL DEFAULT 0,
              comment_count INTEGER NOT NULL DEFAULT 0,
              deleted INTEGER NOT NULL DEFAULT 0,
              created_at TEXT NOT NULL,
              indexed_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_posts_community ON posts(community_did, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_posts_author ON posts(author_did);

            CREATE TABLE IF NOT EXISTS comments (
              uri TEXT PRIMARY KEY,
              cid TEXT NOT NULL,
              post_uri TEXT NOT NULL,
              parent_uri TEXT NOT NULL,
              commenter_did TEXT NOT NULL,
              content TEXT NOT NULL,
              upvote_count INTEGER NOT NULL DEFAULT 0,
              downvote_count INTEGER NOT NULL DEFAULT 0,
              reply_count INTEGER NOT NULL DEFAULT 0,
              deleted INTEGER NOT NULL DEFAULT 0,
              created_at TEXT NOT NULL,
              indexed_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_uri, created_at);
            CREATE INDEX IF NOT EXISTS idx_comments_parent ON comments(parent_uri);

            CREATE TABLE IF NOT EXISTS votes (
              uri TEXT PRIMARY KEY,
              cid TEXT NOT NULL DEFAULT '',
              voter_did TEXT NOT NULL,
              subject_uri TEXT NOT NULL,
              direction TEXT NOT NULL,
              retracted INTEGER NOT NULL DEFAULT 0,
              created_at TEXT NOT NULL,
              indexed_at_ms INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_votes_active
              ON votes(voter_did, subject_uri) WHERE retracted = 0;

            CREATE TABLE IF NOT EXISTS subscriptions (
              record_uri TEXT PRIMARY KEY,
              user_did TEXT NOT NULL,
              community_did TEXT NOT NULL,
              content_visibility INTEGER NOT NULL DEFAULT 3,
              created_at TEXT NOT NULL,
              indexed_at_ms INTEGER NOT NULL,
              UNIQUE(user_did, community_did)
            );

            CREATE TABLE IF NOT EXISTS community_blocks (
              record_uri TEXT PRIMARY KEY,
              user_did TEXT NOT NULL,
              community_did TEXT NOT NULL,
              created_at TEXT NOT NULL,
              indexed_at_ms INTEGER NOT NULL,
              UNIQUE(user_did, community_did)
            );

            CREATE TABLE IF NOT EXISTS identity_cache (
              cache_key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              expires_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_identity_expires ON identity_cache(expires_at_ms);

            CREATE TABLE IF NOT EXISTS oauth_sessions (
              did TEXT NOT NULL,
              session_id TEXT NOT NULL,
              access_token TEXT NOT NULL,
              refresh_token TEXT NOT NULL,
              dpop_key_hex TEXT NOT NULL,
              dpop_auth_nonce TEXT NOT NULL DEFAULT '',
              dpop_pds_nonce TEXT NOT NULL DEFAULT '',
              auth_server_url TEXT NOT NULL,
              token_endpoint TEXT NOT NULL,
              pds_url TEXT NOT NULL,
              handle TEXT NOT NULL DEFAULT '',
              expires_at_ms INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY(did, session_id)
            );
            CREATE INDEX IF NOT EXISTS idx_oauth_sessions_expires ON oauth_sessions(expires_at_ms);

            CREATE TABLE IF NOT EXISTS oauth_requests (
              state TEXT PRIMARY KEY,
              did TEXT NULL,
              handle TEXT NULL,
              pkce_verifier TEXT NOT NULL,
              dpop_key_hex TEXT NOT NULL,
              auth_server_url TEXT NOT NULL,
              token_endpoint TEXT NOT NULL,
              pds_url TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              expires_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_oauth_requests_expires ON oauth_requests(expires_at_ms);

            CREATE TABLE IF NOT EXISTS firehose_cursor (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              time_us INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dead_letter_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              did TEXT NOT NULL,
              collection TEXT NOT NULL,
              rkey TEXT NOT NULL,
              operation TEXT NOT NULL,
              event_json TEXT NOT NULL,
              error TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dead_letter_created ON dead_letter_events(created_at_ms);
            "#,
        )?;
        Ok(Self { path })
    }

    pub(crate) fn conn(&self) -> AppResult<Connection> {
        Connection::open(&self.path)
            .map_err(|e| AppError::internal(format!("open db {}: {e}", self.path.display())))
    }

    pub fn health_check(&self) -> AppResult<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ---- users ----

    pub fn upsert_user(&self, did: &str, handle: Option<&str>) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO users(did, handle, indexed_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(did) DO UPDATE SET
              handle=COALESCE(excluded.handle, users.handle),
              indexed_at_ms=excluded.indexed_at_ms
            "#,
            params![did, handle, now_ms()],
        )?;
        Ok(())
    }

    pub fn update_user_profile(
        &self,
        did: &str,
        display_name: Option<&str>,
        description: Option<&str>,
        avatar_cid: Option<&str>,
    ) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO users(did, display_name, description, avatar_cid, indexed_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(did) DO UPDATE SET
              display_name=excluded.display_name,
              description=excluded.description,
              avatar_cid=excluded.avatar_cid,
              indexed_at_ms=excluded.indexed_at_ms
            "#,
            params![did, display_name, description, avatar_cid, now_ms()],
        )?;
        Ok(())
    }

    /// Applies a handle change from an identity event. Active OAuth sessions
    /// carry the handle for display, so they are updated in the same
    /// transaction.
    pub fn update_user_handle(&self, did: &str, handle: &str) -> AppResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO users(did, handle, indexed_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(did) DO UPDATE SET
              handle=excluded.handle, indexed_at_ms=excluded.indexed_at_ms
            "#,
            params![did, handle, now_ms()],
        )?;
        tx.execute(
            "UPDATE oauth_sessions SET handle=?2, updated_at_ms=?3 WHERE did=?1",
            params![did, handle, now_ms()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_user_active(&self, did: &str, active: bool) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET active=?2, indexed_at_ms=?3 WHERE did=?1",
            params![did, active as i64, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_user(&self, did: &str) -> AppResult<Option<UserRow>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"SELECT did, handle, display_name, description, avatar_cid, active, indexed_at_ms
               FROM users WHERE did=?1"#,
            params![did],
            |r| {
                Ok(UserRow {
                    did: r.get(0)?,
                    handle: r.get(1)?,
                    display_name: r.get(2)?,
                    description: r.get(3)?,
                    avatar_cid: r.get(4)?,
                    active: r.get::<_, i64>(5)? != 0,
                    indexed_at_ms: r.get(6)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // ---- communities ----

    /// Persists a freshly provisioned community together with the PDS
    /// account credentials this instance controls. A duplicate handle is a
    /// `Conflict`.
    pub fn insert_community(
        &self,
        row: &CommunityRow,
        creds: &CommunityCredentials,
    ) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO communities(
              did, handle, name, display_name, description, creator_did, hosted_by,
              visibility, moderation_type, allow_external_discovery,
              created_at, indexed_at_ms, pds_url, pds_email, pds_password)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                row.did,
                row.handle,
                row.name,
                row.display_name,
                row.description,
                row.creator_did,
                row.hosted_by,
                row.visibility,
                row.moderation_type,
                row.allow_external_discovery as i64,
                row.created_at,
                now_ms(),
                creds.pds_url,
                creds.email,
                creds.password,
            ],
        )?;
        Ok(())
    }

    /// Indexes a community profile event. Counters and credentials are left
    /// alone; only profile fields move.
    pub fn upsert_community_profile(&self, row: &CommunityRow) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO communities(
              did, handle, name, display_name, description, creator_did, hosted_by,
              visibility, moderation_type, allow_external_discovery,
              created_at, indexed_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(did) DO UPDATE SET
              handle=excluded.handle,
              name=excluded.name,
              display_name=excluded.display_name,
              description=excluded.description,
              hosted_by=excluded.hosted_by,
              visibility=excluded.visibility,
              moderation_type=excluded.moderation_type,
              allow_external_discovery=excluded.allow_external_discovery,
              deleted=0,
              indexed_at_ms=excluded.indexed_at_ms
            "#,
            params![
                row.did,
                row.handle,
                row.name,
                row.display_name,
                row.description,
                row.creator_did,
                row.hosted_by,
                row.visibility,
                row.moderation_type,
                row.allow_external_discovery as i64,
                row.created_at,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn get_community(&self, did: &str) -> AppResult<Option<CommunityRow>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{COMMUNITY_SELECT} WHERE did=?1"),
            params![did],
            community_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_community_by_handle(&self, handle: &str) -> AppResult<Option<CommunityRow>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{COMMUNITY_SELECT} WHERE handle=?1"),
            params![handle],
            community_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_community_credentials(&self, did: &str) -> AppResult<Option<CommunityCredentials>> {
        let conn = self.conn()?;
        let row: Option<(Option<String>, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT pds_url, pds_email, pds_password FROM communities WHERE did=?1",
                params![did],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        Ok(row.and_then(|(url, email, password)| {
            Some(CommunityCredentials {
                pds_url: url?,
                email: email?,
                password: password?,
            })
        }))
    }

    pub fn mark_community_deleted(&self, did: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE communities SET deleted=1, indexed_at_ms=?2 WHERE did=?1 AND deleted=0",
            params![did, now_ms()],
        )?;
        Ok(changed > 0)
    }

    // ---- posts ----

    /// Indexes a post create. Returns false when the URI was already
    /// indexed (replayed event); the community post counter only moves on
    /// first insert, in the same transaction.
    pub fn index_post(&self, post: &PostRow) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            r#"
            INSERT INTO posts(uri, cid, community_did, author_did, title, content,
                              created_at, indexed_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(uri) DO NOTHING
            "#,
            params![
                post.uri,
                post.cid,
                post.community_did,
                post.author_did,
                post.title,
                post.content,
                post.created_at,
                now_ms(),
            ],
        )?;
        if inserted > 0 {
            tx.execute(
                "UPDATE communities SET post_count=post_count+1 WHERE did=?1",
                params![post.community_did],
            )?;
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    pub fn update_post(
        &self,
        uri: &str,
        cid: &str,
        title: Option<&str>,
        content: Option<&str>,
    ) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE posts SET cid=?2, title=?3, content=?4, indexed_at_ms=?5 WHERE uri=?1 AND deleted=0",
            params![uri, cid, title, content, now_ms()],
        )?;
        Ok(changed > 0)
    }

    /// Soft-deletes a post and decrements the community post counter, never
    /// below zero. Replay safe: a second delete changes nothing.
    pub fn soft_delete_post(&self, uri: &str) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let community: Option<String> = tx
            .query_row(
                "SELECT community_did FROM posts WHERE uri=?1 AND deleted=0",
                params![uri],
                |r| r.get(0),
            )
            .optional()?;
        let Some(community) = community else {
            tx.commit()?;
            return Ok(false);
        };
        tx.execute(
            "UPDATE posts SET deleted=1, indexed_at_ms=?2 WHERE uri=?1",
            params![uri, now_ms()],
        )?;
        tx.execute(
            "UPDATE communities SET post_count=MAX(post_count-1, 0) WHERE did=?1",
            params![community],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_post(&self, uri: &str) -> AppResult<Option<PostRow>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"SELECT uri, cid, community_did, author_did, title, content,
                      upvote_count, downvote_count, score, comment_count, deleted, created_at
               FROM posts WHERE uri=?1"#,
            params![uri],
            |r| {
                Ok(PostRow {
                    uri: r.get(0)?,
                    cid: r.get(1)?,
                    community_did: r.get(2)?,
                    author_did: r.get(3)?,
                    title: r.get(4)?,
                    content: r.get(5)?,
                    upvote_count: r.get(6)?,
                    downvote_count: r.get(7)?,
                    score: r.get(8)?,
                    comment_count: r.get(9)?,
                    deleted: r.get::<_, i64>(10)? != 0,
                    created_at: r.get(11)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // ---- comments ----

    /// Indexes a comment create. The root post must already be indexed; a
    /// comment on an unknown post is a `NotFound` for the caller to turn
    /// into its failure policy. `reply_count` moves on the parent comment
    /// only for nested replies; `comment_count` moves on the post either
    /// way, all in one transaction.
    pub fn index_comment(&self, comment: &CommentRow) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let post_exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM posts WHERE uri=?1 AND deleted=0",
                params![comment.post_uri],
                |r| r.get(0),
            )
            .optional()?;
        if post_exists.is_none() {
            return Err(AppError::not_found(format!(
                "post {} is not indexed",
                comment.post_uri
            )));
        }
        if comment.parent_uri != comment.post_uri {
            let parent_exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM comments WHERE uri=?1 AND deleted=0",
                    params![comment.parent_uri],
                    |r| r.get(0),
                )
                .optional()?;
            if parent_exists.is_none() {
                return Err(AppError::not_found(format!(
                    "parent comment {} is not indexed",
                    comment.parent_uri
                )));
            }
        }

        let inserted = tx.execute(
            r#"
            INSERT INTO comments(uri, cid, post_uri, parent_uri, commenter_did, content,
                                 created_at, indexed_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(uri) DO NOTHING
            "#,
            params![
                comment.uri,
                comment.cid,
                comment.post_uri,
                comment.parent_uri,
                comment.commenter_did,
                comment.content,
                comment.created_at,
                now_ms(),
            ],
        )?;
        if inserted > 0 {
            tx.execute(
                "UPDATE posts SET comment_count=comment_count+1 WHERE uri=?1",
                params![comment.post_uri],
            )?;
            if comment.parent_uri != comment.post_uri {
                tx.execute(
                    "UPDATE comments SET reply_count=reply_count+1 WHERE uri=?1",
                    params![comment.parent_uri],
                )?;
            }
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    pub fn update_comment(&self, uri: &str, cid: &str, content: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE comments SET cid=?2, content=?3, indexed_at_ms=?4 WHERE uri=?1 AND deleted=0",
            params![uri, cid, content, now_ms()],
        )?;
        Ok(changed > 0)
    }

    pub fn soft_delete_comment(&self, uri: &str) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let refs: Option<(String, String)> = tx
            .query_row(
                "SELECT post_uri, parent_uri FROM comments WHERE uri=?1 AND deleted=0",
                params![uri],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((post_uri, parent_uri)) = refs else {
            tx.commit()?;
            return Ok(false);
        };
        tx.execute(
            "UPDATE comments SET deleted=1, indexed_at_ms=?2 WHERE uri=?1",
            params![uri, now_ms()],
        )?;
        tx.execute(
            "UPDATE posts SET comment_count=MAX(comment_count-1, 0) WHERE uri=?1",
            params![post_uri],
        )?;
        if parent_uri != post_uri {
            tx.execute(
                "UPDATE comments SET reply_count=MAX(reply_count-1, 0) WHERE uri=?1",
                params![parent_uri],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn get_comment(&self, uri: &str) -> AppResult<Option<CommentRow>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"SELECT uri, cid, post_uri, parent_uri, commenter_did, content,
                      upvote_count, downvote_count, reply_count, deleted, created_at
               FROM comments WHERE uri=?1"#,
            params![uri],
            |r| {
                Ok(CommentRow {
                    uri: r.get(0)?,
                    cid: r.get(1)?,
                    post_uri: r.get(2)?,
                    parent_uri: r.get(3)?,
                    commenter_did: r.get(4)?,
                    content: r.get(5)?,
                    upvote_count: r.get(6)?,
                    downvote_count: r.get(7)?,
                    reply_count: r.get(8)?,
                    deleted: r.get::<_, i64>(9)? != 0,
                    created_at: r.get(10)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // ---- votes ----

    /// Applies a vote create. One active vote per (voter, subject): an
    /// existing vote with a different direction is retracted and the new
    /// one inserted in the same transaction, so counters never double
    /// count. Replaying the same record URI is a no-op.
    pub fn apply_vote(
        &self,
        uri: &str,
        cid: &str,
        voter_did: &str,
        subject_uri: &str,
        direction: &str,
        created_at: &str,
    ) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let already: Option<i64> = tx
            .query_row("SELECT 1 FROM votes WHERE uri=?1", params![uri], |r| {
                r.get(0)
            })
            .optional()?;
        if already.is_some() {
            tx.commit()?;
            return Ok(false);
        }

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT uri, direction FROM votes WHERE voter_did=?1 AND subject_uri=?2 AND retracted=0",
                params![voter_did, subject_uri],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        if let Some((old_uri, old_direction)) = existing {
            tx.execute(
                "UPDATE votes SET retracted=1, indexed_at_ms=?2 WHERE uri=?1",
                params![old_uri, now_ms()],
            )?;
            apply_vote_delta(&tx, subject_uri, &old_direction, -1)?;
        }

        tx.execute(
            r#"
            INSERT INTO votes(uri, cid, voter_did, subject_uri, direction, created_at, indexed_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![uri, cid, voter_did, subject_uri, direction, created_at, now_ms()],
        )?;
        apply_vote_delta(&tx, subject_uri, direction, 1)?;
        tx.commit()?;
        Ok(true)
    }

    /// Applies a vote delete. Only an active (non-retracted) vote moves the
    /// counters; replays change nothing.
    pub fn retract_vote(&self, uri: &str) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT subject_uri, direction FROM votes WHERE uri=?1 AND retracted=0",
                params![uri],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((subject_uri, direction)) = row else {
            tx.commit()?;
            return Ok(false);
        };
        tx.execute(
            "UPDATE votes SET retracted=1, indexed_at_ms=?2 WHERE uri=?1",
            params![uri, now_ms()],
        )?;
        apply_vote_delta(&tx, &subject_uri, &direction, -1)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_active_vote(
        &self,
        voter_did: &str,
        subject_uri: &str,
    ) -> AppResult<Option<VoteRow>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"SELECT uri, voter_did, subject_uri, direction
               FROM votes WHERE voter_did=?1 AND subject_uri=?2 AND retracted=0"#,
            params![voter_did, subject_uri],
            |r| {
                Ok(VoteRow {
                    uri: r.get(0)?,
                    voter_did: r.get(1)?,
                    subject_uri: r.get(2)?,
                    direction: r.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // ---- subscriptions ----

    /// Indexes a subscription create. One active subscription per
    /// (user, community); replays and duplicate pairs both come back as
    /// false with the counter untouched.
    pub fn index_subscription(&self, sub: &SubscriptionRow) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            r#"
            INSERT INTO subscriptions(record_uri, user_did, community_did,
                                      content_visibility, created_at, indexed_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT DO NOTHING
            "#,
            params![
                sub.record_uri,
                sub.user_did,
                sub.community_did,
                sub.content_visibility,
                sub.created_at,
                now_ms(),
            ],
        )?;
        if inserted > 0 {
            tx.execute(
                "UPDATE communities SET subscriber_count=subscriber_count+1 WHERE did=?1",
                params![sub.community_did],
            )?;
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    pub fn remove_subscription(&self, record_uri: &str) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let community: Option<String> = tx
            .query_row(
                "SELECT community_did FROM subscriptions WHERE record_uri=?1",
                params![record_uri],
                |r| r.get(0),
            )
            .optional()?;
        let Some(community) = community else {
            tx.commit()?;
            return Ok(false);
        };
        tx.execute(
            "DELETE FROM subscriptions WHERE record_uri=?1",
            params![record_uri],
        )?;
        tx.execute(
            "UPDATE communities SET subscriber_count=MAX(subscriber_count-1, 0) WHERE did=?1",
            params![community],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_subscription(
        &self,
        user_did: &str,
        community_did: &str,
    ) -> AppResult<Option<SubscriptionRow>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"SELECT record_uri, user_did, community_did, content_visibility, created_at
               FROM subscriptions WHERE user_did=?1 AND community_did=?2"#,
            params![user_did, community_did],
            |r| {
                Ok(SubscriptionRow {
                    record_uri: r.get(0)?,
                    user_did: r.get(1)?,
                    community_did: r.get(2)?,
                    content_visibility: r.get(3)?,
                    created_at: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // ---- community blocks ----

    pub fn index_block(&self, block: &BlockRow) -> AppResult<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT INTO community_blocks(record_uri, user_did, community_did, created_at, indexed_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT DO NOTHING
            "#,
            params![
                block.record_uri,
                block.user_did,
                block.community_did,
                block.created_at,
                now_ms(),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn remove_block(&self, record_uri: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM community_blocks WHERE record_uri=?1",
            params![record_uri],
        )?;
        Ok(removed > 0)
    }

    pub fn get_block(&self, user_did: &str, community_did: &str) -> AppResult<Option<BlockRow>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"SELECT record_uri, user_did, community_did, created_at
               FROM community_blocks WHERE user_did=?1 AND community_did=?2"#,
            params![user_did, community_did],
            |r| {
                Ok(BlockRow {
                    record_uri: r.get(0)?,
                    user_did: r.get(1)?,
                    community_did: r.get(2)?,
                    created_at: r.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // ---- firehose cursor ----

    pub fn get_cursor(&self) -> AppResult<Option<i64>> {
        let conn = self.conn()?;
        conn.query_row("SELECT time_us FROM firehose_cursor WHERE id=1", [], |r| {
            r.get(0)
        })
        .optional()
        .map_err(Into::into)
    }

    pub fn set_cursor(&self, time_us: i64) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO firehose_cursor(id, time_us) VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET time_us=MAX(firehose_cursor.time_us, excluded.time_us)
            "#,
            params![time_us],
        )?;
        Ok(())
    }

    // ---- dead letters ----

    pub fn record_dead_letter(
        &self,
        did: &str,
        collection: &str,
        rkey: &str,
        operation: &str,
        event_json: &str,
        error: &str,
    ) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO dead_letter_events(did, collection, rkey, operation, event_json, error, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![did, collection, rkey, operation, event_json, error, now_ms()],
        )?;
        Ok(())
    }

    pub fn cleanup_dead_letters(&self, older_than_ms: i64) -> AppResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM dead_letter_events WHERE created_at_ms < ?1",
            params![now_ms() - older_than_ms],
        )?;
        Ok(removed)
    }

    // ---- identity cache ----

    pub fn identity_cache_get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM identity_cache WHERE cache_key=?1 AND expires_at_ms > ?2",
            params![key, now_ms()],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn identity_cache_put(&self, key: &str, value: &str, ttl_secs: i64) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO identity_cache(cache_key, value, expires_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(cache_key) DO UPDATE SET
              value=excluded.value, expires_at_ms=excluded.expires_at_ms
            "#,
            params![key, value, now_ms() + ttl_secs * 1000],
        )?;
        Ok(())
    }

    pub fn cleanup_identity_cache(&self) -> AppResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM identity_cache WHERE expires_at_ms <= ?1",
            params![now_ms()],
        )?;
        Ok(removed)
    }
}

const COMMUNITY_SELECT: &str = r#"
    SELECT did, handle, name, display_name, description, creator_did, hosted_by,
           visibility, moderation_type, allow_external_discovery,
           subscriber_count, post_count, deleted, created_at
    FROM communities"#;

fn community_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<CommunityRow> {
    Ok(CommunityRow {
        did: r.get(0)?,
        handle: r.get(1)?,
        name: r.get(2)?,
        display_name: r.get(3)?,
        description: r.get(4)?,
        creator_did: r.get(5)?,
        hosted_by: r.get(6)?,
        visibility: r.get(7)?,
        moderation_type: r.get(8)?,
        allow_external_discovery: r.get::<_, i64>(9)? != 0,
        subscriber_count: r.get(10)?,
        post_count: r.get(11)?,
        deleted: r.get::<_, i64>(12)? != 0,
        created_at: r.get(13)?,
    })
}

/// Moves a vote counter on whichever row the subject URI names. Votes on
/// posts also move the score; comments track the raw counters only.
fn apply_vote_delta(
    tx: &Transaction<'_>,
    subject_uri: &str,
    direction: &str,
    delta: i64,
) -> AppResult<()> {
    let (count_col, score_delta) = match direction {
        "up" => ("upvote_count", delta),
        "down" => ("downvote_count", -delta),
        other => {
            return Err(AppError::validation(format!(
                "unknown vote direction {other}"
            )))
        }
    };

    let changed = tx.execute(
        &format!(
            "UPDATE posts SET {count_col}=MAX({count_col}+?2, 0), score=score+?3 WHERE uri=?1"
        ),
        params![subject_uri, delta, score_delta],
    )?;
    if changed > 0 {
        return Ok(());
    }
    let changed = tx.execute(
        &format!("UPDATE comments SET {count_col}=MAX({count_col}+?2, 0) WHERE uri=?1"),
        params![subject_uri, delta],
    )?;
    if changed > 0 {
        return Ok(());
    }
    Err(AppError::not_found(format!(
        "vote subject {subject_uri} is not indexed"
    )))
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db(tag: &str) -> AppViewDb {
        let mut nonce = [0u8; 8];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let path = std::env::temp_dir().join(format!(
            "coves_appview_{tag}_{}.db",
            hex::encode(nonce)
        ));
        AppViewDb::open(path).unwrap()
    }

    fn community(did: &str, handle: &str) -> CommunityRow {
        CommunityRow {
            did: did.to_string(),
            handle: handle.to_string(),
            name: "gaming".to_string(),
            display_name: "Gaming".to_string(),
            description: String::new(),
            creator_did: "did:plc:creator".to_string(),
            hosted_by: "did:web:coves.social".to_string(),
            visibility: "public".to_string(),
            moderation_type: "standard".to_string(),
            allow_external_discovery: true,
            subscriber_count: 0,
            post_count: 0,
            deleted: false,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn creds() -> CommunityCredentials {
        CommunityCredentials {
            pds_url: "https://pds.example".to_string(),
            email: "c-gaming@coves.social".to_string(),
            password: "secret".to_string(),
        }
    }

    fn post(uri: &str, community: &str) -> PostRow {
        PostRow {
            uri: uri.to_string(),
            cid: "bafypost".to_string(),
            community_did: community.to_string(),
            author_did: "did:plc:author".to_string(),
            title: Some("hello".to_string()),
            content: Some("world".to_string()),
            upvote_count: 0,
            downvote_count: 0,
            score: 0,
            comment_count: 0,
            deleted: false,
            created_at: "2026-01-02T00:00:00Z".to_string(),
        }
    }

    fn seed_post(db: &AppViewDb, uri: &str) {
        db.upsert_community_profile(&community("did:plc:comm", "c-gaming.coves.social"))
            .unwrap();
        assert!(db.index_post(&post(uri, "did:plc:comm")).unwrap());
    }

    #[test]
    fn duplicate_community_handle_is_conflict() {
        let db = test_db("handle_conflict");
        db.insert_community(&community("did:plc:one", "c-gaming.coves.social"), &creds())
            .unwrap();
        let err = db
            .insert_community(&community("did:plc:two", "c-gaming.coves.social"), &creds())
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn post_indexing_is_idempotent_and_counts() {
        let db = test_db("post_idem");
        seed_post(&db, "at://did:plc:comm/social.coves.community.post/3a");
        assert!(!db
            .index_post(&post(
                "at://did:plc:comm/social.coves.community.post/3a",
                "did:plc:comm"
            ))
            .unwrap());
        let c = db.get_community("did:plc:comm").unwrap().unwrap();
        assert_eq!(c.post_count, 1);

        assert!(db
            .soft_delete_post("at://did:plc:comm/social.coves.community.post/3a")
            .unwrap());
        assert!(!db
            .soft_delete_post("at://did:plc:comm/social.coves.community.post/3a")
            .unwrap());
        let c = db.get_community("did:plc:comm").unwrap().unwrap();
        assert_eq!(c.post_count, 0);
    }

    #[test]
    fn vote_direction_change_swaps_counters_atomically() {
        let db = test_db("vote_swap");
        let post_uri = "at://did:plc:comm/social.coves.community.post/3b";
        seed_post(&db, post_uri);

        assert!(db
            .apply_vote("at://did:plc:v/social.coves.feed.vote/1", "c1", "did:plc:v", post_uri, "up", "t")
            .unwrap());
        let p = db.get_post(post_uri).unwrap().unwrap();
        assert_eq!((p.upvote_count, p.downvote_count, p.score), (1, 0, 1));

        // Same voter, new record, opposite direction.
        assert!(db
            .apply_vote("at://did:plc:v/social.coves.feed.vote/2", "c2", "did:plc:v", post_uri, "down", "t")
            .unwrap());
        let p = db.get_post(post_uri).unwrap().unwrap();
        assert_eq!((p.upvote_count, p.downvote_count, p.score), (0, 1, -1));

        // Replay of the second record changes nothing.
        assert!(!db
            .apply_vote("at://did:plc:v/social.coves.feed.vote/2", "c2", "did:plc:v", post_uri, "down", "t")
            .unwrap());
        let p = db.get_post(post_uri).unwrap().unwrap();
        assert_eq!((p.upvote_count, p.downvote_count, p.score), (0, 1, -1));
    }

    #[test]
    fn vote_retraction_never_goes_negative() {
        let db = test_db("vote_retract");
        let post_uri = "at://did:plc:comm/social.coves.community.post/3c";
        seed_post(&db, post_uri);

        let vote_uri = "at://did:plc:v/social.coves.feed.vote/1";
        db.apply_vote(vote_uri, "c1", "did:plc:v", post_uri, "up", "t")
            .unwrap();
        assert!(db.retract_vote(vote_uri).unwrap());
        assert!(!db.retract_vote(vote_uri).unwrap());
        let p = db.get_post(post_uri).unwrap().unwrap();
        assert_eq!((p.upvote_count, p.score), (0, 0));
    }

    #[test]
    fn vote_on_unknown_subject_is_not_found() {
        let db = test_db("vote_orphan");
        let err = db
            .apply_vote("at://x/v/1", "c", "did:plc:v", "at://missing/post/1", "up", "t")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn comments_maintain_post_and_parent_counters() {
        let db = test_db("comments");
        let post_uri = "at://did:plc:comm/social.coves.community.post/3d";
        seed_post(&db, post_uri);

        let top = CommentRow {
            uri: "at://did:plc:a/social.coves.community.comment/1".to_string(),
            cid: "bafyc1".to_string(),
            post_uri: post_uri.to_string(),
            parent_uri: post_uri.to_string(),
            commenter_did: "did:plc:a".to_string(),
            content: "top".to_string(),
            upvote_count: 0,
            downvote_count: 0,
            reply_count: 0,
            deleted: false,
            created_at: "t".to_string(),
        };
        assert!(db.index_comment(&top).unwrap());
        assert!(!db.index_comment(&top).unwrap());

        let nested = CommentRow {
            uri: "at://did:plc:b/social.coves.community.comment/2".to_string(),
            parent_uri: top.uri.clone(),
            commenter_did: "did:plc:b".to_string(),
            content: "nested".to_string(),
            ..top.clone()
        };
        assert!(db.index_comment(&nested).unwrap());

        let p = db.get_post(post_uri).unwrap().unwrap();
        assert_eq!(p.comment_count, 2);
        let parent = db.get_comment(&top.uri).unwrap().unwrap();
        assert_eq!(parent.reply_count, 1);

        assert!(db.soft_delete_comment(&nested.uri).unwrap());
        let p = db.get_post(post_uri).unwrap().unwrap();
        assert_eq!(p.comment_count, 1);
        let parent = db.get_comment(&top.uri).unwrap().unwrap();
        assert_eq!(parent.reply_count, 0);
    }

    #[test]
    fn comment_on_unknown_post_is_not_found() {
        let db = test_db("comment_orphan");
        let orphan = CommentRow {
            uri: "at://did:plc:a/social.coves.community.comment/1".to_string(),
            cid: "bafyc".to_string(),
            post_uri: "at://missing/post/1".to_string(),
            parent_uri: "at://missing/post/1".to_string(),
            commenter_did: "did:plc:a".to_string(),
            content: "x".to_string(),
            upvote_count: 0,
            downvote_count: 0,
            reply_count: 0,
            deleted: false,
            created_at: "t".to_string(),
        };
        assert!(db.index_comment(&orphan).unwrap_err().is_not_found());
    }

    #[test]
    fn subscriptions_are_idempotent_and_counted() {
        let db = test_db("subs");
        db.upsert_community_profile(&community("did:plc:comm", "c-gaming.coves.social"))
            .unwrap();
        let sub = SubscriptionRow {
            record_uri: "at://did:plc:u/social.coves.community.subscription/1".to_string(),
            user_did: "did:plc:u".to_string(),
            community_did: "did:plc:comm".to_string(),
            content_visibility: 3,
            created_at: "t".to_string(),
        };
        assert!(db.index_subscription(&sub).unwrap());
        assert!(!db.index_subscription(&sub).unwrap());

        // Second record for the same pair does not double count.
        let dup = SubscriptionRow {
            record_uri: "at://did:plc:u/social.coves.community.subscription/2".to_string(),
            ..sub.clone()
        };
        assert!(!db.index_subscription(&dup).unwrap());

        let c = db.get_community("did:plc:comm").unwrap().unwrap();
        assert_eq!(c.subscriber_count, 1);

        assert!(db.remove_subscription(&sub.record_uri).unwrap());
        assert!(!db.remove_subscription(&sub.record_uri).unwrap());
        let c = db.get_community("did:plc:comm").unwrap().unwrap();
        assert_eq!(c.subscriber_count, 0);
    }

    #[test]
    fn cursor_only_moves_forward() {
        let db = test_db("cursor");
        assert!(db.get_cursor().unwrap().is_none());
        db.set_cursor(100).unwrap();
        db.set_cursor(50).unwrap();
        assert_eq!(db.get_cursor().unwrap(), Some(100));
        db.set_cursor(200).unwrap();
        assert_eq!(db.get_cursor().unwrap(), Some(200));
    }

    #[test]
    fn identity_cache_honours_ttl() {
        let db = test_db("idcache");
        db.identity_cache_put("handle:alice.test", "did:plc:alice", 60)
            .unwrap();
        assert_eq!(
            db.identity_cache_get("handle:alice.test").unwrap().as_deref(),
            Some("did:plc:alice")
        );
        db.identity_cache_put("handle:bob.test", "did:plc:bob", -1)
            .unwrap();
        assert!(db.identity_cache_get("handle:bob.test").unwrap().is_none());
        assert_eq!(db.cleanup_identity_cache().unwrap(), 1);
    }
}
