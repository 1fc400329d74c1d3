/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const COLLECTION_COMMUNITY_PROFILE: &str = "social.coves.community.profile";
pub const COLLECTION_SUBSCRIPTION: &str = "social.coves.community.subscription";
pub const COLLECTION_COMMUNITY_BLOCK: &str = "social.coves.community.block";
pub const COLLECTION_POST: &str = "social.coves.community.post";
pub const COLLECTION_COMMENT: &str = "social.coves.community.comment";
pub const COLLECTION_VOTE: &str = "social.coves.feed.vote";
pub const COLLECTION_ACTOR_PROFILE: &str = "app.bsky.actor.profile";

/// One message from the Jetstream relay. `kind` is "commit", "identity"
/// or "account"; exactly one of the payload fields is set for each kind.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JetstreamEvent {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountEvent>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommitEvent {
    #[serde(default)]
    pub rev: String,
    pub operation: String,
    pub collection: String,
    pub rkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IdentityEvent {
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub time: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccountEvent {
    pub did: String,
    pub active: bool,
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub time: String,
}

impl CommitEvent {
    pub fn is_create(&self) -> bool {
        self.operation == "create"
    }

    pub fn is_update(&self) -> bool {
        self.operation == "update"
    }

    pub fn is_delete(&self) -> bool {
        self.operation == "delete"
    }
}

/// A strong reference to a specific version of a record: URI plus CID.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

/// Community profile record stored at
/// `at://<community-did>/social.coves.community.profile/self`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CommunityProfileRecord {
    #[serde(rename = "$type", default)]
    pub record_type: String,
    pub handle: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub created_by: String,
    pub hosted_by: String,
    #[serde(default)]
    pub visibility: String,
    #[serde(default)]
    pub moderation_type: String,
    #[serde(default)]
    pub federation: FederationConfig,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct FederationConfig {
    #[serde(default)]
    pub allow_external_discovery: bool,
}

/// Subscription record in the subscriber's repository. `subject` is the
/// community DID.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    #[serde(rename = "$type", default)]
    pub record_type: String,
    pub subject: String,
    #[serde(default)]
    pub content_visibility: Option<i64>,
    pub created_at: String,
}

/// Community block record in the blocking user's repository.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    #[serde(rename = "$type", default)]
    pub record_type: String,
    pub subject: String,
    pub created_at: String,
}

/// Post record in the community's repository. `author` is the DID of the
/// member the community wrote the post on behalf of.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(rename = "$type", default)]
    pub record_type: String,
    pub community: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub created_at: String,
}

/// Comment record in the commenter's repository. `reply.root` is always
/// the post; `reply.parent` is the post for top-level comments or another
/// comment for nested replies.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CommentRecord {
    #[serde(rename = "$type", default)]
    pub record_type: String,
    pub content: String,
    pub reply: CommentReplyRef,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommentReplyRef {
    pub root: StrongRef,
    pub parent: StrongRef,
}

/// Vote record in the voter's repository.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    #[serde(rename = "$type", default)]
    pub record_type: String,
    pub subject: StrongRef,
    pub direction: String,
    pub created_at: String,
}

/// Minimal `app.bsky.actor.profile` snapshot indexed into the AppView.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActorProfileRecord {
    #[serde(rename = "$type", default)]
    pub record_type: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Builds an at:// record URI from its parts.
pub fn record_uri(repo_did: &str, collection: &str, rkey: &str) -> String {
    format!("at://{repo_did}/{collection}/{rkey}")
}

/// Splits an at:// URI into (repo-did, collection, rkey). Returns None for
/// anything that does not have exactly those three path segments.
pub fn parse_record_uri(uri: &str) -> Option<(String, String, String)> {
    let rest = uri.strip_prefix("at://")?;
    let mut parts = rest.splitn(3, '/');
    let did = parts.next()?.to_string();
    let collection = parts.next()?.to_string();
    let rkey = parts.next()?.to_string();
    if did.is_empty() || collection.is_empty() || rkey.is_empty() || rkey.contains('/') {
        return None;
    }
    Some((did, collection, rkey))
}

/// Extracts the CID out of a blob reference value
/// (`{"$type":"blob","ref":{"$link":"..."},...}`).
pub fn blob_cid(value: &Value) -> Option<String> {
    if value.get("$type").and_then(|v| v.as_str()) != Some("blob") {
        return None;
    }
    value
        .get("ref")
        .and_then(|r| r.get("$link"))
        .and_then(|l| l.as_str())
        .map(|s| s.to_string())
}
