/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use tracing::{debug, info};

use crate::appview_db::{AppViewDb, CommunityRow};
use crate::error::{AppError, AppResult};
use crate::host_verify::verify_hosted_by;
use coves_protocol::{CommitEvent, CommunityProfileRecord, JetstreamEvent};

/// Indexes `social.coves.community.profile` events. The community's own
/// repository is authoritative for its profile, so the event repo DID is
/// the community DID by construction.
#[derive(Clone)]
pub struct CommunityConsumer {
    db: AppViewDb,
    verify_hosted_by: bool,
}

impl CommunityConsumer {
    pub fn new(db: AppViewDb, verify_hosted_by: bool) -> Self {
        Self {
            db,
            verify_hosted_by,
        }
    }

    pub fn handle(&self, event: &JetstreamEvent, commit: &CommitEvent) -> AppResult<()> {
        if commit.is_delete() {
            if self.db.mark_community_deleted(&event.did)? {
                info!("community {} deleted", event.did);
            }
            return Ok(());
        }

        let record = commit
            .record
            .as_ref()
            .ok_or_else(|| AppError::validation("commit has no record payload"))?;
        let profile: CommunityProfileRecord = serde_json::from_value(record.clone())?;
        validate_profile(&profile)?;
        if self.verify_hosted_by {
            verify_hosted_by(&profile.handle, &profile.hosted_by)?;
        }

        let row = CommunityRow {
            did: event.did.clone(),
            handle: profile.handle,
            name: profile.name,
            display_name: profile.display_name,
            description: profile.description,
            creator_did: profile.created_by,
            hosted_by: profile.hosted_by,
            visibility: default_if_empty(profile.visibility, "public"),
            moderation_type: default_if_empty(profile.moderation_type, "standard"),
            allow_external_discovery: profile.federation.allow_external_discovery,
            subscriber_count: 0,
            post_count: 0,
            deleted: false,
            created_at: profile.created_at,
        };
        self.db.upsert_community_profile(&row)?;
        debug!("indexed community profile {} ({})", row.did, row.handle);
        Ok(())
    }
}

fn validate_profile(profile: &CommunityProfileRecord) -> AppResult<()> {
    if profile.handle.trim().is_empty() {
        return Err(AppError::validation("community profile has no handle"));
    }
    if profile.name.trim().is_empty() {
        return Err(AppError::validation("community profile has no name"));
    }
    if !profile.created_by.starts_with("did:") {
        return Err(AppError::validation(
            "community profile createdBy must be a DID",
        ));
    }
    if profile.created_at.trim().is_empty() {
        return Err(AppError::validation("community profile has no createdAt"));
    }
    Ok(())
}

fn default_if_empty(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use serde_json::json;

    fn consumer(tag: &str, verify: bool) -> CommunityConsumer {
        let mut nonce = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let path = std::env::temp_dir().join(format!(
            "coves_community_consumer_{tag}_{}.db",
            hex::encode(nonce)
        ));
        CommunityConsumer::new(AppViewDb::open(path).unwrap(), verify)
    }

    fn profile_event(did: &str, operation: &str, record: Option<serde_json::Value>) -> (JetstreamEvent, CommitEvent) {
        let commit = CommitEvent {
            rev: "3kz".to_string(),
            operation: operation.to_string(),
            collection: "social.coves.community.profile".to_string(),
            rkey: "self".to_string(),
            cid: Some("bafyprofile".to_string()),
            record,
        };
        let event = JetstreamEvent {
            did: did.to_string(),
            time_us: 1,
            kind: "commit".to_string(),
            commit: Some(commit.clone()),
            identity: None,
            account: None,
        };
        (event, commit)
    }

    fn profile_record(handle: &str, hosted_by: &str) -> serde_json::Value {
        json!({
            "$type": "social.coves.community.profile",
            "handle": handle,
            "name": "gaming",
            "displayName": "Gaming",
            "description": "",
            "createdBy": "did:plc:creator",
            "hostedBy": hosted_by,
            "visibility": "public",
            "moderationType": "standard",
            "federation": {"allowExternalDiscovery": true},
            "createdAt": "2026-01-01T00:00:00Z"
        })
    }

    #[test]
    fn indexes_a_valid_profile() {
        let consumer = consumer("valid", true);
        let (event, commit) = profile_event(
            "did:plc:comm",
            "create",
            Some(profile_record("c-gaming.coves.social", "did:web:coves.social")),
        );
        consumer.handle(&event, &commit).unwrap();
        let row = consumer.db.get_community("did:plc:comm").unwrap().unwrap();
        assert_eq!(row.handle, "c-gaming.coves.social");
        assert!(row.allow_external_discovery);
    }

    #[test]
    fn rejects_spoofed_hosted_by() {
        let consumer = consumer("spoof", true);
        let (event, commit) = profile_event(
            "did:plc:comm",
            "create",
            Some(profile_record(
                "gaming.community.coves.social",
                "did:web:nintendo.com",
            )),
        );
        let err = consumer.handle(&event, &commit).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(consumer.db.get_community("did:plc:comm").unwrap().is_none());
    }

    #[test]
    fn hosted_by_check_can_be_disabled() {
        let consumer = consumer("no_verify", false);
        let (event, commit) = profile_event(
            "did:plc:comm",
            "create",
            Some(profile_record("gaming.elsewhere.net", "did:web:other.org")),
        );
        consumer.handle(&event, &commit).unwrap();
        assert!(consumer.db.get_community("did:plc:comm").unwrap().is_some());
    }

    #[test]
    fn delete_soft_deletes_the_community() {
        let consumer = consumer("delete", true);
        let (event, commit) = profile_event(
            "did:plc:comm",
            "create",
            Some(profile_record("c-gaming.coves.social", "did:web:coves.social")),
        );
        consumer.handle(&event, &commit).unwrap();

        let (event, commit) = profile_event("did:plc:comm", "delete", None);
        consumer.handle(&event, &commit).unwrap();
        let row = consumer.db.get_community("did:plc:comm").unwrap().unwrap();
        assert!(row.deleted);

        // Replay is harmless.
        consumer.handle(&event, &commit).unwrap();
    }

    #[test]
    fn rejects_malformed_records() {
        let consumer = consumer("malformed", true);
        let (event, commit) = profile_event("did:plc:comm", "create", Some(json!({"handle": 42})));
        assert!(consumer.handle(&event, &commit).is_err());

        let (event, commit) = profile_event("did:plc:comm", "create", None);
        assert!(consumer.handle(&event, &commit).is_err());
    }
}
