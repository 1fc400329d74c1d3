/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::appview_db::{AppViewDb, CommunityCredentials, CommunityRow};
use crate::error::{AppError, AppResult};
use crate::pds_client::{PdsAuth, PdsClient};
use coves_protocol::COLLECTION_COMMUNITY_PROFILE;

const MAX_LABEL_LEN: usize = 63;
const MAX_HANDLE_LEN: usize = 253;
const PASSWORD_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub creator_did: String,
    pub visibility: String,
    pub moderation_type: String,
    pub allow_external_discovery: bool,
}

#[derive(Debug, Clone)]
pub struct ProvisionedCommunity {
    pub did: String,
    pub handle: String,
    pub profile_uri: String,
}

/// Creates community accounts on this instance's PDS: one atProto account
/// per community, handle minted under `communities.<instance-domain>`,
/// credentials held by the AppView so it can write on the community's
/// behalf.
#[derive(Clone)]
pub struct CommunityProvisioner {
    db: AppViewDb,
    pds: PdsClient,
    instance_domain: String,
    instance_did: String,
    email_domain: String,
}

impl CommunityProvisioner {
    pub fn new(
        db: AppViewDb,
        pds: PdsClient,
        instance_domain: String,
        instance_did: String,
        email_domain: Option<String>,
    ) -> Self {
        let email_domain = email_domain.unwrap_or_else(|| instance_domain.clone());
        Self {
            db,
            pds,
            instance_domain,
            instance_did,
            email_domain,
        }
    }

    pub async fn provision(&self, req: &ProvisionRequest) -> AppResult<ProvisionedCommunity> {
        let name = req.name.trim().to_ascii_lowercase();
        validate_name(&name)?;
        let handle = community_handle(&name, &self.instance_domain)?;

        if self.db.get_community_by_handle(&handle)?.is_some() {
            return Err(AppError::conflict(format!(
                "community handle {handle} is taken"
            )));
        }
        if !req.creator_did.starts_with("did:") {
            return Err(AppError::validation("creator must be a DID"));
        }

        let email = format!("community-{name}@{}", self.email_domain);
        let password = generate_password();

        let session = self
            .pds
            .create_account(&handle, &email, &password, None)
            .await?;
        info!("provisioned community account {} ({handle})", session.did);

        // From here on a failure leaves a PDS account without an indexed
        // community; the handle stays reserved on the PDS until an operator
        // reconciles it.
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| AppError::internal(format!("format timestamp: {e}")))?;
        let record = json!({
            "$type": COLLECTION_COMMUNITY_PROFILE,
            "handle": handle,
            "name": name,
            "displayName": req.display_name,
            "description": req.description,
            "createdBy": req.creator_did,
            "hostedBy": self.instance_did,
            "visibility": req.visibility,
            "moderationType": req.moderation_type,
            "federation": {"allowExternalDiscovery": req.allow_external_discovery},
            "createdAt": created_at,
        });

        let mut auth = PdsAuth::Bearer(session.access_jwt.clone());
        let profile = self
            .pds
            .create_record(
                &mut auth,
                &session.did,
                COLLECTION_COMMUNITY_PROFILE,
                Some("self"),
                &record,
            )
            .await
            .map_err(|e| {
                warn!("profile write failed after account creation for {handle}: {e}");
                e
            })?;

        let row = CommunityRow {
            did: session.did.clone(),
            handle: handle.clone(),
            name,
            display_name: req.display_name.clone(),
            description: req.description.clone(),
            creator_did: req.creator_did.clone(),
            hosted_by: self.instance_did.clone(),
            visibility: req.visibility.clone(),
            moderation_type: req.moderation_type.clone(),
            allow_external_discovery: req.allow_external_discovery,
            subscriber_count: 0,
            post_count: 0,
            deleted: false,
            created_at,
        };
        let creds = CommunityCredentials {
            pds_url: self.pds.base_url().to_string(),
            email,
            password,
        };
        self.db.insert_community(&row, &creds)?;

        Ok(ProvisionedCommunity {
            did: session.did,
            handle,
            profile_uri: profile.uri,
        })
    }
}

/// Community names become the leftmost DNS label of the handle, so the
/// grammar is conservative: lowercase alphanumerics with interior hyphens.
pub fn validate_name(name: &str) -> AppResult<()> {
    if name.is_empty() || name.len() > MAX_LABEL_LEN {
        return Err(AppError::validation(
            "community name must be 1-63 characters",
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(AppError::validation(
            "community name cannot start or end with a hyphen",
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(AppError::validation(
            "community name may only contain a-z, 0-9 and hyphens",
        ));
    }
    Ok(())
}

pub fn community_handle(name: &str, instance_domain: &str) -> AppResult<String> {
    let handle = format!("{name}.communities.{instance_domain}");
    if handle.len() > MAX_HANDLE_LEN {
        return Err(AppError::validation(format!(
            "handle {handle} exceeds {MAX_HANDLE_LEN} characters"
        )));
    }
    Ok(handle)
}

fn generate_password() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}
