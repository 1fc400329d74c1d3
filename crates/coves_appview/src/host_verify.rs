/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::{AppError, AppResult};

// Multi-label public suffixes we accept community handles under. A handle
// like x.y.coves.co.uk must resolve to the registrable domain coves.co.uk,
// not co.uk.
const MULTI_LABEL_SUFFIXES: &[&str] = &["co.uk", "com.au", "org.uk", "ac.uk"];

/// Checks that a community profile's `hostedBy` DID matches the registrable
/// domain of its handle. `hostedBy` must be a `did:web:` DID.
pub fn verify_hosted_by(handle: &str, hosted_by: &str) -> AppResult<()> {
    let domain = hosted_by.strip_prefix("did:web:").ok_or_else(|| {
        AppError::validation(format!(
            "hostedBy must be a did:web DID, got {hosted_by}"
        ))
    })?;
    let domain = domain.trim().to_ascii_lowercase();
    if domain.is_empty() {
        return Err(AppError::validation("hostedBy domain is empty"));
    }

    let handle_domain = registrable_domain(handle)?;
    if handle_domain != domain {
        return Err(AppError::validation(format!(
            "hostedBy domain {domain} does not match handle domain {handle_domain}"
        )));
    }
    Ok(())
}

/// Extracts the registrable domain from a handle: the last two labels, or
/// the last three when the final two form a known multi-label public
/// suffix (co.uk and friends).
pub fn registrable_domain(handle: &str) -> AppResult<String> {
    let handle = handle.trim().trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = handle.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(AppError::validation(format!(
            "handle {handle} is not a valid DNS name"
        )));
    }

    let last_two = labels[labels.len() - 2..].join(".");
    if MULTI_LABEL_SUFFIXES.contains(&last_two.as_str()) {
        if labels.len() < 3 {
            return Err(AppError::validation(format!(
                "handle {handle} is a bare public suffix"
            )));
        }
        return Ok(labels[labels.len() - 3..].join("."));
    }
    Ok(last_two)
}
