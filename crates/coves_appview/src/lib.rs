/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod appview_db;
pub mod cleanup;
pub mod comment_consumer;
pub mod comment_service;
pub mod community_consumer;
pub mod community_service;
pub mod config;
pub mod dpop;
pub mod error;
pub mod host_verify;
pub mod identity;
pub mod jetstream;
pub mod oauth_refresh;
pub mod oauth_store;
pub mod pds_client;
pub mod post_consumer;
pub mod post_service;
pub mod profile_service;
pub mod provisioner;
pub mod repo_auth;
pub mod seal;
pub mod tid;
pub mod user_consumer;
pub mod vote_consumer;
pub mod vote_service;
