/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use coves_appview::appview_db::AppViewDb;
use coves_appview::cleanup::CleanupWorker;
use coves_appview::comment_service::CommentService;
use coves_appview::community_service::{CommunityService, CommunityUpdate};
use coves_appview::config::{parse_config_path, AppConfig};
use coves_appview::error::{AppError, ErrorKind};
use coves_appview::identity::IdentityResolver;
use coves_appview::jetstream::JetstreamSubscriber;
use coves_appview::oauth_refresh::OAuthRefresher;
use coves_appview::oauth_store::OAuthStore;
use coves_appview::pds_client::PdsClient;
use coves_appview::post_service::{CreatePost, PostService};
use coves_appview::profile_service::{ProfileService, ProfileUpdate};
use coves_appview::provisioner::{CommunityProvisioner, ProvisionRequest};
use coves_appview::seal::SessionSealer;
use coves_appview::vote_service::VoteService;

#[derive(Clone)]
struct AppState {
    sealer: SessionSealer,
    refresher: OAuthRefresher,
    identity: IdentityResolver,
    communities: CommunityService,
    posts: PostService,
    comments: CommentService,
    votes: VoteService,
    profiles: ProfileService,
}

struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let name = match self.0.kind() {
            ErrorKind::Validation => "InvalidRequest",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Unauthorized => "AuthRequired",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::Internal => "InternalError",
        };
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        }
        (status, Json(json!({"error": name, "message": self.0.to_string()}))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Unseals the bearer token and returns the caller's (did, session_id).
/// Every failure is the same `AuthRequired` to the client.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<(String, String), ApiError> {
    let token =
        bearer_token(headers).ok_or_else(|| AppError::unauthorized("missing bearer token"))?;
    let claims = state.sealer.unseal(token)?;
    Ok((claims.did, claims.sid))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    did: String,
    session_id: String,
}

async fn oauth_refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RefreshBody>,
) -> ApiResult {
    let refreshed = state
        .refresher
        .refresh(bearer_token(&headers), &body.did, &body.session_id)
        .await?;
    Ok(Json(json!({
        "token": refreshed.sealed_token,
        "did": refreshed.did,
        "handle": refreshed.handle,
        "expiresAt": refreshed.expires_at_ms,
    })))
}

#[derive(Deserialize)]
struct ResolveHandleQuery {
    handle: String,
}

async fn resolve_handle(
    State(state): State<AppState>,
    Query(query): Query<ResolveHandleQuery>,
) -> ApiResult {
    let did = state.identity.resolve_handle(&query.handle).await?;
    Ok(Json(json!({"did": did})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCommunityBody {
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_visibility")]
    visibility: String,
    #[serde(default = "default_moderation")]
    moderation_type: String,
    #[serde(default = "default_true")]
    allow_external_discovery: bool,
}

fn default_visibility() -> String {
    "public".to_string()
}

fn default_moderation() -> String {
    "standard".to_string()
}

fn default_true() -> bool {
    true
}

async fn create_community(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateCommunityBody>,
) -> ApiResult {
    let (did, _) = authenticate(&state, &headers)?;
    let req = ProvisionRequest {
        name: body.name,
        display_name: body.display_name,
        description: body.description,
        creator_did: did.clone(),
        visibility: body.visibility,
        moderation_type: body.moderation_type,
        allow_external_discovery: body.allow_external_discovery,
    };
    let provisioned = state.communities.create(&did, &req).await?;
    Ok(Json(json!({
        "did": provisioned.did,
        "handle": provisioned.handle,
        "uri": provisioned.profile_uri,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCommunityBody {
    community_did: String,
    display_name: Option<String>,
    description: Option<String>,
    visibility: Option<String>,
    moderation_type: Option<String>,
    allow_external_discovery: Option<bool>,
}

async fn update_community(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UpdateCommunityBody>,
) -> ApiResult {
    let (did, _) = authenticate(&state, &headers)?;
    let update = CommunityUpdate {
        display_name: body.display_name,
        description: body.description,
        visibility: body.visibility,
        moderation_type: body.moderation_type,
        allow_external_discovery: body.allow_external_discovery,
    };
    let (uri, cid) = state
        .communities
        .update(&did, &body.community_did, &update)
        .await?;
    Ok(Json(json!({"uri": uri, "cid": cid})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommunityTargetBody {
    community_did: String,
    content_visibility: Option<i64>,
}

async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CommunityTargetBody>,
) -> ApiResult {
    let (did, sid) = authenticate(&state, &headers)?;
    let uri = state
        .communities
        .subscribe(&did, &sid, &body.community_did, body.content_visibility)
        .await?;
    Ok(Json(json!({"uri": uri})))
}

async fn unsubscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CommunityTargetBody>,
) -> ApiResult {
    let (did, sid) = authenticate(&state, &headers)?;
    state
        .communities
        .unsubscribe(&did, &sid, &body.community_did)
        .await?;
    Ok(Json(json!({})))
}

async fn block_community(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CommunityTargetBody>,
) -> ApiResult {
    let (did, sid) = authenticate(&state, &headers)?;
    let uri = state
        .communities
        .block(&did, &sid, &body.community_did)
        .await?;
    Ok(Json(json!({"uri": uri})))
}

async fn unblock_community(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CommunityTargetBody>,
) -> ApiResult {
    let (did, sid) = authenticate(&state, &headers)?;
    state
        .communities
        .unblock(&did, &sid, &body.community_did)
        .await?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePostBody {
    community_did: String,
    title: Option<String>,
    content: Option<String>,
}

async fn create_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreatePostBody>,
) -> ApiResult {
    let (did, _) = authenticate(&state, &headers)?;
    let req = CreatePost {
        community_did: body.community_did,
        title: body.title,
        content: body.content,
    };
    let (uri, cid) = state.posts.create(&did, &req).await?;
    Ok(Json(json!({"uri": uri, "cid": cid})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePostBody {
    post_uri: String,
    title: Option<String>,
    content: Option<String>,
}

async fn update_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UpdatePostBody>,
) -> ApiResult {
    let (did, _) = authenticate(&state, &headers)?;
    let (uri, cid) = state
        .posts
        .update(
            &did,
            &body.post_uri,
            body.title.as_deref(),
            body.content.as_deref(),
        )
        .await?;
    Ok(Json(json!({"uri": uri, "cid": cid})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostTargetBody {
    post_uri: String,
}

async fn delete_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PostTargetBody>,
) -> ApiResult {
    let (did, _) = authenticate(&state, &headers)?;
    state.posts.delete(&did, &body.post_uri).await?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCommentBody {
    post_uri: String,
    parent_uri: Option<String>,
    content: String,
}

async fn create_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateCommentBody>,
) -> ApiResult {
    let (did, sid) = authenticate(&state, &headers)?;
    let (uri, cid) = state
        .comments
        .create(
            &did,
            &sid,
            &body.post_uri,
            body.parent_uri.as_deref(),
            &body.content,
        )
        .await?;
    Ok(Json(json!({"uri": uri, "cid": cid})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCommentBody {
    comment_uri: String,
    content: String,
}

async fn update_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UpdateCommentBody>,
) -> ApiResult {
    let (did, sid) = authenticate(&state, &headers)?;
    let (uri, cid) = state
        .comments
        .update(&did, &sid, &body.comment_uri, &body.content)
        .await?;
    Ok(Json(json!({"uri": uri, "cid": cid})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentTargetBody {
    comment_uri: String,
}

async fn delete_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CommentTargetBody>,
) -> ApiResult {
    let (did, sid) = authenticate(&state, &headers)?;
    state.comments.delete(&did, &sid, &body.comment_uri).await?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteBody {
    subject_uri: String,
    direction: String,
}

async fn cast_vote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<VoteBody>,
) -> ApiResult {
    let (did, sid) = authenticate(&state, &headers)?;
    let uri = state
        .votes
        .vote(&did, &sid, &body.subject_uri, &body.direction)
        .await?;
    Ok(Json(json!({"uri": uri})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnvoteBody {
    subject_uri: String,
}

async fn retract_vote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UnvoteBody>,
) -> ApiResult {
    let (did, sid) = authenticate(&state, &headers)?;
    state.votes.unvote(&did, &sid, &body.subject_uri).await?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProfileBody {
    display_name: Option<String>,
    description: Option<String>,
    /// Base64 avatar bytes plus their mime type; both or neither.
    avatar: Option<String>,
    avatar_mime: Option<String>,
}

async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UpdateProfileBody>,
) -> ApiResult {
    let (did, sid) = authenticate(&state, &headers)?;
    let avatar = match (body.avatar, body.avatar_mime) {
        (Some(data), Some(mime)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| AppError::validation(format!("avatar is not base64: {e}")))?;
            Some((bytes, mime))
        }
        (None, None) => None,
        _ => {
            return Err(AppError::validation("avatar and avatarMime go together").into());
        }
    };
    let update = ProfileUpdate {
        display_name: body.display_name,
        description: body.description,
        avatar,
    };
    let (uri, cid) = state.profiles.update(&did, &sid, &update).await?;
    Ok(Json(json!({"uri": uri, "cid": cid})))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/oauth/refresh", post(oauth_refresh))
        .route(
            "/xrpc/com.atproto.identity.resolveHandle",
            get(resolve_handle),
        )
        .route("/xrpc/social.coves.community.create", post(create_community))
        .route("/xrpc/social.coves.community.update", post(update_community))
        .route("/xrpc/social.coves.community.subscribe", post(subscribe))
        .route("/xrpc/social.coves.community.unsubscribe", post(unsubscribe))
        .route("/xrpc/social.coves.community.block", post(block_community))
        .route("/xrpc/social.coves.community.unblock", post(unblock_community))
        .route("/xrpc/social.coves.post.create", post(create_post))
        .route("/xrpc/social.coves.post.update", post(update_post))
        .route("/xrpc/social.coves.post.delete", post(delete_post))
        .route("/xrpc/social.coves.comment.create", post(create_comment))
        .route("/xrpc/social.coves.comment.update", post(update_comment))
        .route("/xrpc/social.coves.comment.delete", post(delete_comment))
        .route("/xrpc/social.coves.feed.vote", post(cast_vote))
        .route("/xrpc/social.coves.feed.unvote", post(retract_vote))
        .route("/xrpc/app.bsky.actor.profile", post(update_profile))
        .route("/xrpc/social.coves.actor.updateProfile", post(update_profile))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = parse_config_path()?;
    let cfg = AppConfig::load(&config_path)?;
    info!("starting appview on {}", cfg.bind);

    let db = AppViewDb::open(&cfg.database_path)?;
    let http = reqwest::Client::new();
    let sealer = SessionSealer::from_hex(&cfg.seal_key)?;
    let store = OAuthStore::new(db.clone());
    let pds = PdsClient::new(http.clone(), &cfg.pds_url);
    let provisioner = CommunityProvisioner::new(
        db.clone(),
        pds,
        cfg.instance_domain.clone(),
        cfg.instance_did.clone(),
        cfg.admin_email_domain.clone(),
    );
    let client_id = format!("https://{}/oauth/client-metadata.json", cfg.instance_domain);
    let refresher = OAuthRefresher::new(
        store.clone(),
        sealer.clone(),
        http.clone(),
        client_id,
        cfg.session_ttl_secs,
    );
    let identity = IdentityResolver::new(
        db.clone(),
        http.clone(),
        cfg.pds_url.clone(),
        cfg.identity_cache_ttl_secs,
    );

    let state = AppState {
        sealer,
        refresher,
        identity,
        communities: CommunityService::new(
            db.clone(),
            store.clone(),
            http.clone(),
            provisioner.clone(),
        ),
        posts: PostService::new(db.clone(), http.clone()),
        comments: CommentService::new(db.clone(), store.clone(), http.clone()),
        votes: VoteService::new(db.clone(), store.clone(), http.clone()),
        profiles: ProfileService::new(store.clone(), http.clone()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("ctrl-c handler failed: {e}");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let subscriber = JetstreamSubscriber::new(
        db.clone(),
        cfg.jetstream_url.clone(),
        cfg.consumer_failure_policy,
        cfg.verify_hosted_by,
    );
    let jetstream_task = tokio::spawn(subscriber.run(shutdown_rx.clone()));

    let cleanup = CleanupWorker::new(db, store, cfg.cleanup_interval_secs);
    let cleanup_task = tokio::spawn(cleanup.run(shutdown_rx.clone()));

    let listener = tokio::net::TcpListener::bind(&cfg.bind).await?;
    let mut serve_shutdown = shutdown_rx;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await?;

    info!("shutting down");
    let _ = tokio::join!(jetstream_task, cleanup_task);
    Ok(())
}
