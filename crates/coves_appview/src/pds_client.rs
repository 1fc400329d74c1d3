/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::dpop::DpopKey;
use crate::error::{AppError, AppResult};

/// How a PDS call authenticates. DPoP carries the server nonce in place so
/// a `use_dpop_nonce` replay updates it for the caller to persist.
pub enum PdsAuth {
    None,
    Bearer(String),
    Dpop {
        access_token: String,
        key: DpopKey,
        nonce: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdsSession {
    pub did: String,
    #[serde(default)]
    pub handle: String,
    pub access_jwt: String,
    pub refresh_jwt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordRef {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchedRecord {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub value: Value,
}

/// XRPC client against one PDS base URL. Writes are retried at most once
/// (transport and 5xx only) so a command stays close to at-most-once.
#[derive(Clone)]
pub struct PdsClient {
    http: reqwest::Client,
    base_url: String,
}

impl PdsClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> AppResult<()> {
        let url = format!("{}/xrpc/_health", self.base_url);
        let resp = send_retry_once(|| Ok(self.http.get(&url))).await?;
        if !resp.status().is_success() {
            return Err(AppError::unavailable(format!(
                "pds health returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn create_session(&self, identifier: &str, password: &str) -> AppResult<PdsSession> {
        let body = json!({"identifier": identifier, "password": password});
        let resp = self
            .xrpc_post("com.atproto.server.createSession", &body, &mut PdsAuth::None)
            .await?;
        Ok(resp)
    }

    pub async fn create_account(
        &self,
        handle: &str,
        email: &str,
        password: &str,
        invite_code: Option<&str>,
    ) -> AppResult<PdsSession> {
        let mut body = json!({"handle": handle, "email": email, "password": password});
        if let Some(code) = invite_code {
            body["inviteCode"] = json!(code);
        }
        let resp = self
            .xrpc_post("com.atproto.server.createAccount", &body, &mut PdsAuth::None)
            .await?;
        Ok(resp)
    }

    pub async fn create_record(
        &self,
        auth: &mut PdsAuth,
        repo: &str,
        collection: &str,
        rkey: Option<&str>,
        record: &Value,
    ) -> AppResult<RecordRef> {
        let mut body = json!({"repo": repo, "collection": collection, "record": record});
        if let Some(rkey) = rkey {
            body["rkey"] = json!(rkey);
        }
        self.xrpc_post("com.atproto.repo.createRecord", &body, auth)
            .await
    }

    /// Replaces a record, optionally compare-and-swapping on the current
    /// CID. A swap failure surfaces as `Conflict`.
    pub async fn put_record(
        &self,
        auth: &mut PdsAuth,
        repo: &str,
        collection: &str,
        rkey: &str,
        record: &Value,
        swap_record: Option<&str>,
    ) -> AppResult<RecordRef> {
        let mut body = json!({
            "repo": repo,
            "collection": collection,
            "rkey": rkey,
            "record": record,
        });
        if let Some(cid) = swap_record {
            body["swapRecord"] = json!(cid);
        }
        self.xrpc_post("com.atproto.repo.putRecord", &body, auth)
            .await
    }

    pub async fn delete_record(
        &self,
        auth: &mut PdsAuth,
        repo: &str,
        collection: &str,
        rkey: &str,
        swap_record: Option<&str>,
    ) -> AppResult<()> {
        let mut body = json!({"repo": repo, "collection": collection, "rkey": rkey});
        if let Some(cid) = swap_record {
            body["swapRecord"] = json!(cid);
        }
        let _: Value = self
            .xrpc_post("com.atproto.repo.deleteRecord", &body, auth)
            .await?;
        Ok(())
    }

    pub async fn get_record(
        &self,
        repo: &str,
        collection: &str,
        rkey: &str,
    ) -> AppResult<FetchedRecord> {
        let url = format!(
            "{}/xrpc/com.atproto.repo.getRecord?repo={}&collection={}&rkey={}",
            self.base_url,
            urlencoding::encode(repo),
            urlencoding::encode(collection),
            urlencoding::encode(rkey)
        );
        let resp = send_retry_once(|| Ok(self.http.get(&url))).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_pds_error(status, &body));
        }
        Ok(resp.json().await?)
    }

    pub async fn upload_blob(
        &self,
        auth: &mut PdsAuth,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> AppResult<Value> {
        let url = format!("{}/xrpc/com.atproto.repo.uploadBlob", self.base_url);
        let htu = url.clone();
        let build = |auth: &PdsAuth| -> AppResult<RequestBuilder> {
            let req = self
                .http
                .post(&url)
                .header("content-type", mime_type)
                .body(bytes.clone());
            apply_auth(req, auth, "POST", &htu)
        };
        let resp = self.send_with_nonce_replay(build, auth).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_pds_error(status, &body));
        }
        let out: Value = resp.json().await?;
        out.get("blob")
            .cloned()
            .ok_or_else(|| AppError::unavailable("uploadBlob returned no blob"))
    }

    async fn xrpc_post<T: serde::de::DeserializeOwned>(
        &self,
        nsid: &str,
        body: &Value,
        auth: &mut PdsAuth,
    ) -> AppResult<T> {
        let url = format!("{}/xrpc/{nsid}", self.base_url);
        let htu = url.clone();
        let build = |auth: &PdsAuth| -> AppResult<RequestBuilder> {
            let req = self.http.post(&url).json(body);
            apply_auth(req, auth, "POST", &htu)
        };
        let resp = self.send_with_nonce_replay(build, auth).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            debug!("{nsid} failed: {status} {text}");
            return Err(map_pds_error(status, &text));
        }
        Ok(resp.json().await?)
    }

    /// Sends a request, replaying once with the server-issued DPoP nonce
    /// when the PDS answers `use_dpop_nonce`. The refreshed nonce is
    /// written back into `auth` for the caller to persist.
    async fn send_with_nonce_replay<F>(
        &self,
        build: F,
        auth: &mut PdsAuth,
    ) -> AppResult<reqwest::Response>
    where
        F: Fn(&PdsAuth) -> AppResult<RequestBuilder>,
    {
        let resp = send_retry_once(|| build(auth)).await?;

        if let PdsAuth::Dpop { nonce, .. } = auth {
            if resp.status() == StatusCode::UNAUTHORIZED {
                let server_nonce = resp
                    .headers()
                    .get("dpop-nonce")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                if let Some(server_nonce) = server_nonce {
                    let body = resp.text().await.unwrap_or_default();
                    if is_use_dpop_nonce(&body) {
                        *nonce = Some(server_nonce);
                        let retry = build(auth)?
                            .send()
                            .await
                            .map_err(|e| AppError::unavailable(format!("pds request: {e}")))?;
                        return Ok(retry);
                    }
                    return Err(map_pds_error(StatusCode::UNAUTHORIZED, &body));
                }
            }
        }
        Ok(resp)
    }
}

/// At most one retry, on transport errors, 429 and 5xx only. Each attempt
/// builds a fresh request so DPoP proofs carry a new jti. This is the only
/// retry in the crate; commands stay close to at-most-once.
pub(crate) async fn send_retry_once<F>(build: F) -> AppResult<reqwest::Response>
where
    F: Fn() -> AppResult<RequestBuilder>,
{
    match build()?.send().await {
        Ok(resp) if !transient_status(resp.status()) => return Ok(resp),
        Ok(_) | Err(_) => {}
    }
    let jitter_ms: u64 = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=200);
    tokio::time::sleep(std::time::Duration::from_millis(200 + jitter_ms)).await;
    build()?
        .send()
        .await
        .map_err(|e| AppError::unavailable(format!("pds request: {e}")))
}

fn transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn apply_auth(req: RequestBuilder, auth: &PdsAuth, htm: &str, htu: &str) -> AppResult<RequestBuilder> {
    match auth {
        PdsAuth::None => Ok(req),
        PdsAuth::Bearer(jwt) => Ok(req.header("authorization", format!("Bearer {jwt}"))),
        PdsAuth::Dpop {
            access_token,
            key,
            nonce,
        } => {
            let proof = key.proof(htm, htu, nonce.as_deref(), Some(access_token))?;
            Ok(req
                .header("authorization", format!("DPoP {access_token}"))
                .header("dpop", proof))
        }
    }
}

fn is_use_dpop_nonce(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .is_some_and(|e| e == "use_dpop_nonce")
}

/// Maps a PDS error response onto the uniform taxonomy. Swap failures are
/// reported by the PDS as 400 `InvalidSwap` but mean a concurrent write,
/// so they become `Conflict`.
fn map_pds_error(status: StatusCode, body: &str) -> AppError {
    let (error, message) = parse_xrpc_error(body);
    let detail = if message.is_empty() {
        error.clone()
    } else {
        format!("{error}: {message}")
    };
    match status.as_u16() {
        400 if error == "InvalidSwap" => AppError::conflict(detail),
        400 => AppError::validation(detail),
        401 => AppError::unauthorized(detail),
        403 => AppError::forbidden(detail),
        404 => AppError::not_found(detail),
        409 => AppError::conflict(detail),
        _ => AppError::unavailable(format!("pds returned {status}: {detail}")),
    }
}

fn parse_xrpc_error(body: &str) -> (String, String) {
    match serde_json::from_str::<Value>(body) {
        Ok(v) => (
            v.get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("")
                .to_string(),
            v.get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("")
                .to_string(),
        ),
        Err(_) => (String::new(), body.chars().take(200).collect()),
    }
}
