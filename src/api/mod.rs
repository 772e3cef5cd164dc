//! Reqwest-based client for the sandbox server (execute, auth, history).

pub mod auth;
pub mod error;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, Response};
use serde::Deserialize;

use crate::{
    config::Config,
    execution::{ExecutionResult, HistoryEntry},
};

pub use auth::TokenStore;
pub use error::SubmitError;

/// The remote execution endpoint as seen by the orchestrator.
#[async_trait]
pub trait ExecuteEndpoint: Send + Sync {
    async fn execute(&self, code: &str) -> Result<ExecutionResult, SubmitError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    user: UserInfo,
}

#[derive(Debug, Deserialize)]
struct MeResponse {
    user: UserInfo,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(cfg.request_timeout())
            .build()
            .context("building HTTP client")?;
        let token = TokenStore::from_config(cfg).load();
        Ok(Self::new(http, cfg.base_url(), token))
    }

    pub fn new(http: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url, token }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(String, UserInfo)> {
        let resp = self
            .http
            .post(self.url("/api/auth/login"))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .context("failed to send login request")?;
        let resp = ensure_success(resp, "login").await?;
        let body: LoginResponse = resp.json().await.context("decoding login response")?;
        Ok((body.token, body.user))
    }

    pub async fn logout(&self) -> Result<()> {
        let resp = self
            .with_auth(self.http.post(self.url("/api/auth/logout")))
            .send()
            .await
            .context("failed to send logout request")?;
        ensure_success(resp, "logout").await?;
        Ok(())
    }

    pub async fn me(&self) -> Result<UserInfo> {
        let resp = self
            .with_auth(self.http.get(self.url("/api/auth/me")))
            .send()
            .await
            .context("failed to send auth request")?;
        let resp = ensure_success(resp, "auth").await?;
        let body: MeResponse = resp.json().await.context("decoding user")?;
        Ok(body.user)
    }

    pub async fn history(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        let limit = limit.clamp(1, 100);
        let resp = self
            .with_auth(self.http.get(self.url("/api/programs/history")))
            .query(&[("limit", limit)])
            .send()
            .await
            .context("failed to send history request")?;
        let resp = ensure_success(resp, "history").await?;
        let body: HistoryResponse = resp.json().await.context("decoding history")?;
        Ok(body.history)
    }
}

#[async_trait]
impl ExecuteEndpoint for ApiClient {
    async fn execute(&self, code: &str) -> Result<ExecutionResult, SubmitError> {
        if code.trim().is_empty() {
            return Err(SubmitError::Local("コードが空です".into()));
        }

        let resp = self
            .with_auth(self.http.post(self.url("/api/execute")))
            .json(&serde_json::json!({ "code": code }))
            .send()
            .await
            .map_err(error::classify_transport)?;

        let status = resp.status();
        if status.is_success() {
            return resp.json::<ExecutionResult>().await.map_err(error::classify_transport);
        }

        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|raw| raw.trim().parse::<u64>().ok());
        let text = resp.text().await.unwrap_or_default();
        Err(SubmitError::Http {
            status: status.as_u16(),
            reason: status.canonical_reason().map(str::to_string),
            detail: error::extract_detail(&text),
            retry_after,
        })
    }
}

async fn ensure_success(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let detail = error::extract_detail(&text);
    if detail.is_empty() {
        bail!("{} failed: {}", what, status)
    }
    bail!("{} failed: {} - {}", what, status, detail)
}
