//! Classification of failed submissions.

use std::{sync::OnceLock, time::Duration};

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

pub const NO_RESPONSE_MESSAGE: &str =
    "サーバーからの応答がありません。ネットワーク設定を確認してください。";

#[derive(Debug, Error)]
pub enum SubmitError {
    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {detail}")]
    Http {
        status: u16,
        reason: Option<String>,
        detail: String,
        retry_after: Option<u64>,
    },
    /// The request went out but nothing came back.
    #[error("no response from server: {0}")]
    NoResponse(String),
    /// Raised before the request could be dispatched, or while handling its result.
    #[error("{0}")]
    Local(String),
}

impl SubmitError {
    /// Wait the server asked for: the `Retry-After` header first, then the
    /// `あと N 秒` hint in the detail text.
    pub fn suggested_wait(&self) -> Option<Duration> {
        match self {
            SubmitError::Http { retry_after: Some(secs), .. } => Some(Duration::from_secs(*secs)),
            SubmitError::Http { detail, .. } => wait_hint(detail).map(Duration::from_secs),
            _ => None,
        }
    }

    /// Text written to the log sink's stderr block.
    pub fn log_message(&self) -> String {
        match self {
            SubmitError::Http { status, reason, detail, .. } => {
                let mut text = format!("HTTP {} {}", status, reason.as_deref().unwrap_or(""))
                    .trim()
                    .to_string();
                if !detail.is_empty() {
                    text.push('\n');
                    text.push_str(detail);
                }
                text
            }
            SubmitError::NoResponse(_) => NO_RESPONSE_MESSAGE.to_string(),
            SubmitError::Local(message) => format!("実行処理中のエラー: {}", message),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SubmitError::Http { .. } => "http",
            SubmitError::NoResponse(_) => "no_response",
            SubmitError::Local(_) => "local",
        }
    }
}

/// Parses `あと 7 秒` / `あと7秒` out of a free-text detail.
pub fn wait_hint(detail: &str) -> Option<u64> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PATTERN
        .get_or_init(|| Regex::new(r"あと\s*(\d+)\s*秒").ok())
        .as_ref()?;
    re.captures(detail)?.get(1)?.as_str().parse().ok()
}

/// `detail`, else `message`, else the serialized body.
pub fn extract_detail(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => {
            for key in ["detail", "message"] {
                match value.get(key) {
                    Some(Value::String(s)) if !s.is_empty() => return s.clone(),
                    Some(Value::Null) | None => {}
                    Some(other) if !other.is_string() => return other.to_string(),
                    Some(_) => {}
                }
            }
            if value.is_null() { String::new() } else { value.to_string() }
        }
        Err(_) => body.trim().to_string(),
    }
}

/// Maps a transport failure from reqwest onto the taxonomy.
pub fn classify_transport(err: reqwest::Error) -> SubmitError {
    if err.is_builder() {
        SubmitError::Local(err.to_string())
    } else if err.is_decode() {
        SubmitError::Local(format!("invalid response body: {}", err))
    } else {
        SubmitError::NoResponse(err.to_string())
    }
}
