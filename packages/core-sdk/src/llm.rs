use std::{error::Error as StdError, time::Duration};

use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::models::Message;

const REFERER_HEADER: &str = "http-referer";
const TITLE_HEADER: &str = "x-title";

/**
 * \brief 一次上游调用的失败结果。
 */
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /** \brief 没有可用的凭据或地址，未发起任何网络请求。 */
    #[error("Configuration error: {0}")]
    Config(String),
    /** \brief 连接、DNS、TLS 或超时等传输层失败。 */
    #[error("Transport error: {0}")]
    Transport(String),
    /** \brief 非 2xx 状态，或 2xx 但响应结构不符合预期。 */
    #[error("API Error ({status}): {body}")]
    Upstream { status: u16, body: String },
}

impl ChatError {
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Config(_) => "config",
            ChatError::Transport(_) => "transport",
            ChatError::Upstream { .. } => "upstream",
        }
    }
}

/**
 * \brief OpenAI 兼容的 chat/completions 客户端，带超时与来源描述头。
 */
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(timeout: Duration, referer: &str, title: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(v) = HeaderValue::from_str(referer) {
            headers.insert(HeaderName::from_static(REFERER_HEADER), v);
        }
        if let Ok(v) = HeaderValue::from_str(title) {
            headers.insert(HeaderName::from_static(TITLE_HEADER), v);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self { http, timeout })
    }

    /**
     * \brief 发起一次非流式补全调用，不重试。
     * \details 凭据为空时直接返回 Config，不触发网络 I/O。
     */
    pub async fn complete(
        &self,
        base_url: &str,
        credential: &str,
        model: &str,
        messages: &[Message],
        max_tokens: Option<u32>,
    ) -> Result<String, ChatError> {
        if credential.trim().is_empty() {
            return Err(ChatError::Config(
                "no API key configured; ask an administrator to add one".to_string(),
            ));
        }
        if base_url.trim().is_empty() {
            return Err(ChatError::Config("base_url is empty".to_string()));
        }

        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(max) = max_tokens {
            body["max_tokens"] = json!(max);
        }

        let resp = self
            .http
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", credential))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        let text = match resp.text().await {
            Ok(text) => text,
            Err(e) if status.is_success() => return Err(self.transport_error(e)),
            Err(e) => format!("<unreadable body: {}>", e),
        };

        if !status.is_success() {
            return Err(ChatError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|e| ChatError::Upstream {
            status: status.as_u16(),
            body: format!("response is not valid JSON ({}): {}", e, text),
        })?;
        extract_openai_content(&parsed).ok_or_else(|| ChatError::Upstream {
            status: status.as_u16(),
            body: format!("response missing choices[0].message.content: {}", text),
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> ChatError {
        if err.is_timeout() {
            return ChatError::Transport(format!(
                "upstream did not answer within {:?}",
                self.timeout
            ));
        }
        ChatError::Transport(error_chain(&err))
    }
}

fn error_chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

fn extract_openai_content(v: &Value) -> Option<String> {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
}
