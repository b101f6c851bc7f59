// src/gateway.rs
//! Request gateway: the one place HTTP GETs leave the dashboard.
//!
//! [`HttpGateway`] attaches a bearer token to authenticated calls and, on a
//! `401`, refreshes the token exactly once and retries exactly once before
//! handing the response back to the caller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// Whether a request goes out with the bearer credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Authenticated,
    Public,
}

/// Status + raw body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON, treating any non-2xx status as an error.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.is_success() {
            bail!("HTTP {}", self.status);
        }
        let trimmed = self.body.trim();
        serde_json::from_str(trimmed).with_context(|| {
            let preview: String = trimmed.chars().take(120).collect();
            format!("parse JSON body failed, body: {preview}")
        })
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn get(&self, url: &str, access: Access) -> Result<HttpReply>;

    async fn get_json(&self, url: &str, access: Access) -> Result<Value> {
        self.get(url, access).await?.json()
    }
}

/// Supplies and renews the bearer credential. Issuing tokens is not our job.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Option<String>;
    async fn refresh(&self) -> Result<()>;
}

/// A fixed token (e.g. from `DASHBOARD_ACCESS_TOKEN`). Cannot be refreshed.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Option<String> {
        Some(self.0.clone())
    }

    async fn refresh(&self) -> Result<()> {
        Err(anyhow!("static access token cannot be refreshed"))
    }
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    #[serde(alias = "accessToken")]
    access_token: String,
}

/// Access token renewed by POSTing a refresh token to `refresh_url`.
pub struct RefreshingToken {
    client: Client,
    refresh_url: String,
    refresh_token: String,
    current: RwLock<Option<String>>,
}

impl RefreshingToken {
    pub fn new(refresh_url: String, refresh_token: String, initial: Option<String>) -> Self {
        Self {
            client: Client::new(),
            refresh_url,
            refresh_token,
            current: RwLock::new(initial),
        }
    }
}

#[async_trait]
impl TokenSource for RefreshingToken {
    async fn access_token(&self) -> Option<String> {
        self.current.read().await.clone()
    }

    async fn refresh(&self) -> Result<()> {
        let resp = self
            .client
            .post(&self.refresh_url)
            .json(&serde_json::json!({ "refreshToken": self.refresh_token }))
            .send()
            .await
            .context("token refresh request")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("token refresh rejected with status {status}");
        }
        let reply: TokenReply = resp.json().await.context("token refresh body")?;
        *self.current.write().await = Some(reply.access_token);
        tracing::debug!(target: "gateway", "access token refreshed");
        Ok(())
    }
}

#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    tokens: Option<Arc<dyn TokenSource>>,
    timeout: Option<Duration>,
}

impl HttpGateway {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            tokens: None,
            timeout: None,
        }
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Per-request timeout. Without one, the transport defaults apply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn send(&self, url: &str, bearer: Option<String>) -> Result<HttpReply> {
        let mut req = self.client.get(url);
        if let Some(token) = bearer {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(t) = self.timeout {
            req = req.timeout(t);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .with_context(|| format!("read body of {url}"))?;
        Ok(HttpReply { status, body })
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn get(&self, url: &str, access: Access) -> Result<HttpReply> {
        let tokens = match (access, &self.tokens) {
            (Access::Authenticated, Some(tokens)) => tokens,
            _ => return self.send(url, None).await,
        };

        let reply = self.send(url, tokens.access_token().await).await?;
        if reply.status != StatusCode::UNAUTHORIZED.as_u16() {
            return Ok(reply);
        }

        // Single refresh-and-retry; a second 401 goes back to the caller as-is.
        match tokens.refresh().await {
            Ok(()) => self.send(url, tokens.access_token().await).await,
            Err(e) => {
                tracing::warn!(target: "gateway", url, error = %format!("{e:#}"), "token refresh failed");
                Ok(reply)
            }
        }
    }
}
