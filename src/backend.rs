// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP client for the managed backend server.
//!
//! Two calls: a short-timeout heartbeat probe and a JSON passthrough that
//! forwards a named method with its argument array. The passthrough never
//! fails; errors are folded into an `{error, message, data}` reply the UI
//! already knows how to render.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::BridgeError;

/// Connect timeout for every backend request.
const CONNECTION_TIMEOUT_SECS: u64 = 5;

/// Timeout for passthrough API calls.
const CALL_TIMEOUT_SECS: u64 = 120;

/// Client for the managed server's local endpoint.
#[derive(Debug, Clone)]
pub struct BackendClient {
    /// Base URL, e.g. `http://localhost:19020`.
    base_url: String,
    client: reqwest::Client,
    heartbeat_path: String,
    api_prefix: String,
    heartbeat_timeout: Duration,
    call_timeout: Duration,
}

impl BackendClient {
    /// Build a client for the server described by `config`.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self::with_client(client, config))
    }

    /// Build a client on top of an existing `reqwest::Client`.
    pub fn with_client(client: reqwest::Client, config: &ServerConfig) -> Self {
        Self {
            base_url: config.base_url().trim_end_matches('/').to_string(),
            client,
            heartbeat_path: normalize_path(&config.heartbeat_path),
            api_prefix: normalize_path(&config.api_prefix),
            heartbeat_timeout: config.heartbeat_timeout(),
            call_timeout: Duration::from_secs(CALL_TIMEOUT_SECS),
        }
    }

    /// Override the base URL (tests and non-default hosts).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe the heartbeat endpoint.
    ///
    /// `true` only when the server answers with HTTP 200 inside the
    /// heartbeat timeout.
    pub async fn heartbeat(&self) -> bool {
        let url = format!("{}{}", self.base_url, self.heartbeat_path);

        match self
            .client
            .get(&url)
            .timeout(self.heartbeat_timeout)
            .send()
            .await
        {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url = %url, "heartbeat failed: {}", e);
                false
            }
        }
    }

    /// Forward `method` with `args` to the server's API.
    ///
    /// Always returns a JSON value; failures come back as
    /// `{"error": 1, "message": ..., "data": null}`.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Value {
        match self.try_call(method, args).await {
            Ok(value) => value,
            Err(e) => {
                warn!(method = %method, "backend call failed: {:#}", e);
                error_reply(&format!("{:#}", e))
            }
        }
    }

    async fn try_call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let method = method.trim().trim_matches('/');
        if method.is_empty() {
            return Err(anyhow!(BridgeError::Backend(
                "method name is required".to_string()
            )));
        }

        let url = format!("{}{}/{}", self.base_url, self.api_prefix, method);
        let response = self
            .client
            .post(&url)
            .timeout(self.call_timeout)
            .json(&args)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    anyhow!(BridgeError::Backend(format!(
                        "Cannot connect to server at {}",
                        self.base_url
                    )))
                } else if e.is_timeout() {
                    anyhow!(BridgeError::Backend(format!(
                        "Request to {} timed out",
                        method
                    )))
                } else {
                    anyhow!(BridgeError::Backend(e.to_string()))
                }
            })?;

        if !response.status().is_success() {
            return Err(anyhow!(BridgeError::Backend(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            ))));
        }

        response
            .json::<Value>()
            .await
            .context("Failed to parse server response")
    }
}

/// Error envelope returned to the UI in place of a failed call.
pub fn error_reply(message: &str) -> Value {
    json!({
        "error": 1,
        "message": message,
        "data": null,
    })
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
