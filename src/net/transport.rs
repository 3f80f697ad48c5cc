use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result as EyreResult};
use std::time::Duration;
use tracing::debug;

use super::{Request, Response};
use crate::error::{Result, SyncError};

/// The remote endpoint as the sync core sees it.
///
/// `Err` means the request never produced a response (connection failure,
/// timeout). Any HTTP status, including 5xx, is `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed transport used against the real dashboard API.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> EyreResult<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| SyncError::NetworkUnreachable(format!("invalid method: {}", e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| SyncError::NetworkUnreachable(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| SyncError::NetworkUnreachable(format!("body read failed: {}", e)))?
      .to_vec();

    debug!(method = %request.method, url = %request.url, status, "Remote responded");

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
