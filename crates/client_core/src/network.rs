use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use url::Url;

pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: Url,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport seam. Errors mean no response arrived at all; any status the
/// server returned comes back as an `HttpResponse`.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

pub struct ReqwestNetworkClient {
    http: Client,
}

impl ReqwestNetworkClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl NetworkClient for ReqwestNetworkClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self
            .http
            .post(request.url.clone())
            .header(reqwest::header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, PROTOBUF_CONTENT_TYPE)
            .body(request.body)
            .send()
            .await
            .with_context(|| format!("feed request to {} failed", request.url))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .context("failed to read feed response body")?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}
