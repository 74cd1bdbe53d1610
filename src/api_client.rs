//! Thin async client for the coordinator HTTP API, used by the `filepull` CLI.

use anyhow::{anyhow, Context, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::api::{ClientList, DownloadBody, DownloadList, DownloadStarted, ErrorBody};
use crate::session::TransferRequest;

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn list_clients(&self) -> Result<ClientList> {
        let resp = self.http.get(self.url("/clients")).send().await.context("GET /clients")?;
        decode(resp).await
    }

    pub async fn request_download(&self, client_id: &str, file_name: &str) -> Result<DownloadStarted> {
        let body = DownloadBody {
            client_id: Some(client_id.to_string()),
            file_name: Some(file_name.to_string()),
        };
        let resp = self
            .http
            .post(self.url("/download"))
            .json(&body)
            .send()
            .await
            .context("POST /download")?;
        decode(resp).await
    }

    /// `Ok(None)` when the coordinator does not know the request id.
    pub async fn status(&self, request_id: &str) -> Result<Option<TransferRequest>> {
        let resp = self
            .http
            .get(self.url(&format!("/download/{request_id}")))
            .send()
            .await
            .context("GET /download")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }

    pub async fn list_downloads(&self) -> Result<DownloadList> {
        let resp = self.http.get(self.url("/downloads")).send().await.context("GET /downloads")?;
        decode(resp).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp.json::<T>().await.context("decode response");
    }
    match resp.json::<ErrorBody>().await {
        Ok(body) => match body.available {
            Some(ids) if !ids.is_empty() => {
                Err(anyhow!("{} (available: {})", body.error, ids.join(", ")))
            }
            _ => Err(anyhow!("{}", body.error)),
        },
        Err(_) => Err(anyhow!("HTTP {}", status)),
    }
}
