// ABOUTME: HTTP client for the telemetry endpoint - label lookup and line-protocol submission
// ABOUTME: Logs in for a bearer token, chunks batches, re-authenticates once when the token expires

use anyhow::{bail, Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{DestinationLabel, LabelRegistry, LabelSource, TelemetrySink};

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

/// Telemetry endpoint client
pub struct TelemetryClient {
    client: Client,
    api_base_url: String,
    username: String,
    password: String,
    max_records_per_call: usize,
    token: Mutex<Option<String>>,
}

impl TelemetryClient {
    /// Create a new client
    ///
    /// # Arguments
    ///
    /// * `api_base_url` - Endpoint root, e.g. `https://telemetry.example.com`
    /// * `max_records_per_call` - Upper bound of records per write request
    pub fn new(
        api_base_url: &str,
        username: String,
        password: String,
        max_records_per_call: usize,
        timeout: Duration,
    ) -> Result<Self> {
        url::Url::parse(api_base_url)
            .with_context(|| format!("Invalid telemetry endpoint URL: {}", api_base_url))?;
        if max_records_per_call == 0 {
            bail!("max_records_per_call must be at least 1");
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            username,
            password,
            max_records_per_call,
            token: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.api_base_url, path)
    }

    /// Obtain a fresh bearer token and cache it.
    async fn login(&self) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint("login"))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .context("Failed to reach telemetry endpoint for login")?;

        if response.status() == StatusCode::UNAUTHORIZED {
            bail!(
                "Telemetry endpoint rejected the credentials for user '{}'",
                self.username
            );
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Login failed with status {}: {}", status, body);
        }

        let login: LoginResponse = response
            .json()
            .await
            .context("Failed to parse login response")?;

        tracing::debug!("Obtained telemetry token for '{}'", self.username);
        *self.token.lock().await = Some(login.token.clone());
        Ok(login.token)
    }

    async fn current_token(&self) -> Result<String> {
        let cached = self.token.lock().await.clone();
        match cached {
            Some(token) => Ok(token),
            None => self.login().await,
        }
    }

    /// Send an authenticated request, logging in again once if the token expired.
    async fn send_authorized<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let token = self.current_token().await?;
        let response = build(&token)
            .send()
            .await
            .context("Failed to send request to telemetry endpoint")?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::info!("Telemetry token expired, logging in again");
        let token = self.login().await?;
        build(&token)
            .send()
            .await
            .context("Failed to send request to telemetry endpoint")
    }

    /// Fetch the current asset/instance labelling.
    pub async fn fetch_labels(&self) -> Result<LabelRegistry> {
        let url = self.endpoint("labels");
        let response = self
            .send_authorized(|token| self.client.get(&url).bearer_auth(token))
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Fetching labels failed with status {}: {}", status, body);
        }

        let labels: Vec<DestinationLabel> = response
            .json()
            .await
            .context("Failed to parse label response")?;
        tracing::info!("Fetched {} label(s) from telemetry endpoint", labels.len());
        Ok(LabelRegistry::from_labels(labels))
    }

    async fn submit_chunk(&self, chunk: &[String]) -> Result<()> {
        let url = self.endpoint("write");
        let body = chunk.join("\n");
        let response = self
            .send_authorized(|token| {
                self.client
                    .post(&url)
                    .bearer_auth(token)
                    .header("Content-Type", "text/plain; charset=utf-8")
                    .body(body.clone())
            })
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!(
                "Telemetry write of {} record(s) failed with status {}: {}",
                chunk.len(),
                status,
                body
            );
        }
        Ok(())
    }
}

impl LabelSource for TelemetryClient {
    async fn load_labels(&self) -> Result<LabelRegistry> {
        self.fetch_labels().await
    }
}

impl TelemetrySink for TelemetryClient {
    async fn submit(&self, records: &[String]) -> Result<()> {
        for chunk in records.chunks(self.max_records_per_call) {
            self.submit_chunk(chunk).await?;
        }
        Ok(())
    }
}
