//! Blocking client for the CivitAI model-version by-hash endpoint.

use super::{LookupOutcome, MetadataProvider, ProviderRecord};
use crate::config::ProviderConfig;
use crate::{IntakeError, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

const STEP: &str = "metadata lookup";

fn lookup_error(err: reqwest::Error) -> IntakeError {
    IntakeError::ExternalStepFailed {
        step: STEP.to_string(),
        timed_out: err.is_timeout(),
        message: err.to_string(),
    }
}

/// Looks up model versions by file hash.
#[derive(Debug, Clone)]
pub struct CivitaiClient {
    client: Client,
    base_url: String,
}

impl CivitaiClient {
    /// Create a client with the default endpoint and timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(ProviderConfig::REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(ProviderConfig::USER_AGENT)
            .build()
            .map_err(lookup_error)?;
        Ok(Self {
            client,
            base_url: ProviderConfig::BY_HASH_URL.to_string(),
        })
    }

    /// Point the client at another by-hash endpoint (mirrors, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url_for(&self, sha256: &str) -> String {
        format!("{}{}", self.base_url, sha256.to_ascii_uppercase())
    }
}

impl MetadataProvider for CivitaiClient {
    fn lookup(&self, sha256: &str) -> Result<LookupOutcome> {
        let url = self.url_for(sha256);
        debug!("GET {}", url);

        let response = self.client.get(&url).send().map_err(lookup_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(LookupOutcome::NotFound);
        }
        if !status.is_success() {
            return Err(IntakeError::external(
                STEP,
                format!("{url} returned HTTP {status}"),
            ));
        }

        let raw: serde_json::Value = response.json().map_err(lookup_error)?;
        Ok(LookupOutcome::Found(ProviderRecord::new(raw)))
    }
}
