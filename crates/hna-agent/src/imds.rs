use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use hna_core::errors::{Error, ValidationError};

/// Connection settings for the node-local metadata server, read from
/// the JSON config dropped into the guest.
#[derive(Debug, Clone, Deserialize)]
pub struct ImdsConfig {
    pub address: String,
    pub port: u16,
    pub secret: String,
}

/// Client for the metadata server's query path.
pub struct ImdsClient {
    config: ImdsConfig,
    client: reqwest::blocking::Client,
}

impl ImdsClient {
    pub fn new(config: ImdsConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Request(format!("imds: Failed to build client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn from_config_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Read(format!("imds: Failed to read config: {}", e)))?;
        let config: ImdsConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Parse(format!("imds: Failed to parse config: {}", e)))?;
        Self::new(config)
    }

    /// GET `/query<path>` and return the raw body. Non-200 responses
    /// whose body decodes as an error document surface its message.
    pub fn query(&self, path: &str) -> Result<String> {
        let url = format!(
            "http://{}:{}/query{}",
            self.config.address, self.config.port, path,
        );

        let response = self
            .client
            .get(&url)
            .header("User-Agent", "pritunl-imds")
            .header("Auth-Token", &self.config.secret)
            .send()
            .map_err(|e| Error::Request(format!("imds: Request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| Error::Read(format!("imds: Failed to read body: {}", e)))?;

        if status.as_u16() != 200 {
            let message = serde_json::from_str::<ValidationError>(&body)
                .ok()
                .filter(|err| !err.error.is_empty() && !err.message.is_empty())
                .map(|err| err.message)
                .unwrap_or(body);

            return Err(Error::Request(format!(
                "imds: Server error {} - {}",
                status.as_u16(),
                message,
            ))
            .into());
        }

        Ok(body)
    }
}
