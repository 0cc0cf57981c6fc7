//! HTTP Dependency Probe
//!
//! Built-in component that checks an external dependency's HTTP
//! endpoint. Server errors are transient (the dependency may come back);
//! client errors mean the probe itself is misconfigured.

use crate::component::{Component, TaskContext};
use crate::config::ProbeConfig;
use crate::error::{Result, VigilError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub struct HttpProbe {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(config: &ProbeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(VigilError::Control)?;

        Ok(Self {
            name: config.name.clone(),
            url: config.url.clone(),
            client,
        })
    }
}

#[async_trait]
impl Component for HttpProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        let request = self.client.get(&self.url).send();

        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(VigilError::Cancelled),
            result = request => result.map_err(|e| {
                VigilError::Transient(format!("probe request to {} failed: {}", self.url, e))
            })?,
        };

        let status = response.status();
        debug!("Probe {} -> {}", self.url, status);

        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(VigilError::Transient(format!(
                "{} returned {}",
                self.url, status
            )))
        } else {
            Err(VigilError::Validation(format!(
                "{} returned {}",
                self.url, status
            )))
        }
    }
}
