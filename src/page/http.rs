//! Plain-HTTP page source. No JavaScript execution; useful when the portal
//! serves server-rendered markup or as a fallback when Chrome cannot launch.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{PageError, PageSource, WaitPolicy};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl PageSource for HttpSource {
    async fn fetch(&self, url: &str, wait: WaitPolicy) -> Result<String, PageError> {
        let response = self
            .client
            .get(url)
            .timeout(wait.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PageError::Timeout(wait.timeout)
                } else {
                    PageError::Navigation(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(PageError::Navigation(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let html = response
            .text()
            .await
            .map_err(|e| PageError::Render(e.to_string()))?;

        debug!(bytes = html.len(), "downloaded HTML");
        Ok(html)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
