//! Headless-Chrome page source for the JavaScript-rendered portal.

use std::thread;

use anyhow::{Context, Result};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions};
use tracing::{debug, info};

use super::{PageError, PageSource, WaitPolicy};

/// Renders pages in a headless Chrome instance. The browser is launched
/// once and shared across the session; each fetch opens a fresh tab.
pub struct ChromeSource {
    browser: Browser,
}

impl ChromeSource {
    pub fn new() -> Result<Self> {
        info!("Launching headless Chrome...");

        let options = LaunchOptions::default_builder()
            .headless(true)
            .build()
            .context("Failed to build launch options")?;

        let browser = Browser::new(options).context("Failed to launch Chrome browser")?;

        Ok(Self { browser })
    }
}

#[async_trait]
impl PageSource for ChromeSource {
    async fn fetch(&self, url: &str, wait: WaitPolicy) -> Result<String, PageError> {
        let browser = self.browser.clone();
        let url = url.to_string();

        // The devtools protocol client is blocking; keep it off the runtime
        tokio::task::spawn_blocking(move || {
            let tab = browser
                .new_tab()
                .map_err(|e| PageError::Navigation(e.to_string()))?;
            tab.set_default_timeout(wait.timeout);

            tab.navigate_to(&url)
                .map_err(|e| PageError::Navigation(e.to_string()))?;
            tab.wait_until_navigated()
                .map_err(|_| PageError::Timeout(wait.timeout))?;

            // Let the SPA finish rendering its listing cards
            thread::sleep(wait.settle);

            // Dismiss the cookie banner if present; failure is irrelevant
            let _ = tab.evaluate(
                r#"
                const button = document.querySelector('button[class*="cookie"], button[data-testid*="accept"]');
                if (button) button.click();
                "#,
                false,
            );

            let result = tab
                .evaluate("document.documentElement.outerHTML", false)
                .map_err(|e| PageError::Render(e.to_string()))?;

            let html = result
                .value
                .as_ref()
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| PageError::Render("empty document".to_string()))?;

            debug!(bytes = html.len(), "captured rendered HTML");

            let _ = tab.close(true);
            Ok(html)
        })
        .await
        .map_err(|e| PageError::Render(e.to_string()))?
    }

    fn name(&self) -> &'static str {
        "chrome"
    }
}
