//! Boundary to the page-rendering service.
//!
//! The pipeline never talks to a browser directly; it asks a [`PageSource`]
//! for the rendered HTML of a URL and treats every call as slow and
//! fallible. Extraction happens synchronously on the returned document, so
//! the only suspension points in the pipeline are the limiter waits and
//! `fetch` itself.

pub mod chrome;
pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use chrome::ChromeSource;
pub use http::HttpSource;

/// How long to wait for a page before giving up.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    /// Navigation budget
    pub timeout: Duration,
    /// Extra settle time for dynamic content after navigation
    pub settle: Duration,
}

impl WaitPolicy {
    /// The retry budget: longer timeout, longer settle.
    pub fn extended() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            settle: Duration::from_secs(5),
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            settle: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Error)]
pub enum PageError {
    /// The navigation budget ran out; worth one retry with a longer policy
    #[error("page load timed out after {0:?}")]
    Timeout(Duration),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("page render failed: {0}")]
    Render(String),
}

impl PageError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// An opaque page-rendering service: give it a URL, get rendered HTML back.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Navigate to `url` and return the rendered document's HTML.
    async fn fetch(&self, url: &str, wait: WaitPolicy) -> Result<String, PageError>;

    /// Human-readable name for logs.
    fn name(&self) -> &'static str;
}
