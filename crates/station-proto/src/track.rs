//! "Now playing" scraper.
//!
//! One GET of the station page, text of the first element matching a CSS
//! selector.  Fetch and parse failures collapse into an absent label; the
//! caller never sees an error and never gets a stale label back.

use std::time::Duration;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;

/// Display text for an absent label.
pub const TRACK_NOT_FOUND: &str = "Track not found";
/// Display text before the first fetch has completed.
pub const FETCHING_TRACK: &str = "Fetching track...";

#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("station page returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("invalid track selector '{0}'")]
    Selector(String),
}

/// Scraped track text.  Absent until the first successful fetch and after
/// every failed one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackLabel(Option<String>);

impl TrackLabel {
    /// Whitespace-only text counts as absent.
    pub fn new(text: Option<String>) -> Self {
        Self(text.and_then(|t| {
            let trimmed = t.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }))
    }

    pub fn absent() -> Self {
        Self(None)
    }

    pub fn text(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_absent(&self) -> bool {
        self.0.is_none()
    }

    /// Text to show on screen.
    pub fn display(&self) -> &str {
        self.text().unwrap_or(TRACK_NOT_FOUND)
    }
}

/// Label as held in the daemon's state: `Pending` until the first fetch
/// reports back, then the result of the latest fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    #[default]
    Pending,
    Fetched(TrackLabel),
}

impl TrackStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, TrackStatus::Pending)
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            TrackStatus::Pending => None,
            TrackStatus::Fetched(label) => label.text(),
        }
    }

    pub fn display(&self) -> &str {
        match self {
            TrackStatus::Pending => FETCHING_TRACK,
            TrackStatus::Fetched(label) => label.display(),
        }
    }
}

impl From<TrackLabel> for TrackStatus {
    fn from(label: TrackLabel) -> Self {
        TrackStatus::Fetched(label)
    }
}

/// Extract the label from a page.  Pure; `Html` is not `Send`, so keep it
/// out of async code.
pub fn extract_label(html: &str, selector: &Selector) -> TrackLabel {
    let document = Html::parse_document(html);
    let text = document
        .select(selector)
        .next()
        .map(|el| el.text().collect::<String>());
    TrackLabel::new(text)
}

fn parse_selector(selector: &str) -> Result<Selector, TrackError> {
    Selector::parse(selector).map_err(|e| {
        debug!("selector parse error: {:?}", e);
        TrackError::Selector(selector.to_string())
    })
}

#[derive(Clone)]
pub struct TrackFetcher {
    client: reqwest::Client,
    page_url: String,
    selector: String,
}

impl TrackFetcher {
    pub fn new(
        page_url: impl Into<String>,
        selector: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, TrackError> {
        parse_selector(selector)?;
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            page_url: page_url.into(),
            selector: selector.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, TrackError> {
        Self::new(
            config.station.page_url.clone(),
            &config.station.track_selector,
            &config.track.user_agent,
            Duration::from_secs(config.track.timeout_secs),
        )
    }

    pub fn page_url(&self) -> &str {
        &self.page_url
    }

    /// Fetch the page and extract the label.  Never fails.
    pub async fn fetch_label(&self) -> TrackLabel {
        match self.try_fetch().await {
            Ok(label) => {
                if label.is_absent() {
                    debug!("track: no element matches '{}'", self.selector);
                }
                label
            }
            Err(e) => {
                warn!("track: fetch from {} failed: {}", self.page_url, e);
                TrackLabel::absent()
            }
        }
    }

    /// Fetch in the background and hand the result to `on_complete`,
    /// exactly once.
    pub fn fetch_label_with<F>(&self, on_complete: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(TrackLabel) + Send + 'static,
    {
        let fetcher = self.clone();
        tokio::spawn(async move {
            let label = fetcher.fetch_label().await;
            on_complete(label);
        })
    }

    async fn try_fetch(&self) -> Result<TrackLabel, TrackError> {
        let response = self.client.get(&self.page_url).send().await?;
        if !response.status().is_success() {
            return Err(TrackError::Status(response.status()));
        }
        let html = response.text().await?;
        let selector = parse_selector(&self.selector)?;
        Ok(extract_label(&html, &selector))
    }
}
