//! JSON feed source over HTTP.
//!
//! Accepts either `{"items": [...]}` or a bare array, newest first. Items
//! need an `id`; `kind` may also arrive as `type`, `url` as `link`, and
//! `published_at` as `published`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hearth_core::{FeedItem, FeedSource, RemoteError, RemoteResult};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::discord::classify_status;

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(alias = "video_id", alias = "guid")]
    id: String,
    #[serde(default, alias = "type")]
    kind: String,
    #[serde(default)]
    title: String,
    #[serde(default, alias = "link")]
    url: String,
    #[serde(default, alias = "published")]
    published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawWindow {
    Wrapped { items: Vec<RawItem> },
    Bare(Vec<RawItem>),
}

/// Parses a feed payload. A malformed payload is a permanent failure for
/// this cycle; the next tick fetches again.
pub fn parse_window(body: &str) -> RemoteResult<Vec<FeedItem>> {
    let raw: RawWindow = serde_json::from_str(body)
        .map_err(|e| RemoteError::Fatal(format!("malformed feed payload: {e}")))?;
    let items = match raw {
        RawWindow::Wrapped { items } | RawWindow::Bare(items) => items,
    };
    Ok(items
        .into_iter()
        .filter(|item| !item.id.trim().is_empty())
        .map(|item| FeedItem {
            id: item.id,
            kind: item.kind,
            title: item.title,
            url: item.url,
            published_at: item.published_at,
        })
        .collect())
}

pub struct JsonFeedSource {
    client: Client,
    url: String,
    feed_id: String,
}

impl JsonFeedSource {
    /// The feed id defaults to the URL, so changing the URL starts a fresh
    /// cursor.
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let url = url.into();
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            feed_id: url.clone(),
            url,
        })
    }

    pub fn with_feed_id(mut self, feed_id: impl Into<String>) -> Self {
        self.feed_id = feed_id.into();
        self
    }
}

#[async_trait]
impl FeedSource for JsonFeedSource {
    fn feed_id(&self) -> &str {
        &self.feed_id
    }

    async fn fetch_window(&self) -> RemoteResult<Vec<FeedItem>> {
        let resp = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| RemoteError::Transient(format!("feed request failed: {e}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| RemoteError::Transient(format!("feed body read failed: {e}")))?;
        if status != StatusCode::OK {
            return Err(classify_status(status, &body));
        }
        parse_window(&body)
    }
}
