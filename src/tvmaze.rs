//! Upstream catalog client.
//!
//! The pipeline only talks to [`CatalogClient`]; [`TvMazeClient`] is the HTTP
//! implementation against the public TVMaze API.
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::TvMaze;
use crate::model::{parse_id, Period, RawRecord};

/// Sub-resources the show endpoint can inline under `_embedded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Embed {
    Seasons,
    Episodes,
}

impl Embed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Embed::Seasons => "seasons",
            Embed::Episodes => "episodes",
        }
    }
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// One page of the show index. Empty once the page is past the end.
    async fn list_page(&self, page: i64) -> Result<Vec<RawRecord>>;

    /// A show's details, `None` when the show does not exist upstream.
    async fn show_details(&self, show_id: i64, embed: &[Embed]) -> Result<Option<RawRecord>>;

    /// Shows changed within `period`, as show id -> epoch seconds.
    async fn changes(&self, period: Period) -> Result<BTreeMap<i64, i64>>;
}

#[derive(Clone)]
pub struct TvMazeClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for TvMazeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TvMazeClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl TvMazeClient {
    pub fn from_config(cfg: &TvMaze) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid tvmaze.base_url")?;
        Self::with_base_url(
            base_url,
            &cfg.user_agent,
            Duration::from_secs(cfg.timeout_seconds),
        )
    }

    pub fn with_base_url(base_url: Url, user_agent: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn page_url(&self, page: i64) -> Result<Url> {
        let mut url = self.base_url.join("shows").context("invalid TVMaze base URL")?;
        url.query_pairs_mut().append_pair("page", &page.to_string());
        Ok(url)
    }

    pub fn show_url(&self, show_id: i64, embed: &[Embed]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("shows/{show_id}"))
            .context("invalid TVMaze base URL")?;
        if !embed.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for e in embed {
                pairs.append_pair("embed[]", e.as_str());
            }
        }
        Ok(url)
    }

    pub fn updates_url(&self, period: Period) -> Result<Url> {
        let mut url = self
            .base_url
            .join("updates/shows")
            .context("invalid TVMaze base URL")?;
        url.query_pairs_mut().append_pair("since", period.as_str());
        Ok(url)
    }

    /// GET `url` as JSON. 404 is `None`; 429 and other failures are errors.
    async fn get_json(&self, url: Url) -> Result<Option<Value>> {
        debug!(%url, "GET");
        let res = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;

        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, "rate limited by TVMaze");
            return Err(anyhow!("received 429 from TVMaze: {body}"));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("TVMaze error {status} for {url}: {body}"));
        }
        let value = res
            .json::<Value>()
            .await
            .with_context(|| format!("invalid JSON from {url}"))?;
        Ok(Some(value))
    }
}

#[async_trait]
impl CatalogClient for TvMazeClient {
    async fn list_page(&self, page: i64) -> Result<Vec<RawRecord>> {
        match self.get_json(self.page_url(page)?).await? {
            None => Ok(Vec::new()),
            Some(value) => parse_page(value),
        }
    }

    async fn show_details(&self, show_id: i64, embed: &[Embed]) -> Result<Option<RawRecord>> {
        match self.get_json(self.show_url(show_id, embed)?).await? {
            None => Ok(None),
            Some(Value::Object(show)) => Ok(Some(show)),
            Some(other) => bail!("show {show_id}: expected an object, got {other}"),
        }
    }

    async fn changes(&self, period: Period) -> Result<BTreeMap<i64, i64>> {
        match self.get_json(self.updates_url(period)?).await? {
            None => Ok(BTreeMap::new()),
            Some(Value::Object(map)) => Ok(parse_changes(&map)),
            Some(other) => bail!("updates: expected an object, got {other}"),
        }
    }
}

/// A page is an array of show objects; anything else in it is skipped.
pub fn parse_page(value: Value) -> Result<Vec<RawRecord>> {
    let Value::Array(items) = value else {
        bail!("show page: expected an array");
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(show) => Some(show),
            other => {
                warn!(item = %other, "skipping non-object entry in show page");
                None
            }
        })
        .collect())
}

/// Parse a `{"<show id>": <epoch seconds>}` change map. Entries with an
/// unusable key or timestamp are skipped.
pub fn parse_changes(map: &Map<String, Value>) -> BTreeMap<i64, i64> {
    map.iter()
        .filter_map(|(key, value)| {
            let show_id = parse_id(Some(&Value::String(key.clone())));
            match (show_id, value.as_i64()) {
                (Some(id), Some(ts)) => Some((id, ts)),
                _ => {
                    warn!(key = %key, value = %value, "skipping malformed change entry");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> TvMazeClient {
        TvMazeClient::with_base_url(
            Url::parse("https://api.tvmaze.com/").unwrap(),
            "show-sync-test",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn builds_endpoint_urls() {
        let c = client();
        assert_eq!(
            c.page_url(3).unwrap().as_str(),
            "https://api.tvmaze.com/shows?page=3"
        );
        assert_eq!(
            c.show_url(42, &[]).unwrap().as_str(),
            "https://api.tvmaze.com/shows/42"
        );
        let embedded = c.show_url(42, &[Embed::Seasons, Embed::Episodes]).unwrap();
        let pairs: Vec<(String, String)> = embedded
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("embed[]".to_string(), "seasons".to_string()),
                ("embed[]".to_string(), "episodes".to_string()),
            ]
        );
        assert_eq!(
            c.updates_url(Period::Week).unwrap().as_str(),
            "https://api.tvmaze.com/updates/shows?since=week"
        );
    }

    #[test]
    fn page_parsing_keeps_objects() {
        let page = parse_page(json!([{"id": 1}, 7, {"id": 2}])).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[1]["id"], 2);
        assert!(parse_page(json!({"id": 1})).is_err());
    }

    #[test]
    fn change_map_parsing() {
        let raw = json!({"1": 1700000000, "2": "soon", "x": 5, "3": 1700000100});
        let parsed = parse_changes(raw.as_object().unwrap());
        assert_eq!(
            parsed.into_iter().collect::<Vec<_>>(),
            vec![(1, 1_700_000_000), (3, 1_700_000_100)]
        );
    }
}
