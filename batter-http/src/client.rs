use crate::config::EngineConfig;
use crate::wire::{
    bulk_body, flat_settings, keep_alive_param, BulkReply, ClearScrollBody, ScrollBody,
    SearchBody, SearchReply, SettingsEntry,
};
use async_trait::async_trait;
use batter::{
    Batch, BulkResponse, EngineError, EngineResult, IndexSettings, ScrollPage, ScrollRequest,
    SearchEngine, SettingsUpdate,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;

/// Longest slice of an error body carried into an error message.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client for one Elasticsearch-compatible cluster.
pub struct HttpEngine {
    base_url: String,
    http_client: reqwest::Client,
    force_merge_timeout: Duration,
}

impl HttpEngine {
    /// # Errors
    ///
    /// [`EngineError::Protocol`] if the HTTP client cannot be set up, for
    /// instance when no TLS backend is available.
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EngineError::Protocol(format!("Failed to build HTTP client: {}", e)))?;

        Ok(HttpEngine {
            base_url: config.url.trim_end_matches('/').to_string(),
            http_client,
            force_merge_timeout: config.force_merge_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Send `request`, turning transport failures and non-success statuses
    /// into [`EngineError`]s.
    async fn send(&self, what: &str, request: reqwest::RequestBuilder) -> EngineResult<reqwest::Response> {
        let response = request.send().await.map_err(|e| {
            EngineError::Transport(format!("{} on {} failed: {}", what, self.base_url, e))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(EngineError::from_status(
            status.as_u16(),
            format!("{} returned {}: {}", what, status, body),
        ))
    }

    async fn read_json<T: DeserializeOwned>(what: &str, response: reqwest::Response) -> EngineResult<T> {
        response
            .json()
            .await
            .map_err(|e| EngineError::Protocol(format!("Failed to parse {} response: {}", what, e)))
    }
}

#[async_trait]
impl SearchEngine for HttpEngine {
    async fn bulk(&self, batch: &Batch) -> EngineResult<BulkResponse> {
        let body = bulk_body(batch).map_err(|e| EngineError::Protocol(e.to_string()))?;
        let request = self
            .http_client
            .post(self.url("_bulk"))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);

        let response = self.send("bulk", request).await?;
        let reply: BulkReply = Self::read_json("bulk", response).await?;
        let response = BulkResponse::from(reply);

        // Items refused for capacity make the whole batch worth resending;
        // index and delete actions are idempotent.
        let rejected: Vec<_> = response.items.iter().filter(|i| i.status == 429).collect();
        if let Some(first) = rejected.first() {
            return Err(EngineError::from_status(
                429,
                format!(
                    "bulk rejected {} of {} item(s), first [{}]: {}",
                    rejected.len(),
                    response.items.len(),
                    first.id,
                    first.failure.as_deref().unwrap_or("too many requests")
                ),
            ));
        }
        Ok(response)
    }

    async fn get_settings(&self, index: &str) -> EngineResult<IndexSettings> {
        let request = self
            .http_client
            .get(self.url(&format!("{}/_settings", index)))
            .query(&[("flat_settings", "true")]);

        let response = self.send("get settings", request).await?;
        let reply: BTreeMap<String, SettingsEntry> = Self::read_json("get settings", response).await?;
        flat_settings(reply, index)
            .ok_or_else(|| EngineError::NotFound(format!("no settings returned for index [{}]", index)))
    }

    async fn put_settings(&self, index: &str, settings: &SettingsUpdate) -> EngineResult<()> {
        let request = self
            .http_client
            .put(self.url(&format!("{}/_settings", index)))
            .json(settings);
        self.send("put settings", request).await?;
        Ok(())
    }

    async fn force_merge(&self, index: &str) -> EngineResult<()> {
        let request = self
            .http_client
            .post(self.url(&format!("{}/_forcemerge", index)))
            .timeout(self.force_merge_timeout);
        self.send("force merge", request).await?;
        Ok(())
    }

    async fn refresh(&self, index: &str) -> EngineResult<()> {
        let request = self.http_client.post(self.url(&format!("{}/_refresh", index)));
        self.send("refresh", request).await?;
        Ok(())
    }

    async fn open_scroll(&self, request: &ScrollRequest) -> EngineResult<ScrollPage> {
        let http_request = self
            .http_client
            .post(self.url(&format!("{}/_search", request.index)))
            .query(&[("scroll", keep_alive_param(request.keep_alive))])
            .json(&SearchBody::from(request));

        let response = self.send("open scroll", http_request).await?;
        let reply: SearchReply = Self::read_json("open scroll", response).await?;
        let scroll_id = reply
            .scroll_id
            .ok_or_else(|| EngineError::Protocol("search reply carries no _scroll_id".to_string()))?;
        Ok(ScrollPage {
            scroll_id,
            hits: reply.hits.hits.into_iter().map(Into::into).collect(),
        })
    }

    async fn scroll_next(&self, scroll_id: &str, keep_alive: Duration) -> EngineResult<ScrollPage> {
        let request = self
            .http_client
            .post(self.url("_search/scroll"))
            .json(&ScrollBody {
                scroll: keep_alive_param(keep_alive),
                scroll_id,
            });

        let response = self.send("scroll", request).await?;
        let reply: SearchReply = Self::read_json("scroll", response).await?;
        Ok(ScrollPage {
            scroll_id: reply.scroll_id.unwrap_or_else(|| scroll_id.to_string()),
            hits: reply.hits.hits.into_iter().map(Into::into).collect(),
        })
    }

    async fn clear_scroll(&self, scroll_id: &str) -> EngineResult<()> {
        let request = self
            .http_client
            .delete(self.url("_search/scroll"))
            .json(&ClearScrollBody {
                scroll_id: vec![scroll_id],
            });
        self.send("clear scroll", request).await?;
        Ok(())
    }
}
