// src/service/http.rs
//! reqwest-backed implementation of the Trade Data Service, matching the
//! upstream HTTP API: JSON endpoints for single-pair and cache queries, and a
//! server-sent-events stream for the multi-pair fetch.

use super::TradeDataService;
use crate::config::Config;
use crate::error::{DeskError, Result};
use crate::types::{PairSummary, RateLimitState, StalenessReport};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, warn};
use reqwest::{header, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

const API_KEY_HEADER: &str = "X-API-Key";

/// Wire envelope of the latest-cached endpoint.
#[derive(Debug, Deserialize)]
struct TradesResponse {
    #[allow(dead_code)]
    league: Option<String>,
    #[serde(default)]
    results: Vec<PairSummary>,
}

#[derive(Debug, Serialize)]
struct SetPriceRequest<'a> {
    index: usize,
    new_rate: &'a str,
}

pub struct HttpTradeDataService {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    stream_capacity: usize,
}

impl HttpTradeDataService {
    pub fn new(config: &Config) -> Result<Self> {
        let base_url = Url::parse(&config.api_base_url)?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            stream_capacity: config.stream_channel_capacity,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| DeskError::Config(format!("bad endpoint '{}': {}", path, e)))
    }

    /// Maps HTTP status codes onto the desk error taxonomy so every failure
    /// lands on the right `PairStatus`.
    async fn check(response: Response) -> Result<Response> {
        match response.status() {
            StatusCode::NOT_FOUND => {
                Err(DeskError::InvalidPair("pair not found upstream".to_string()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0);
                Err(DeskError::RateLimited { retry_after_secs })
            }
            status if !status.is_success() => Err(DeskError::Network(format!(
                "upstream returned HTTP {}",
                status
            ))),
            _ => Ok(response),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl TradeDataService for HttpTradeDataService {
    async fn stream_pairs(
        &self,
        desired_count: usize,
        force_fresh: bool,
    ) -> Result<mpsc::Receiver<Result<PairSummary>>> {
        let mut url = self.endpoint("api/trades/stream")?;
        url.query_pairs_mut()
            .append_pair("top_n", &desired_count.to_string())
            .append_pair("force", if force_fresh { "true" } else { "false" });

        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let (tx, rx) = mpsc::channel(self.stream_capacity);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Stream read failed: {}", e);
                        let _ = tx.send(Err(DeskError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                for frame in drain_sse_frames(&mut buffer) {
                    match parse_sse_frame(&frame) {
                        Some(Ok(summary)) => {
                            debug!("Stream message for index {}", summary.index);
                            if tx.send(Ok(summary)).await.is_err() {
                                // Receiver gone: initial load was cancelled.
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Undecodable stream frame: {}", e);
                        }
                        None => {}
                    }
                }
            }
            // Channel close on drop signals batch completion.
        });
        Ok(rx)
    }

    async fn refresh_pair(
        &self,
        index: usize,
        desired_count: usize,
        proposed_price: Option<&str>,
    ) -> Result<PairSummary> {
        if let Some(new_rate) = proposed_price {
            // Accepting a suggestion updates the upstream listing itself
            // before the re-read.
            let url = self.endpoint("api/trades/undercut")?;
            let response = self
                .client
                .post(url)
                .header(API_KEY_HEADER, &self.api_key)
                .json(&SetPriceRequest { index, new_rate })
                .send()
                .await?;
            Self::check(response).await?;
        }

        let mut url = self.endpoint("api/trades/refresh_one")?;
        url.query_pairs_mut()
            .append_pair("index", &index.to_string())
            .append_pair("top_n", &desired_count.to_string());
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json::<PairSummary>().await?)
    }

    async fn latest_cached(&self, desired_count: usize) -> Result<Vec<PairSummary>> {
        let mut url = self.endpoint("api/cache/latest_cached")?;
        url.query_pairs_mut()
            .append_pair("top_n", &desired_count.to_string());
        let envelope: TradesResponse = self.get_json(url).await?;
        Ok(envelope.results)
    }

    async fn staleness(&self) -> Result<StalenessReport> {
        let url = self.endpoint("api/cache/expiring")?;
        self.get_json(url).await
    }

    async fn rate_limit_status(&self) -> Result<RateLimitState> {
        let url = self.endpoint("api/rate_limit")?;
        self.get_json(url).await
    }
}

/// Splits complete `\n\n`-terminated SSE frames off the front of the buffer,
/// leaving any partial frame for the next chunk.
fn drain_sse_frames(buffer: &mut String) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let frame: String = buffer.drain(..pos + 2).collect();
        let frame = frame.trim_end().to_string();
        if !frame.is_empty() {
            frames.push(frame);
        }
    }
    frames
}

/// Extracts and decodes the `data:` payload of one SSE frame. Frames without
/// a data line (comments, keep-alives) yield `None`.
fn parse_sse_frame(frame: &str) -> Option<Result<PairSummary>> {
    let payload: String = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n");
    if payload.is_empty() {
        return None;
    }
    Some(serde_json::from_str::<PairSummary>(&payload).map_err(DeskError::from))
}
