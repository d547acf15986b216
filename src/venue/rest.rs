// =============================================================================
// Venue REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry the API key as a header and an HMAC signature over the query
// string. Every call has a hard timeout; for submit and cancel a timeout
// or 5xx is an Ambiguous outcome, never an error the caller could retry.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use super::{SubmitRequest, SubmittedOrder, VenueClient, VenueFill, VenueOrder, VenuePosition};
use crate::types::{Cents, Outcome, Side};

type HmacSha256 = Hmac<Sha256>;

/// Hard timeout on every outbound call.
const REQUEST_TIMEOUT_S: u64 = 10;

/// REST transport for the venue's account and order endpoints.
#[derive(Clone)]
pub struct RestVenueClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestVenueClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — venue API key (sent as a header, never in query params).
    /// * `secret`  — secret used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-PE-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_S))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str, now_ms: i64) -> String {
        let base = if params.is_empty() {
            format!("timestamp={now_ms}")
        } else {
            format!("{params}&timestamp={now_ms}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn get_json(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let qs = self.signed_query(params, now_ms);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("venue GET {path} returned {status}: {body}");
        }
        Ok(body)
    }

    fn parse_order(value: &serde_json::Value) -> Option<VenueOrder> {
        Some(VenueOrder {
            client_order_id: value.get("client_order_id")?.as_str()?.to_string(),
            exchange_order_id: value.get("order_id")?.as_str()?.to_string(),
            market_id: value.get("market")?.as_str()?.to_string(),
            side: Side::from_str_opt(value.get("side")?.as_str()?)?,
            price: value.get("price")?.as_str()?.parse().ok()?,
            size_cents: value.get("size_cents")?.as_i64()?,
            filled_cents: value.get("filled_cents")?.as_i64().unwrap_or(0),
            status: value.get("status")?.as_str()?.to_string(),
        })
    }
}

#[async_trait]
impl VenueClient for RestVenueClient {
    #[instrument(skip(self), name = "venue::server_time")]
    async fn server_time_ms(&self) -> Result<i64> {
        let url = format!("{}/time", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /time request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse /time response")?;
        body.get("server_time_ms")
            .and_then(|v| v.as_i64())
            .context("missing server_time_ms")
    }

    #[instrument(skip(self), name = "venue::balance")]
    async fn balance_cents(&self) -> Result<Cents> {
        let body = self.get_json("/account/balance", "").await?;
        body.get("available_cents")
            .and_then(|v| v.as_i64())
            .context("missing available_cents")
    }

    #[instrument(skip(self), name = "venue::open_orders")]
    async fn open_orders(&self) -> Result<Vec<VenueOrder>> {
        let body = self.get_json("/orders/open", "").await?;
        let raw = body
            .get("orders")
            .and_then(|v| v.as_array())
            .context("open orders response missing 'orders'")?;
        let orders: Vec<VenueOrder> = raw.iter().filter_map(Self::parse_order).collect();
        debug!(count = orders.len(), "open orders retrieved");
        Ok(orders)
    }

    #[instrument(skip(self), name = "venue::fills")]
    async fn fills_since(&self, since_ms: i64) -> Result<Vec<VenueFill>> {
        let body = self
            .get_json("/fills", &format!("since_ms={since_ms}"))
            .await?;
        let raw = body
            .get("fills")
            .and_then(|v| v.as_array())
            .context("fills response missing 'fills'")?;

        let mut fills = Vec::with_capacity(raw.len());
        for f in raw {
            let parsed = (|| -> Option<VenueFill> {
                Some(VenueFill {
                    exchange_order_id: f.get("order_id")?.as_str()?.to_string(),
                    market_id: f.get("market")?.as_str()?.to_string(),
                    side: Side::from_str_opt(f.get("side")?.as_str()?)?,
                    price: f.get("price")?.as_str()?.parse().ok()?,
                    size_cents: f.get("size_cents")?.as_i64()?,
                    ts_ms: f.get("ts_ms")?.as_i64()?,
                })
            })();
            match parsed {
                Some(fill) => fills.push(fill),
                None => warn!("skipping malformed fill entry"),
            }
        }
        Ok(fills)
    }

    #[instrument(skip(self), name = "venue::positions")]
    async fn positions(&self) -> Result<Vec<VenuePosition>> {
        let body = self.get_json("/positions", "").await?;
        let raw = body
            .get("positions")
            .and_then(|v| v.as_array())
            .context("positions response missing 'positions'")?;

        let mut positions = Vec::with_capacity(raw.len());
        for p in raw {
            let parsed = (|| -> Option<VenuePosition> {
                Some(VenuePosition {
                    market_id: p.get("market")?.as_str()?.to_string(),
                    side: Side::from_str_opt(p.get("side")?.as_str()?)?,
                    size_cents: p.get("size_cents")?.as_i64()?,
                    avg_price: p.get("avg_price")?.as_str()?.parse().ok()?,
                })
            })();
            match parsed {
                Some(position) => positions.push(position),
                None => warn!("skipping malformed position entry"),
            }
        }
        Ok(positions)
    }

    #[instrument(skip(self), name = "venue::find_order")]
    async fn find_order(&self, client_order_id: &str) -> Result<Option<VenueOrder>> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let qs = self.signed_query(&format!("client_order_id={client_order_id}"), now_ms);
        let url = format!("{}/orders/by-client-id?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /orders/by-client-id request failed")?;

        // 404 is an authoritative "no such order".
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order lookup response")?;

        if !status.is_success() {
            anyhow::bail!("venue order lookup returned {status}: {body}");
        }

        Ok(Self::parse_order(&body))
    }

    #[instrument(skip(self, req), name = "venue::submit", fields(market = %req.market_id, side = %req.side))]
    async fn submit_limit_order(&self, req: &SubmitRequest) -> Outcome<SubmittedOrder> {
        let params = format!(
            "market={}&side={}&price={:.6}&size_cents={}&client_order_id={}&post_only={}&marketable={}",
            req.market_id,
            req.side,
            req.price,
            req.size_cents,
            req.client_order_id,
            req.post_only,
            req.marketable_limit
        );
        let now_ms = chrono::Utc::now().timestamp_millis();
        let qs = self.signed_query(&params, now_ms);
        let url = format!("{}/orders?{}", self.base_url, qs);

        let resp = match self.client.post(&url).send().await {
            Ok(resp) => resp,
            // Timeouts and connection failures: the request may have landed.
            Err(e) => return Outcome::Ambiguous(format!("submit transport error: {e}")),
        };

        let status = resp.status();
        if status.is_server_error() {
            return Outcome::Ambiguous(format!("submit returned {status}"));
        }

        let body: serde_json::Value = match resp.json().await {
            Ok(body) => body,
            Err(e) => return Outcome::Ambiguous(format!("unreadable submit response: {e}")),
        };

        if status.is_client_error() {
            // Authoritative rejection: no order was created.
            warn!(status = %status, body = %body, "submit rejected by venue");
            return Outcome::AbsentConfirmed;
        }

        let parsed = (|| -> Option<SubmittedOrder> {
            Some(SubmittedOrder {
                exchange_order_id: body.get("order_id")?.as_str()?.to_string(),
                status: body.get("status")?.as_str()?.to_string(),
                filled_cents: body.get("filled_cents").and_then(|v| v.as_i64()).unwrap_or(0),
            })
        })();

        match parsed {
            Some(submitted) => Outcome::Success(submitted),
            None => Outcome::Ambiguous("submit response missing fields".to_string()),
        }
    }

    #[instrument(skip(self), name = "venue::cancel")]
    async fn cancel_order(&self, market_id: &str, exchange_order_id: &str) -> Outcome<()> {
        let params = format!("market={market_id}&order_id={exchange_order_id}");
        let now_ms = chrono::Utc::now().timestamp_millis();
        let qs = self.signed_query(&params, now_ms);
        let url = format!("{}/orders?{}", self.base_url, qs);

        let resp = match self.client.delete(&url).send().await {
            Ok(resp) => resp,
            Err(e) => return Outcome::Ambiguous(format!("cancel transport error: {e}")),
        };

        let status = resp.status();
        if status.is_success() {
            return Outcome::Success(());
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            // Already gone: confirmed absent.
            return Outcome::AbsentConfirmed;
        }
        Outcome::Ambiguous(format!("cancel returned {status}"))
    }
}

impl std::fmt::Debug for RestVenueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestVenueClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
