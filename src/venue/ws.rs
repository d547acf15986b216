// =============================================================================
// Venue WebSocket Ingest — book frames into immutable snapshots
// =============================================================================
//
// Connects to the venue's market-data WebSocket, subscribes to best-of-book
// and depth for the watchlist, and turns every frame into an immutable
// Snapshot. The coordinator's WS epoch is bumped on every disconnect, which
// instantly invalidates all snapshots captured under the old epoch.
//
// Runs until the stream disconnects or an error occurs, then returns so the
// caller (main.rs) can handle reconnection.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::snapshot::{BookLevel, SideBook, Snapshot, SnapshotSource, SnapshotStore, DEPTH_K};

/// Per-market change tracking: content hash of the last book and the time
/// it last changed.
#[derive(Default)]
pub struct IngestState {
    last_books: Mutex<HashMap<String, (String, i64)>>,
}

impl IngestState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Connect, subscribe to `markets`, and feed snapshots into `snapshots`
/// until the stream ends.
pub async fn run_market_stream(
    url: &str,
    markets: &[String],
    app: &Arc<AppState>,
    snapshots: &Arc<SnapshotStore>,
    ingest: &Arc<IngestState>,
) -> Result<()> {
    info!(url = %url, markets = markets.len(), "connecting to market WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to market WebSocket")?;

    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({
        "op": "subscribe",
        "channels": ["book"],
        "markets": markets,
    });
    write
        .send(tokio_tungstenite::tungstenite::Message::Text(
            subscribe.to_string(),
        ))
        .await
        .context("failed to send subscription")?;

    app.ws_set_connected(true);
    info!("market WebSocket connected and subscribed");

    let result = loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    app.ws_note_message(now_ms);
                    match parse_book_frame(&text) {
                        Ok(Some(frame)) => {
                            ingest_frame(frame, now_ms, app, snapshots, ingest);
                        }
                        Ok(None) => {} // heartbeat or non-book frame
                        Err(e) => {
                            warn!(error = %e, "failed to parse book frame");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "market WebSocket read error");
                break Err(e.into());
            }
            None => {
                warn!("market WebSocket stream ended");
                break Ok(());
            }
        }
    };

    // Any exit from the read loop is a disconnect: bump the epoch.
    app.ws_set_connected(false);
    result
}

/// A parsed book frame for one market.
#[derive(Debug)]
pub struct BookFrame {
    pub market_id: String,
    pub yes: SideBook,
    pub no: SideBook,
}

fn ingest_frame(
    frame: BookFrame,
    now_ms: i64,
    app: &Arc<AppState>,
    snapshots: &Arc<SnapshotStore>,
    ingest: &Arc<IngestState>,
) {
    // Probe the content hash first so orderbook_last_change_ms only moves
    // when the book actually changed.
    let probe = Snapshot::new(
        String::new(),
        frame.market_id.clone(),
        now_ms,
        SnapshotSource::Ws,
        app.ws_epoch(),
        now_ms,
        now_ms,
        now_ms,
        frame.yes.clone(),
        frame.no.clone(),
    );

    let last_change_ms = {
        let mut books = ingest.last_books.lock();
        match books.get(&frame.market_id) {
            Some((hash, changed_ms)) if *hash == probe.content_hash => *changed_ms,
            _ => {
                books.insert(frame.market_id.clone(), (probe.content_hash.clone(), now_ms));
                now_ms
            }
        }
    };

    let snap = Snapshot::new(
        Uuid::new_v4().to_string(),
        frame.market_id,
        now_ms,
        SnapshotSource::Ws,
        app.ws_epoch(),
        now_ms,
        now_ms,
        last_change_ms,
        frame.yes,
        frame.no,
    );
    snapshots.insert(snap);
}

/// Parse a venue book frame.
///
/// Expected shape:
/// ```json
/// {
///   "type": "book",
///   "market": "mkt-abc",
///   "yes": { "bids": [["0.42", "150.0"], ...], "asks": [["0.44", "90.0"], ...] },
///   "no":  { "bids": [...], "asks": [...] }
/// }
/// ```
pub fn parse_book_frame(text: &str) -> Result<Option<BookFrame>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse frame JSON")?;

    if root.get("type").and_then(|v| v.as_str()) != Some("book") {
        return Ok(None);
    }

    let market_id = root
        .get("market")
        .and_then(|v| v.as_str())
        .context("book frame missing 'market'")?
        .to_string();

    let yes = parse_side(root.get("yes").context("book frame missing 'yes'")?)?;
    let no = parse_side(root.get("no").context("book frame missing 'no'")?)?;

    Ok(Some(BookFrame { market_id, yes, no }))
}

fn parse_side(value: &serde_json::Value) -> Result<SideBook> {
    let bids = parse_levels(value.get("bids").context("side missing 'bids'")?);
    let asks = parse_levels(value.get("asks").context("side missing 'asks'")?);

    Ok(SideBook {
        best_bid: bids.first().map(|l| l.price),
        best_ask: asks.first().map(|l| l.price),
        bids,
        asks,
    })
}

fn parse_levels(value: &serde_json::Value) -> Vec<BookLevel> {
    value
        .as_array()
        .map(|levels| {
            levels
                .iter()
                .take(DEPTH_K)
                .filter_map(|entry| {
                    let price: f64 = entry.get(0)?.as_str()?.parse().ok()?;
                    let size_usd: f64 = entry.get(1)?.as_str()?.parse().ok()?;
                    Some(BookLevel { price, size_usd })
                })
                .collect()
        })
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = r#"{
        "type": "book",
        "market": "mkt-1",
        "yes": { "bids": [["0.42", "150.0"], ["0.41", "80.0"]], "asks": [["0.44", "90.0"]] },
        "no":  { "bids": [["0.55", "60.0"]], "asks": [["0.57", "70.0"]] }
    }"#;

    #[test]
    fn parses_book_frame() {
        let frame = parse_book_frame(FRAME).unwrap().unwrap();
        assert_eq!(frame.market_id, "mkt-1");
        assert_eq!(frame.yes.best_bid, Some(0.42));
        assert_eq!(frame.yes.best_ask, Some(0.44));
        assert_eq!(frame.yes.bids.len(), 2);
        assert_eq!(frame.no.best_ask, Some(0.57));
    }

    #[test]
    fn non_book_frames_are_skipped() {
        let heartbeat = r#"{ "type": "heartbeat", "ts": 1 }"#;
        assert!(parse_book_frame(heartbeat).unwrap().is_none());
    }

    #[test]
    fn malformed_frame_is_an_error() {
        assert!(parse_book_frame("not json").is_err());
        assert!(parse_book_frame(r#"{ "type": "book" }"#).is_err());
    }

    #[test]
    fn depth_is_truncated_to_k() {
        let deep = r#"{
            "type": "book",
            "market": "mkt-1",
            "yes": { "bids": [["0.42","1"],["0.41","1"],["0.40","1"],["0.39","1"]], "asks": [["0.44","1"]] },
            "no":  { "bids": [["0.55","1"]], "asks": [["0.57","1"]] }
        }"#;
        let frame = parse_book_frame(deep).unwrap().unwrap();
        assert_eq!(frame.yes.bids.len(), DEPTH_K);
    }
}
