mod relays;
#[cfg(feature = "sim")]
mod sim;

use anyhow::{Context, Result};
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relays::{RelayEntry, Skip};

// ---------------------------------------------------------------------------
// Relay source
// ---------------------------------------------------------------------------

enum Source {
    Ipx { url: String, api_key: String },
    #[cfg(feature = "sim")]
    Sim(sim::RelayBoard),
}

impl Source {
    async fn relays(&mut self, http: &reqwest::Client) -> Result<Vec<RelayEntry>> {
        match self {
            Self::Ipx { url, api_key } => fetch_relays(http, url, api_key).await,
            #[cfg(feature = "sim")]
            Self::Sim(board) => Ok(board.poll()),
        }
    }
}

fn relay_list_url(ipx_url: &str) -> String {
    format!("{}/api/xdevices.json", ipx_url.trim_end_matches('/'))
}

fn event_url(bridge_url: &str) -> String {
    format!("{}/ipx-event", bridge_url.trim_end_matches('/'))
}

async fn fetch_relays(
    http: &reqwest::Client,
    ipx_url: &str,
    api_key: &str,
) -> Result<Vec<RelayEntry>> {
    let list = http
        .get(relay_list_url(ipx_url))
        .query(&[("key", api_key)])
        .send()
        .await
        .context("IPX800 unreachable")?
        .error_for_status()
        .context("IPX800 refused the relay list request")?
        .json::<Vec<RelayEntry>>()
        .await
        .context("IPX800 relay list is not a JSON array")?;
    Ok(list)
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    sent: usize,
    skipped: usize,
    failed: usize,
}

async fn forward(http: &reqwest::Client, bridge_url: &str, entries: &[RelayEntry]) -> Tally {
    let url = event_url(bridge_url);
    let mut tally = Tally::default();

    for entry in entries {
        let event = match entry.to_event() {
            Ok(ev) => ev,
            Err(Skip::MissingId) => {
                warn!(relay = entry.display_name(), "poller: relay without id, skipped");
                tally.skipped += 1;
                continue;
            }
            Err(Skip::UnknownValue(v)) => {
                warn!(
                    relay = entry.display_name(),
                    value = %v,
                    "poller: unknown relay value, skipped"
                );
                tally.skipped += 1;
                continue;
            }
        };

        let res = http
            .post(&url)
            .json(&event)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match res {
            Ok(_) => {
                info!(
                    device = %event.device_id,
                    etat = event.etat,
                    "poller: forwarded"
                );
                tally.sent += 1;
            }
            Err(e) => {
                warn!(device = %event.device_id, error = %e, "poller: bridge rejected event");
                tally.failed += 1;
            }
        }
    }

    tally
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let ipx_url = env::var("IPX_URL").ok().filter(|s| !s.trim().is_empty());
    let api_key = env::var("IPX_API_KEY").unwrap_or_default();
    let bridge_url =
        env::var("BRIDGE_URL").unwrap_or_else(|_| "http://127.0.0.1:5000".to_string());
    let poll_every_s: u64 = env::var("POLL_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let mut source = pick_source(ipx_url, api_key);
    info!(bridge = %bridge_url, every_s = poll_every_s, "poller: starting");

    loop {
        match source.relays(&http).await {
            Ok(entries) => {
                let tally = forward(&http, &bridge_url, &entries).await;
                info!(
                    relays = entries.len(),
                    sent = tally.sent,
                    skipped = tally.skipped,
                    failed = tally.failed,
                    "poller: cycle done"
                );
            }
            Err(e) => {
                let msg = format!("{e:#}");
                warn!(error = %msg, "poller: relay fetch failed");
            }
        }

        if poll_every_s == 0 {
            return Ok(());
        }
        sleep(Duration::from_secs(poll_every_s)).await;
    }
}

#[cfg(feature = "sim")]
fn pick_source(ipx_url: Option<String>, api_key: String) -> Source {
    match ipx_url {
        Some(url) => {
            info!(ipx = %url, "poller: polling IPX800");
            Source::Ipx { url, api_key }
        }
        None => {
            let count: usize = env::var("SIM_RELAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8);
            let scenario = sim::Scenario::from_str_lossy(
                &env::var("SIM_SCENARIO").unwrap_or_default(),
            );
            info!(relays = count, scenario = %scenario, "poller: IPX_URL unset, simulating board");
            Source::Sim(sim::RelayBoard::new(scenario, count))
        }
    }
}

#[cfg(not(feature = "sim"))]
fn pick_source(ipx_url: Option<String>, api_key: String) -> Source {
    let url = ipx_url.unwrap_or_else(|| "http://192.168.1.28".to_string());
    info!(ipx = %url, "poller: polling IPX800");
    Source::Ipx { url, api_key }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn entries(json: &str) -> Vec<RelayEntry> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn urls_tolerate_trailing_slash() {
        assert_eq!(
            relay_list_url("http://192.168.1.28/"),
            "http://192.168.1.28/api/xdevices.json"
        );
        assert_eq!(event_url("http://127.0.0.1:5000"), "http://127.0.0.1:5000/ipx-event");
    }

    #[tokio::test]
    async fn fetch_passes_api_key() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/xdevices.json")
            .match_query(Matcher::UrlEncoded("key".into(), "s3cret".into()))
            .with_status(200)
            .with_body(r#"[{"id":"1","name":"garage","value":"1"}]"#)
            .create_async()
            .await;

        let http = reqwest::Client::new();
        let list = fetch_relays(&http, &server.url(), "s3cret").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].display_name(), "garage");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_rejects_non_array() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/xdevices.json")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"error":"bad key"}"#)
            .create_async()
            .await;

        let http = reqwest::Client::new();
        assert!(fetch_relays(&http, &server.url(), "x").await.is_err());
    }

    #[tokio::test]
    async fn forward_posts_valid_entries_only() {
        let mut server = Server::new_async().await;
        let on = server
            .mock("POST", "/ipx-event")
            .match_body(Matcher::Json(
                serde_json::json!({"device_id": "12", "etat": "on"}),
            ))
            .with_status(200)
            .create_async()
            .await;
        let off = server
            .mock("POST", "/ipx-event")
            .match_body(Matcher::Json(
                serde_json::json!({"device_id": "27", "etat": "off"}),
            ))
            .with_status(200)
            .create_async()
            .await;

        let list = entries(
            r#"[
                {"id":"12","name":"garage","value":"1"},
                {"id":"27","name":"congelateur","value":0},
                {"name":"orphan","value":"1"},
                {"id":"5","value":"2"}
            ]"#,
        );
        let http = reqwest::Client::new();
        let tally = forward(&http, &server.url(), &list).await;

        assert_eq!(
            tally,
            Tally {
                sent: 2,
                skipped: 2,
                failed: 0
            }
        );
        on.assert_async().await;
        off.assert_async().await;
    }

    #[tokio::test]
    async fn forward_counts_bridge_errors() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/ipx-event")
            .with_status(400)
            .create_async()
            .await;

        let http = reqwest::Client::new();
        let tally = forward(&http, &server.url(), &entries(r#"[{"id":"3","value":"1"}]"#)).await;
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.sent, 0);
    }
}
