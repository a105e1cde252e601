use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::FeedsConfig;
use feed_rs::model::{Entry, Feed};
use feed_rs::parser;
use reqwest::{Client, StatusCode};
use tracing::{info, warn};
use url::Url;

use crate::candidate::Candidate;

const USER_AGENT: &str = "HeadlineCurator/0.1";
const MAX_FETCH_ATTEMPTS: u32 = 3;

pub fn http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build reqwest client")
}

/// Fetch and parse one feed. Server errors, 429 and network failures are
/// retried with 1s/2s backoff; other client errors fail immediately.
pub async fn fetch_and_parse_feed(client: &Client, url: &str) -> Result<Feed> {
    let mut last_error = None;

    for attempt in 1..=MAX_FETCH_ATTEMPTS {
        if attempt > 1 {
            let backoff = Duration::from_secs(2u64.pow(attempt - 2));
            info!(url, attempt, "retrying feed fetch after {:?}", backoff);
            tokio::time::sleep(backoff).await;
        }

        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let bytes = response.bytes().await.context("failed to read feed body")?;
                    return parser::parse(bytes.as_ref()).context("failed to parse feed");
                }
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    last_error = Some(anyhow::anyhow!("feed server returned {}", status));
                    continue;
                }
                anyhow::bail!("feed fetch failed with status {}", status);
            }
            Err(e) => {
                last_error = Some(anyhow::Error::new(e).context("network error during feed fetch"));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("feed fetch failed")))
}

/// Recent, unseen entries of `feed` as candidates (ids are assigned by the caller).
pub fn recent_entries(feed: &Feed, cutoff: DateTime<Utc>, seen_links: &mut HashSet<String>) -> Vec<Candidate> {
    feed.entries
        .iter()
        .filter_map(|entry| entry_candidate(entry, cutoff))
        .filter(|c| seen_links.insert(c.link.to_string()))
        .collect()
}

fn entry_candidate(entry: &Entry, cutoff: DateTime<Utc>) -> Option<Candidate> {
    let published_at = entry.published.or(entry.updated)?;
    if published_at < cutoff {
        return None;
    }

    let link = entry
        .links
        .first()
        .map(|l| l.href.trim())
        .filter(|href| !href.is_empty())
        .or_else(|| Some(entry.id.trim()).filter(|id| id.starts_with("http")))
        .and_then(|href| Url::parse(href).ok())?;

    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "No Title".to_string());
    let description = entry
        .summary
        .as_ref()
        .map(|s| s.content.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| title.clone());

    Some(Candidate {
        id: 0,
        title,
        link,
        description,
        published_at,
    })
}

/// Collect candidates from every configured feed. A failing feed is skipped.
pub async fn collect_candidates(config: &FeedsConfig) -> Result<Vec<Candidate>> {
    let client = http_client(config.fetch_timeout_seconds.unwrap_or(10))?;
    let cutoff = Utc::now() - chrono::Duration::hours(config.recency_hours.unwrap_or(26));
    info!(cutoff = %cutoff.format("%Y-%m-%d %H:%M UTC"), feeds = config.urls.len(), "collecting headlines");

    let mut seen_links = HashSet::new();
    let mut candidates = Vec::new();
    for url in &config.urls {
        match fetch_and_parse_feed(&client, url).await {
            Ok(feed) => {
                let fresh = recent_entries(&feed, cutoff, &mut seen_links);
                info!(url = %url, entries = feed.entries.len(), kept = fresh.len(), "feed fetched");
                candidates.extend(fresh);
            }
            Err(e) => warn!(url = %url, "skipping feed: {:#}", e),
        }
    }

    if let Some(max) = config.max_candidates {
        candidates.truncate(max);
    }
    crate::candidate::renumber(&mut candidates);
    info!(count = candidates.len(), "loaded unique headlines");
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rss(items: &str) -> Feed {
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Test</title><link>https://news.example.com</link><description>t</description>{}</channel></rss>"#,
            items
        );
        parser::parse(xml.as_bytes()).unwrap()
    }

    fn item(title: &str, link: &str, date: &str, description: &str) -> String {
        format!(
            "<item><title>{}</title><link>{}</link><pubDate>{}</pubDate><description>{}</description></item>",
            title, link, date, description
        )
    }

    fn cutoff() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-10T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn filters_old_undated_and_repeated_entries() {
        let feed = rss(&[
            item("Fresh", "https://news.example.com/a", "Fri, 10 Jan 2025 06:00:00 +0600", "Body"),
            item("Stale", "https://news.example.com/b", "Wed, 08 Jan 2025 06:00:00 +0000", "Body"),
            item("Repeat", "https://news.example.com/a", "Fri, 10 Jan 2025 08:00:00 +0000", "Body"),
            "<item><title>Undated</title><link>https://news.example.com/c</link></item>".to_string(),
        ]
        .concat());

        let mut seen = HashSet::new();
        let entries = recent_entries(&feed, cutoff(), &mut seen);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Fresh");
        assert_eq!(entries[0].link.as_str(), "https://news.example.com/a");
    }

    #[test]
    fn links_seen_in_earlier_feeds_are_skipped() {
        let feed = rss(&item("Again", "https://news.example.com/a", "Fri, 10 Jan 2025 08:00:00 +0000", "x"));
        let mut seen = HashSet::from(["https://news.example.com/a".to_string()]);
        assert!(recent_entries(&feed, cutoff(), &mut seen).is_empty());
    }

    #[test]
    fn description_falls_back_to_title() {
        let feed = rss(&item("  Budget passed  ", "https://news.example.com/d", "Fri, 10 Jan 2025 08:00:00 +0000", ""));
        let entries = recent_entries(&feed, cutoff(), &mut HashSet::new());
        assert_eq!(entries[0].title, "Budget passed");
        assert_eq!(entries[0].description, "Budget passed");
    }

    #[tokio::test]
    async fn fetch_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/feed")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/feed")
            .with_status(200)
            .with_body(
                r#"<rss version="2.0"><channel><title>T</title><link>https://x.example</link><description>d</description></channel></rss>"#,
            )
            .create_async()
            .await;

        let client = http_client(5).unwrap();
        let feed = fetch_and_parse_feed(&client, &format!("{}/feed", server.url()))
            .await
            .unwrap();
        assert!(feed.entries.is_empty());
        failing.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_gives_up_on_client_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/feed").with_status(404).expect(1).create_async().await;

        let client = http_client(5).unwrap();
        let err = fetch_and_parse_feed(&client, &format!("{}/feed", server.url()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
        mock.assert_async().await;
    }
}
