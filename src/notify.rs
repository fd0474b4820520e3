//! Push alerts for new listings.
//!
//! A listing that only "became new" because something above it sold and the
//! feed reshuffled is noise. Only new listings near the top of the feed are
//! alerted; `AlertPolicy` holds the rule so it can be tuned per site.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::data_models::Listing;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    pub topic: String,
    pub message: String,
    pub title: Option<String>,
    /// 1 (min) to 5 (max).
    pub priority: Option<u8>,
    pub tags: Vec<String>,
    pub link: Option<String>,
    pub image: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Publishes to an ntfy server (`POST {server}/{topic}`).
pub struct NtfyNotifier {
    client: reqwest::Client,
    server: String,
}

impl NtfyNotifier {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            server: server.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if notification.topic.is_empty() || notification.message.is_empty() {
            anyhow::bail!("ntfy notification not sent, topic and/or message is empty");
        }

        let mut request = self
            .client
            .post(format!("{}/{}", self.server, notification.topic))
            .body(notification.message.clone());
        if let Some(title) = &notification.title {
            request = request.header("Title", title);
        }
        if let Some(priority) = notification.priority {
            request = request.header("Priority", priority.to_string());
        }
        if !notification.tags.is_empty() {
            request = request.header("Tags", notification.tags.join(","));
        }
        if let Some(link) = &notification.link {
            request = request.header("Click", link);
        }
        if let Some(image) = &notification.image {
            request = request.header("Attach", image);
        }

        let response = request.send().await.context("Failed to reach ntfy server")?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ntfy rejected notification: {status} - {body}");
        }
        log::info!("ntfy notification sent");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertPolicy {
    /// Position → priority for the top of the feed.
    pub priorities: BTreeMap<u32, u8>,
    pub default_priority: u8,
    /// Positions within this leading fraction of the batch are always alerted.
    pub upper_fraction: f64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        AlertPolicy {
            priorities: BTreeMap::from([(1, 5), (2, 4), (3, 4), (4, 3), (5, 3)]),
            default_priority: 2,
            upper_fraction: 0.5,
        }
    }
}

impl AlertPolicy {
    pub fn priority(&self, position: u32) -> u8 {
        self.priorities
            .get(&position)
            .copied()
            .unwrap_or(self.default_priority)
    }

    pub fn in_upper_part(&self, position: u32, batch_len: usize) -> bool {
        position >= 1 && f64::from(position) <= batch_len as f64 * self.upper_fraction
    }

    pub fn should_alert(&self, position: u32, batch_len: usize) -> bool {
        self.in_upper_part(position, batch_len) || self.priorities.contains_key(&position)
    }
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub topic: String,
    /// Individually detailed alerts per crawl; `None` is unbounded.
    pub limit: Option<usize>,
    pub policy: AlertPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifyReport {
    pub sent: usize,
    pub suppressed: usize,
    pub failed: usize,
    /// Alerts folded into the trailing summary.
    pub summarized: usize,
}

/// Alert-worthy subset of `new_listings`, in position order, with priorities.
pub fn select_alerts<'a>(
    policy: &AlertPolicy,
    new_listings: &'a [Listing],
    batch_len: usize,
) -> Vec<(&'a Listing, u8)> {
    new_listings
        .iter()
        .filter(|listing| policy.should_alert(listing.position, batch_len))
        .map(|listing| (listing, policy.priority(listing.position)))
        .collect()
}

pub fn listing_notification(topic: &str, listing: &Listing, priority: u8) -> Notification {
    let message = [listing.price.as_deref(), listing.location.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" - ");
    Notification {
        topic: topic.to_string(),
        message: if message.is_empty() {
            listing.url.clone()
        } else {
            message
        },
        title: Some(format!("New: {}", listing.label())),
        priority: Some(priority),
        tags: vec!["shopping_cart".to_string()],
        link: Some(listing.url.clone()),
        image: listing.image.clone(),
    }
}

/// Failures are logged and counted, never propagated.
pub async fn notify_new_listings(
    notifier: &dyn Notifier,
    config: &NotifyConfig,
    new_listings: &[Listing],
    batch_len: usize,
) -> NotifyReport {
    let alerts = select_alerts(&config.policy, new_listings, batch_len);
    let mut report = NotifyReport {
        suppressed: new_listings.len() - alerts.len(),
        ..NotifyReport::default()
    };
    if report.suppressed > 0 {
        log::debug!("suppressed {} reshuffled listings", report.suppressed);
    }

    let detailed = config.limit.unwrap_or(alerts.len()).min(alerts.len());
    for (listing, priority) in &alerts[..detailed] {
        let notification = listing_notification(&config.topic, listing, *priority);
        match notifier.send(&notification).await {
            Ok(()) => report.sent += 1,
            Err(e) => {
                log::error!("failed to send alert for {}: {:#}", listing.url, e);
                report.failed += 1;
            }
        }
    }

    let overflow = alerts.len() - detailed;
    if overflow > 0 {
        let summary = Notification {
            topic: config.topic.clone(),
            message: format!("{overflow} more new listings"),
            title: Some("More new listings".to_string()),
            priority: Some(config.policy.default_priority),
            ..Notification::default()
        };
        match notifier.send(&summary).await {
            Ok(()) => report.summarized = overflow,
            Err(e) => {
                log::error!("failed to send summary alert: {:#}", e);
                report.failed += 1;
            }
        }
    }

    report
}
