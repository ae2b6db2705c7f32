use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::logging::{info, obj, v_int, v_str, Domain};
use crate::model::{Forecast, Round};
use crate::source::retry::StatusError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    /// New forecast, announced together with the round that triggered it.
    pub fn forecast_broadcast(forecast: &Forecast, round: &Round) -> Self {
        let mut body = format!(
            "Round {}: {} = {} ({}, {})\n",
            round.id,
            round.draw,
            round.sum,
            round.parity.as_str(),
            round.magnitude.as_str()
        );
        body.push_str(&format!(
            "Next {}: {} = {} ({})\n",
            forecast.target,
            forecast.draw,
            forecast.sum,
            forecast.parity.as_str()
        ));
        body.push_str(&format!("Algorithm: {} {}", forecast.algorithm, forecast.version));
        Self { title: format!("Forecast for round {}", forecast.target), body }
    }

    /// Result of a verified forecast. Pending forecasts render as pending.
    pub fn verification(forecast: &Forecast) -> Self {
        let body = match &forecast.outcome {
            Some(o) => format!(
                "Predicted {} = {}, actual {} = {}\nMatch: {} ({} positions), {}",
                forecast.draw,
                forecast.sum,
                o.actual,
                o.actual_sum,
                o.match_type.as_str(),
                o.matched_positions.len(),
                if o.correct { "correct" } else { "incorrect" }
            ),
            None => format!("Predicted {} = {}, awaiting result", forecast.draw, forecast.sum),
        };
        Self { title: format!("Verification for round {}", forecast.target), body }
    }
}

/// Delivers notifications. Failures are the caller's to log; they never
/// undo the write that produced the notification.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, notification: &Notification, destinations: &[String]) -> Result<()>;

    fn kind(&self) -> &'static str {
        "custom"
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    destinations: &'a [String],
    title: &'a str,
    body: &'a str,
}

pub struct WebhookPublisher {
    client: Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, notification: &Notification, destinations: &[String]) -> Result<()> {
        let payload = WebhookPayload {
            destinations,
            title: &notification.title,
            body: &notification.body,
        };
        let resp = self.client.post(&self.url).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StatusError(status.as_u16()).into());
        }
        info(
            Domain::Notify,
            "delivered",
            obj(&[("title", v_str(&notification.title)), ("destinations", v_int(destinations.len() as i64))]),
        );
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "webhook"
    }
}

/// Writes notifications to the event log only.
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, notification: &Notification, destinations: &[String]) -> Result<()> {
        info(
            Domain::Notify,
            "notification",
            obj(&[
                ("title", v_str(&notification.title)),
                ("body", v_str(&notification.body)),
                ("destinations", v_str(&destinations.join(","))),
            ]),
        );
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "log"
    }
}

/// Webhook when `NOTIFY_URL` is set, log-only otherwise.
pub fn publisher_from_config(cfg: &Config) -> Result<Arc<dyn Publisher>> {
    match &cfg.notify_url {
        Some(url) => Ok(Arc::new(WebhookPublisher::new(url, Duration::from_millis(cfg.notify_timeout_ms))?)),
        None => Ok(Arc::new(LogPublisher)),
    }
}
