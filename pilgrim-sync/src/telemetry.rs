//! Error reporting for the client side.
//!
//! Every report is logged locally. When an endpoint is configured the event
//! is also POSTed as JSON in the background; delivery failures are logged at
//! debug and otherwise ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Collector URL; `None` keeps reports local.
    pub endpoint: Option<String>,
    /// Request timeout (default: 5s when unset)
    pub timeout: Option<Duration>,
}

/// The JSON body sent to the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub level: TelemetryLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    /// Build an event, dropping the context if it cannot be serialized.
    pub fn new<C: Serialize + ?Sized>(level: TelemetryLevel, message: &str, context: &C) -> Self {
        let context = match serde_json::to_value(context) {
            Ok(serde_json::Value::Null) => None,
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("Telemetry context not serializable, sending without it: {e}");
                None
            }
        };
        Self {
            level,
            message: message.to_string(),
            context,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Default)]
pub struct Telemetry {
    remote: Option<(reqwest::Client, String)>,
}

impl Telemetry {
    /// Local logging only.
    pub fn local() -> Self {
        Self::default()
    }

    pub fn new(config: TelemetryConfig) -> Self {
        let Some(endpoint) = config.endpoint else {
            return Self::local();
        };
        let client = reqwest::Client::builder()
            .timeout(config.timeout.unwrap_or(Duration::from_secs(5)))
            .build();
        match client {
            Ok(client) => Self { remote: Some((client, endpoint)) },
            Err(e) => {
                log::warn!("Telemetry disabled, failed to build HTTP client: {e}");
                Self::local()
            }
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn report<C: Serialize + ?Sized>(&self, level: TelemetryLevel, message: &str, context: &C) {
        let event = TelemetryEvent::new(level, message, context);
        let context = event.context.as_ref().map(|c| c.to_string()).unwrap_or_default();
        match level {
            TelemetryLevel::Info => log::info!("[telemetry] {message} {context}"),
            TelemetryLevel::Warning => log::warn!("[telemetry] {message} {context}"),
            TelemetryLevel::Error => log::error!("[telemetry] {message} {context}"),
        }

        let Some((client, endpoint)) = self.remote.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!("No runtime, telemetry event kept local");
            return;
        };
        runtime.spawn(async move {
            match client.post(&endpoint).json(&event).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    log::debug!("Telemetry collector answered HTTP {}", resp.status());
                }
                Ok(_) => {}
                Err(e) => log::debug!("Telemetry delivery failed: {e}"),
            }
        });
    }

    pub fn error<C: Serialize + ?Sized>(&self, message: &str, context: &C) {
        self.report(TelemetryLevel::Error, message, context);
    }
}
