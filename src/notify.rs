use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{AppConfig, ConfigError, DesktopConfig, PushConfig, SettingsStore};
use crate::watch::Notification;

/// Sends closer together than this are dropped.
pub const MIN_NOTIFICATION_INTERVAL_MS: i64 = 5000;

pub const LOCAL_TITLE: &str = "DATE IS AVAILABLE!";
pub const LOCAL_FALLBACK_MESSAGE: &str = "A matching date has been found!";
pub const PUSH_TITLE: &str = "SUSPECT DETECTED!";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("disabled")]
    Disabled,
    #[error("missing credentials")]
    MissingCredentials,
    #[error("HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("desktop notification failed: {0}")]
    Desktop(String),
}

/// Local notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalNotification {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub priority: u8,
}

impl LocalNotification {
    pub fn for_match(notification: &Notification) -> Self {
        let message = if notification.message.is_empty() {
            LOCAL_FALLBACK_MESSAGE.to_string()
        } else {
            notification.message.clone()
        };
        Self {
            kind: "basic".to_string(),
            title: LOCAL_TITLE.to_string(),
            message,
            priority: 2,
        }
    }
}

/// Push service request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushNote {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub body: String,
}

impl PushNote {
    pub fn for_match(notification: &Notification) -> Self {
        Self {
            kind: "note".to_string(),
            title: PUSH_TITLE.to_string(),
            body: format!(
                "Match found!\nText: {}\nURL: {}",
                notification.details.text, notification.details.url
            ),
        }
    }
}

/// A notification sink.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

pub struct DesktopChannel {
    config: DesktopConfig,
}

impl DesktopChannel {
    pub fn new(config: DesktopConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Channel for DesktopChannel {
    fn name(&self) -> &'static str {
        "desktop"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if !self.config.enabled {
            return Err(NotifyError::Disabled);
        }
        show_desktop(&LocalNotification::for_match(notification), self.config.timeout_ms)
    }
}

#[cfg(target_os = "windows")]
fn show_desktop(local: &LocalNotification, _timeout_ms: u32) -> Result<(), NotifyError> {
    use winrt_notification::Toast;

    Toast::new(Toast::POWERSHELL_APP_ID)
        .title(&local.title)
        .text1(&local.message)
        .show()
        .map_err(|e| NotifyError::Desktop(e.to_string()))
}

#[cfg(not(target_os = "windows"))]
fn show_desktop(local: &LocalNotification, timeout_ms: u32) -> Result<(), NotifyError> {
    use notify_rust::Notification as DesktopNotification;

    match DesktopNotification::new()
        .summary(&local.title)
        .body(&local.message)
        .timeout(notify_rust::Timeout::Milliseconds(timeout_ms))
        .show()
    {
        Ok(_) => Ok(()),
        Err(e) => Err(NotifyError::Desktop(e.to_string())),
    }
}

pub struct PushChannel {
    client: reqwest::Client,
    config: PushConfig,
}

impl PushChannel {
    pub fn new(config: PushConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Channel for PushChannel {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if !self.config.enabled {
            return Err(NotifyError::Disabled);
        }
        if self.config.access_token.is_empty() || self.config.api_url.is_empty() {
            return Err(NotifyError::MissingCredentials);
        }

        let response = self
            .client
            .post(&self.config.api_url)
            .header("Access-Token", &self.config.access_token)
            .json(&PushNote::for_match(notification))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }

        let data: serde_json::Value = response.json().await.unwrap_or_default();
        log::info!("[notify] push notification sent: {}", data);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelResult {
    pub channel: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub skipped: bool,
    pub reason: Option<String>,
    pub results: Vec<ChannelResult>,
}

impl DeliveryReport {
    fn skipped(reason: &str) -> Self {
        Self {
            skipped: true,
            reason: Some(reason.to_string()),
            results: Vec::new(),
        }
    }

    pub fn summary(&self) -> String {
        if self.skipped {
            return format!("skipped: {}", self.reason.as_deref().unwrap_or(""));
        }
        let ok = self.results.iter().filter(|r| r.ok).count();
        format!("sent: {}/{}", ok, self.results.len())
    }
}

/// Gates notifications on the stored monitoring state and the rate limit,
/// then fans them out to every channel.
pub struct Notifier {
    store: Arc<dyn SettingsStore>,
    channels: Vec<Box<dyn Channel>>,
}

impl Notifier {
    pub fn new(store: Arc<dyn SettingsStore>, channels: Vec<Box<dyn Channel>>) -> Self {
        Self { store, channels }
    }

    pub fn from_config(store: Arc<dyn SettingsStore>, config: &AppConfig) -> Self {
        Self::new(
            store,
            vec![
                Box::new(DesktopChannel::new(config.channels.desktop.clone())),
                Box::new(PushChannel::new(config.channels.push.clone())),
            ],
        )
    }

    pub async fn deliver(&self, notification: &Notification) -> Result<DeliveryReport, ConfigError> {
        self.deliver_at(notification, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// Deliver as of `now_ms` (Unix milliseconds).
    pub async fn deliver_at(
        &self,
        notification: &Notification,
        now_ms: i64,
    ) -> Result<DeliveryReport, ConfigError> {
        let mut skip: Option<&'static str> = None;
        self.store.update(&mut |state| {
            if !state.monitoring_state {
                skip = Some("monitoring stopped");
            } else if now_ms.saturating_sub(state.last_notification_time)
                < MIN_NOTIFICATION_INTERVAL_MS
            {
                skip = Some("rate limited");
            } else {
                skip = None;
                state.last_notification_time = now_ms;
            }
        })?;

        if let Some(reason) = skip {
            log::debug!("[notify] {}", reason);
            return Ok(DeliveryReport::skipped(reason));
        }
        Ok(self.send_all(notification).await)
    }

    /// Send to every channel without gating. Failures are logged and
    /// reported, never retried.
    pub async fn send_all(&self, notification: &Notification) -> DeliveryReport {
        let mut results = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let result = match channel.send(notification).await {
                Ok(()) => ChannelResult {
                    channel: channel.name().to_string(),
                    ok: true,
                    error: None,
                },
                Err(e) => {
                    log::error!("[notify][{}] {}", channel.name(), e);
                    ChannelResult {
                        channel: channel.name().to_string(),
                        ok: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(result);
        }
        DeliveryReport {
            skipped: false,
            reason: None,
            results,
        }
    }
}

/// Deliver every notification from `rx` until the sender side closes.
pub async fn run_notifier(notifier: Notifier, mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        match notifier.deliver(&notification).await {
            Ok(report) => log::info!("[notify] {}", report.summary()),
            Err(e) => log::error!("[notify] failed to read notification state: {}", e),
        }
    }
}
