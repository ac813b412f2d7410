use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use serde_json::json;
use tokio::sync::RwLock;

use crate::crd::AlertChannel;
use crate::types::AlertSeverity;

const CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);
const SUPPRESSION_WINDOW_MINUTES: i64 = 5;

/* ============================= TYPES ============================= */

/// One alert to fan out to every configured channel.
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub cluster_name: String,
    pub namespace: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub details: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOutcome {
    pub channel: String,
    pub sent: bool,
    pub error: Option<String>,
}

/// Outcome of one alert-manager dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertDispatchResult {
    pub channels: Vec<ChannelOutcome>,
    pub suppressed: bool,
    /// Overall failure only when every configured channel failed.
    pub success: bool,
}

/* ============================= SUPPRESSION ============================= */

/// In-process suppression of repeat alerts for the same
/// `(namespace, cluster, severity)` within a fixed window, so a cluster
/// stuck at one threshold doesn't re-page on every reconcile tick.
#[derive(Default)]
pub struct SuppressionTracker {
    last_sent: RwLock<HashMap<(String, String, String), DateTime<Utc>>>,
}

impl SuppressionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, cluster: &str, severity: AlertSeverity) -> (String, String, String) {
        (namespace.to_string(), cluster.to_string(), severity.to_string())
    }

    /// Returns true when an alert for this key was already sent within
    /// the suppression window and should be dropped.
    async fn is_suppressed(&self, namespace: &str, cluster: &str, severity: AlertSeverity, now: DateTime<Utc>) -> bool {
        let key = Self::key(namespace, cluster, severity);
        match self.last_sent.read().await.get(&key) {
            Some(last) => now - *last < chrono::Duration::minutes(SUPPRESSION_WINDOW_MINUTES),
            None => false,
        }
    }

    async fn record_sent(&self, namespace: &str, cluster: &str, severity: AlertSeverity, now: DateTime<Utc>) {
        let key = Self::key(namespace, cluster, severity);
        self.last_sent.write().await.insert(key, now);
    }

    /// Drops every suppression entry for a cluster, regardless of
    /// severity. Called when circuit-breaker reset clears the slate.
    pub async fn clear_suppression(&self, namespace: &str, cluster: &str) {
        self.last_sent.write().await.retain(|(ns, name, _), _| !(ns == namespace && name == cluster));
    }
}

/* ============================= ALERT MANAGER ============================= */

pub struct AlertManager {
    client: Client,
    http: reqwest::Client,
    suppression: SuppressionTracker,
}

impl AlertManager {
    pub fn new(client: Client) -> Self {
        let http = reqwest::Client::builder()
            .timeout(CHANNEL_TIMEOUT)
            .build()
            .expect("reqwest client builder should not fail with static config");
        Self { client, http, suppression: SuppressionTracker::new() }
    }

    pub fn suppression(&self) -> &SuppressionTracker {
        &self.suppression
    }

    /// Sends `request` to every channel, tolerating a single channel's
    /// failure. Overall success requires at least one channel to accept
    /// the alert (or no channels configured, which is a no-op success).
    /// Repeat alerts within the suppression window are dropped entirely
    /// and reported with `suppressed: true`, no channel calls made.
    pub async fn dispatch(&self, request: &AlertRequest, channels: &[AlertChannel], now: DateTime<Utc>) -> AlertDispatchResult {
        if self.suppression.is_suppressed(&request.namespace, &request.cluster_name, request.severity, now).await {
            return AlertDispatchResult { channels: Vec::new(), suppressed: true, success: true };
        }

        let mut outcomes = Vec::with_capacity(channels.len());
        for channel in channels {
            let outcome = self.send_one(request, channel).await;
            outcomes.push(outcome);
        }

        let success = channels.is_empty() || outcomes.iter().any(|o| o.sent);
        if success {
            self.suppression.record_sent(&request.namespace, &request.cluster_name, request.severity, now).await;
        }

        AlertDispatchResult { channels: outcomes, suppressed: false, success }
    }

    async fn send_one(&self, request: &AlertRequest, channel: &AlertChannel) -> ChannelOutcome {
        let result = match channel {
            AlertChannel::AlertBus { endpoint } => self.send_alert_bus(request, endpoint).await,
            AlertChannel::Chat { secret_name } => self.send_chat(request, secret_name).await,
            AlertChannel::Paging { secret_name } => self.send_paging(request, secret_name).await,
        };

        match result {
            Ok(()) => ChannelOutcome { channel: channel_label(channel), sent: true, error: None },
            Err(err) => ChannelOutcome { channel: channel_label(channel), sent: false, error: Some(err.to_string()) },
        }
    }

    async fn send_alert_bus(&self, request: &AlertRequest, endpoint: &str) -> anyhow::Result<()> {
        let mut labels = serde_json::Map::new();
        labels.insert("alertname".to_string(), json!("PgGuardStorage"));
        labels.insert("severity".to_string(), json!(request.severity.to_string().to_lowercase()));
        labels.insert("cluster".to_string(), json!(request.cluster_name));
        labels.insert("namespace".to_string(), json!(request.namespace));
        for (k, v) in &request.details {
            labels.insert(k.clone(), json!(v));
        }

        let body = json!([{
            "labels": labels,
            "annotations": {
                "summary": request.message,
                "description": format!("{} / {}: {}", request.namespace, request.cluster_name, request.message),
            },
        }]);
        self.http.post(alert_bus_url(endpoint)).json(&body).send().await?.error_for_status()?;
        Ok(())
    }

    async fn send_chat(&self, request: &AlertRequest, secret_name: &str) -> anyhow::Result<()> {
        let url = self.secret_value(&request.namespace, secret_name, "webhook-url").await?;
        let channel = self
            .secret_value(&request.namespace, secret_name, "channel")
            .await
            .unwrap_or_else(|_| format!("#{}-storage-alerts", request.namespace));

        let fields: Vec<_> = request
            .details
            .iter()
            .map(|(k, v)| json!({ "title": k, "value": v, "short": true }))
            .collect();

        let body = json!({
            "channel": channel,
            "attachments": [{
                "color": chat_color(request.severity),
                "title": format!("{} / {}: {}", request.namespace, request.cluster_name, request.severity),
                "text": request.message,
                "fields": fields,
            }],
        });
        self.http.post(&url).json(&body).send().await?.error_for_status()?;
        Ok(())
    }

    async fn send_paging(&self, request: &AlertRequest, secret_name: &str) -> anyhow::Result<()> {
        let routing_key = self.secret_value(&request.namespace, secret_name, "routing-key").await?;
        let body = json!({
            "routing_key": routing_key,
            "event_action": "trigger",
            "dedup_key": dedup_key(&request.namespace, &request.cluster_name),
            "payload": {
                "summary": request.message,
                "source": request.cluster_name,
                "severity": paging_severity(request.severity),
                "timestamp": request.timestamp.to_rfc3339(),
                "custom_details": request.details,
            },
        });
        self.http
            .post("https://events.pagerduty.com/v2/enqueue")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn secret_value(&self, namespace: &str, secret_name: &str, key: &str) -> anyhow::Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(secret_name).await?;
        let bytes = secret
            .data
            .and_then(|d| d.get(key).cloned())
            .ok_or_else(|| anyhow::anyhow!("secret '{secret_name}' has no key '{key}'"))?;
        Ok(String::from_utf8(bytes.0)?)
    }
}

fn channel_label(channel: &AlertChannel) -> String {
    match channel {
        AlertChannel::AlertBus { .. } => "alert-bus".to_string(),
        AlertChannel::Chat { .. } => "chat".to_string(),
        AlertChannel::Paging { .. } => "paging".to_string(),
    }
}

fn paging_severity(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Warning => "warning",
        AlertSeverity::Critical => "error",
        AlertSeverity::Emergency => "critical",
    }
}

fn chat_color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Warning => "yellow",
        AlertSeverity::Critical => "orange",
        AlertSeverity::Emergency => "red",
    }
}

fn dedup_key(namespace: &str, cluster_name: &str) -> String {
    format!("cnpg-storage-{namespace}-{cluster_name}")
}

/// The alert-bus API expects alerts posted to `<endpoint>/api/v2/alerts`,
/// not the bare endpoint.
fn alert_bus_url(endpoint: &str) -> String {
    format!("{}/api/v2/alerts", endpoint.trim_end_matches('/'))
}
