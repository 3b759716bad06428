//! Control-plane polling: configuration sync and metrics reporting.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Gateway, GatewayConfig, GatewayError};

const DEFAULT_CONTROL_PLANE_URL: &str = "https://control.portico.dev";
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
const CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(15);

const CONFIG_VERSION_HEADER: &str = "X-Config-Version";
const GATEWAY_TOKEN_HEADER: &str = "X-Gateway-Token";

/// Consecutive sync failures before the log level escalates.
const FAILURE_LOG_THRESHOLD: u32 = 5;

/// Process settings, read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub token: String,
    pub port: u16,
    pub control_plane_url: String,
    pub sync_interval: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, GatewayError> {
        let token = std::env::var("GATEWAY_TOKEN")
            .ok()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                GatewayError::Config("GATEWAY_TOKEN environment variable is required".to_string())
            })?;

        let port = match std::env::var("GATEWAY_PORT") {
            Ok(raw) => raw.parse().map_err(|_| {
                GatewayError::Config(format!("invalid GATEWAY_PORT: {raw}"))
            })?,
            Err(_) => 8080,
        };

        let control_plane_url = std::env::var("CONTROL_PLANE_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTROL_PLANE_URL.to_string());

        let sync_interval = match std::env::var("SYNC_INTERVAL") {
            Ok(raw) => match parse_duration(&raw) {
                Some(interval) => interval,
                None => {
                    warn!(value = %raw, "unparseable SYNC_INTERVAL, using default");
                    DEFAULT_SYNC_INTERVAL
                }
            },
            Err(_) => DEFAULT_SYNC_INTERVAL,
        };

        Ok(Self {
            token,
            port,
            control_plane_url,
            sync_interval,
        })
    }
}

/// Accepts `300ms`, `30s`, `2m`, `1h`, or bare seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_suffix("ms") {
        return rest.parse().ok().map(Duration::from_millis);
    }
    if let Some(rest) = raw.strip_suffix('s') {
        return rest.parse().ok().map(Duration::from_secs);
    }
    if let Some(rest) = raw.strip_suffix('m') {
        return rest.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(rest) = raw.strip_suffix('h') {
        return rest
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600));
    }
    raw.parse().ok().map(Duration::from_secs)
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<GatewayConfig>,
}

/// Pulls configuration and pushes metrics on a fixed cadence. Failures are
/// counted and logged; they never clear the last applied configuration.
pub struct Poller {
    gateway: Arc<Gateway>,
    base_url: String,
    token: String,
    sync_interval: Duration,
    client: reqwest::Client,
    failures: u32,
}

impl Poller {
    pub fn new(gateway: Arc<Gateway>, settings: &Settings) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(CONTROL_PLANE_TIMEOUT)
            .build()
            .map_err(|err| GatewayError::ControlPlane(format!("http client error: {err}")))?;

        Ok(Self {
            gateway,
            base_url: settings.control_plane_url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            sync_interval: settings.sync_interval,
            client,
            failures: 0,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Runs until cancelled. The first sync fires immediately; metrics
    /// reports run on the same period, offset by half of it.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.sync_once().await;

        let mut sync_tick = tokio::time::interval(self.sync_interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Consume the immediate first tick; the initial sync already ran.
        sync_tick.tick().await;

        let mut metrics_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.sync_interval / 2,
            self.sync_interval,
        );
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("poller stopping");
                    return;
                }
                _ = sync_tick.tick() => self.sync_once().await,
                _ = metrics_tick.tick() => self.report_once().await,
            }
        }
    }

    pub async fn sync_once(&mut self) {
        match self.sync_config().await {
            Ok(()) => self.failures = 0,
            Err(err) => {
                self.failures += 1;
                if self.failures >= FAILURE_LOG_THRESHOLD {
                    error!(
                        failures = self.failures,
                        error = %err,
                        "config sync failing repeatedly"
                    );
                } else {
                    warn!(error = %err, "config sync failed");
                }
            }
        }
    }

    async fn sync_config(&mut self) -> Result<(), GatewayError> {
        let url = format!("{}/internal/gateway/sync", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(CONFIG_VERSION_HEADER, self.gateway.version().to_string())
            .send()
            .await
            .map_err(|err| GatewayError::ControlPlane(format!("sync request failed: {err}")))?;

        // Token refresh arrives on any status.
        if let Some(new_token) = response
            .headers()
            .get(GATEWAY_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
        {
            self.token = new_token.to_string();
            info!("gateway token refreshed");
        }

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::ControlPlane(format!(
                "auth failed (status {status}): token may be revoked"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::ControlPlane(format!(
                "unexpected sync status {status}: {body}"
            )));
        }

        let payload: SyncResponse = match response.json().await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "sync response decode failed");
                return Ok(());
            }
        };
        if !payload.success {
            warn!("control plane returned success=false");
            return Ok(());
        }
        let Some(config) = payload.data else {
            warn!("sync response missing data");
            return Ok(());
        };

        self.gateway.apply_config(config).await;
        Ok(())
    }

    pub async fn report_once(&self) {
        let reports = self.gateway.collect_and_reset_metrics().await;
        if reports.is_empty() {
            return;
        }

        let url = format!("{}/internal/gateway/metrics", self.base_url);
        let result = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&serde_json::json!({ "metrics": reports }))
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "metrics report rejected");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "metrics report failed"),
        }
    }
}
