//! Gateway core: tenant registry, credential verification, limits, metrics.

pub mod auth;
pub mod http;
pub mod limits;
pub mod metrics;
pub mod session;
pub mod sync;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::profiles::ProfileRegistry;
use crate::protocol::McpHandler;
use limits::TenantGate;
use metrics::{MetricsReport, MetricsStore};

/// One tenant as received from the control plane.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    pub id: String,
    #[serde(default)]
    pub slug: String,
    pub domain: String,
    pub profile: String,
    #[serde(default)]
    pub api_key_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_key_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_key_expiry: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub rate_limit: u32,
    #[serde(default)]
    pub max_concurrency: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConfig")
            .field("id", &self.id)
            .field("slug", &self.slug)
            .field("domain", &self.domain)
            .field("profile", &self.profile)
            .field("api_key_hash", &"<redacted>")
            .field("prev_key_hash", &"<redacted>")
            .field("prev_key_expiry", &self.prev_key_expiry)
            .field("enabled", &self.enabled)
            .field("rate_limit", &self.rate_limit)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

/// Full configuration snapshot from the control-plane sync endpoint.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub gateway_id: String,
    #[serde(default)]
    pub pepper: String,
    #[serde(default)]
    pub connections: Vec<TenantConfig>,
    #[serde(default)]
    pub version: i64,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("server_id", &self.server_id)
            .field("gateway_id", &self.gateway_id)
            .field("pepper", &"<redacted>")
            .field("connections", &self.connections)
            .field("version", &self.version)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("too many concurrent sessions")]
    ConcurrencyExhausted,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("control plane error: {0}")]
    ControlPlane(String),
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0))
            .as_secs()
    }
}

/// A live tenant: swappable config record plus state that survives config
/// swaps (handler env aside, which is refreshed in place).
pub struct Tenant {
    config: RwLock<Arc<TenantConfig>>,
    handler: Arc<McpHandler>,
    gate: Mutex<TenantGate>,
}

impl Tenant {
    fn new(config: TenantConfig, handler: Arc<McpHandler>) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            handler,
            gate: Mutex::new(TenantGate::default()),
        }
    }

    pub async fn config(&self) -> Arc<TenantConfig> {
        self.config.read().await.clone()
    }

    pub fn handler(&self) -> &McpHandler {
        &self.handler
    }

    pub async fn active_sessions(&self) -> u32 {
        self.gate.lock().await.active_sessions()
    }

    async fn swap_config(&self, config: TenantConfig) {
        self.handler.update_env(config.env_vars.clone()).await;
        *self.config.write().await = Arc::new(config);
    }
}

#[derive(Default)]
struct Identity {
    server_id: String,
    gateway_id: String,
}

/// Process-wide gateway state: the domain-keyed tenant map published as an
/// atomic snapshot, the credential pepper, and the metrics store.
pub struct Gateway {
    tenants: RwLock<Arc<HashMap<String, Arc<Tenant>>>>,
    pepper: RwLock<String>,
    version: AtomicI64,
    identity: RwLock<Identity>,
    metrics: MetricsStore,
    profiles: ProfileRegistry,
    clock: Box<dyn Clock>,
}

impl Gateway {
    pub fn new(profiles: ProfileRegistry) -> Self {
        Self::with_clock(profiles, Box::new(SystemClock))
    }

    pub fn with_clock(profiles: ProfileRegistry, clock: Box<dyn Clock>) -> Self {
        Self {
            tenants: RwLock::new(Arc::new(HashMap::new())),
            pepper: RwLock::new(String::new()),
            version: AtomicI64::new(0),
            identity: RwLock::new(Identity::default()),
            metrics: MetricsStore::new(),
            profiles,
            clock,
        }
    }

    /// Applies a configuration snapshot. Tenants whose domain and profile
    /// are unchanged keep their live state; everything else is rebuilt.
    /// Readers never observe a partially built map.
    pub async fn apply_config(&self, config: GatewayConfig) {
        let GatewayConfig {
            server_id,
            gateway_id,
            pepper,
            connections,
            version,
        } = config;

        let current = self.tenants.read().await.clone();
        let mut next: HashMap<String, Arc<Tenant>> = HashMap::with_capacity(connections.len());

        for tenant_config in connections {
            if !tenant_config.enabled {
                continue;
            }
            let domain = tenant_config.domain.clone();
            let mut retained = None;
            if let Some(existing) = current.get(&domain) {
                if existing.config().await.profile == tenant_config.profile {
                    retained = Some(existing.clone());
                }
            }
            if let Some(existing) = retained {
                self.metrics.ensure(&tenant_config.id).await;
                existing.swap_config(tenant_config).await;
                next.insert(domain, existing);
            } else {
                let Some(profile) = self.profiles.get(&tenant_config.profile) else {
                    warn!(
                        profile = %tenant_config.profile,
                        tenant = %tenant_config.slug,
                        "unknown profile, skipping tenant"
                    );
                    continue;
                };
                self.metrics.ensure(&tenant_config.id).await;
                let handler = Arc::new(McpHandler::new(profile, tenant_config.env_vars.clone()));
                next.insert(domain, Arc::new(Tenant::new(tenant_config, handler)));
            }
        }

        *self.pepper.write().await = pepper;
        self.version.store(version, Ordering::SeqCst);
        *self.identity.write().await = Identity {
            server_id,
            gateway_id,
        };

        let tenant_count = next.len();
        *self.tenants.write().await = Arc::new(next);
        info!(version, tenants = tenant_count, "configuration applied");
    }

    pub async fn lookup(&self, domain: &str) -> Option<Arc<Tenant>> {
        self.tenants.read().await.get(domain).cloned()
    }

    pub fn version(&self) -> i64 {
        self.version.load(Ordering::SeqCst)
    }

    pub async fn gateway_id(&self) -> String {
        self.identity.read().await.gateway_id.clone()
    }

    pub async fn server_id(&self) -> String {
        self.identity.read().await.server_id.clone()
    }

    /// Verifies a presented credential against the tenant's active hash,
    /// then against the previous hash while its expiry is in the future.
    pub async fn verify_credential(&self, tenant: &Tenant, credential: &str) -> bool {
        let pepper = self.pepper.read().await.clone();
        let config = tenant.config().await;
        auth::verify(&pepper, credential, &config, self.clock.now_epoch_seconds())
    }

    /// Sliding-window admission; appends the current timestamp on admit.
    pub async fn admit_request(&self, tenant: &Tenant) -> bool {
        let limit = tenant.config().await.rate_limit;
        let now = self.clock.now_epoch_seconds();
        tenant.gate.lock().await.admit_request(now, limit)
    }

    /// Check-and-increment under the tenant gate, so the session count can
    /// never overshoot the ceiling.
    pub async fn try_acquire_session(&self, tenant: &Tenant) -> bool {
        let limit = tenant.config().await.max_concurrency;
        tenant.gate.lock().await.try_acquire_session(limit)
    }

    pub async fn release_session(&self, tenant: &Tenant) {
        tenant.gate.lock().await.release_session();
    }

    pub async fn record_request(&self, tenant_id: &str, latency_ms: f64, is_error: bool) {
        let now = self.clock.now_epoch_seconds() as i64;
        self.metrics
            .record_request(tenant_id, latency_ms, is_error, now)
            .await;
    }

    pub async fn record_auth_failure(&self, tenant_id: &str) {
        self.metrics.record_auth_failure(tenant_id).await;
    }

    /// Snapshots per-tenant metrics, sampling live session counts, then
    /// zeroes the delta counters and clears the latency ring.
    pub async fn collect_and_reset_metrics(&self) -> Vec<MetricsReport> {
        let tenants = self.tenants.read().await.clone();
        let mut active_sessions: HashMap<String, u32> = HashMap::with_capacity(tenants.len());
        for tenant in tenants.values() {
            let id = tenant.config().await.id.clone();
            active_sessions.insert(id, tenant.active_sessions().await);
        }
        self.metrics.collect_and_reset(&active_sessions).await
    }
}
