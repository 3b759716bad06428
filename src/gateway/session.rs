//! Live SSE sessions and the process-wide session registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Outbound payloads buffered per session; the enqueue is non-blocking and
/// the newest payload is dropped when full.
pub const SESSION_BUFFER: usize = 64;

static SESSION_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct Session {
    id: String,
    tenant_id: String,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl Session {
    /// Creates a session and hands back the receiving half of its buffer
    /// for the writer loop.
    pub fn new(id: String, tenant_id: String) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let session = Arc::new(Self {
            id,
            tenant_id,
            tx,
            cancel: CancellationToken::new(),
        });
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Non-blocking enqueue; returns false when the buffer is full or the
    /// writer is gone.
    pub fn enqueue(&self, payload: Vec<u8>) -> bool {
        self.tx.try_send(payload).is_ok()
    }

    /// Signals the writer loop to terminate.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: tokio::sync::RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<Session>) {
        self.inner
            .write()
            .await
            .insert(session.id().to_string(), session);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

pub(crate) fn generate_session_id() -> String {
    let seq = SESSION_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("s-{ts_ms}-{seq}")
}
