//! Per-tenant admission control: a sliding one-minute request window and an
//! active-session counter, both guarded by the tenant's gate mutex.

pub const DEFAULT_RATE_LIMIT: u32 = 60;
pub const DEFAULT_MAX_CONCURRENCY: u32 = 10;

const RATE_WINDOW_SECONDS: u64 = 60;

#[derive(Debug, Default)]
pub(crate) struct TenantGate {
    window: Vec<u64>,
    sessions: u32,
}

impl TenantGate {
    /// Admits iff the count of timestamps strictly inside the trailing
    /// window is below the ceiling; appends `now` on admit.
    pub(crate) fn admit_request(&mut self, now: u64, limit: u32) -> bool {
        let limit = if limit == 0 { DEFAULT_RATE_LIMIT } else { limit };
        let window_start = now.saturating_sub(RATE_WINDOW_SECONDS);
        self.window.retain(|&t| t > window_start);
        if self.window.len() >= limit as usize {
            return false;
        }
        self.window.push(now);
        true
    }

    pub(crate) fn try_acquire_session(&mut self, limit: u32) -> bool {
        let limit = if limit == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            limit
        };
        if self.sessions >= limit {
            return false;
        }
        self.sessions += 1;
        true
    }

    pub(crate) fn release_session(&mut self) {
        self.sessions = self.sessions.saturating_sub(1);
    }

    pub(crate) fn active_sessions(&self) -> u32 {
        self.sessions
    }
}
