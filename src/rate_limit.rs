//! Sliding-window admission limiters
//!
//! Two limiters with the same windowed accounting but different shapes:
//!
//! - [`SlidingWindowLimiter`]: per-client-IP, one global budget, used on the
//!   data plane. Lossy across restart; rate limits are soft guarantees.
//! - [`AdminRateLimiter`]: keyed `(ip, operation)`, used on the admin/auth
//!   surface. Saturating the window puts the key into a temporary blocked
//!   state so brute-force attempts are suppressed without extending the
//!   window forever.
//!
//! The monotonic "now" is an explicit parameter so tests can fabricate time.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Hard cap on tracked IPs; evicting an idle IP is equivalent to it having
/// been idle, so correctness is unaffected.
const MAX_TRACKED_IPS: usize = 100_000;

/// Per-IP request history inside the window.
#[derive(Debug, Default)]
struct Window {
    hits: VecDeque<Instant>,
    last_seen: Option<Instant>,
}

impl Window {
    fn purge(&mut self, cutoff: Instant) {
        while let Some(front) = self.hits.front() {
            if *front < cutoff {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Snapshot of one IP's window, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub ip: String,
    pub requests_in_window: usize,
    pub limit: u32,
    pub remaining: u32,
    /// Age in seconds of the oldest request still inside the window
    pub oldest_age_secs: Option<u64>,
}

/// Per-IP sliding-window limiter for the data plane.
pub struct SlidingWindowLimiter {
    windows: DashMap<IpAddr, Window>,
    budget: parking_lot::RwLock<u32>,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            windows: DashMap::new(),
            budget: parking_lot::RwLock::new(requests_per_minute),
            window: Duration::from_secs(60),
        }
    }

    /// Admit or reject one request from `ip` at `now`.
    ///
    /// Purges expired entries, rejects at `len >= budget`, otherwise records
    /// the admission. Decisions for one IP are linearised on its map shard.
    pub fn admit(&self, ip: IpAddr, now: Instant) -> bool {
        self.maybe_evict(now);

        let budget = *self.budget.read();
        let mut entry = self.windows.entry(ip).or_default();
        entry.last_seen = Some(now);
        entry.purge(now.checked_sub(self.window).unwrap_or(now));

        if entry.hits.len() >= budget as usize {
            debug!("rate limit exceeded for {}: {} in window", ip, entry.hits.len());
            return false;
        }

        entry.hits.push_back(now);
        true
    }

    /// Remove all state for `ip`.
    pub fn clear(&self, ip: IpAddr) {
        if self.windows.remove(&ip).is_some() {
            info!("cleared rate limit state for {}", ip);
        }
    }

    /// Current window stats for `ip`.
    pub fn stats(&self, ip: IpAddr, now: Instant) -> WindowStats {
        let budget = *self.budget.read();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let (count, oldest) = match self.windows.get_mut(&ip) {
            Some(mut entry) => {
                entry.purge(cutoff);
                (
                    entry.hits.len(),
                    entry.hits.front().map(|t| now.duration_since(*t).as_secs()),
                )
            }
            None => (0, None),
        };

        WindowStats {
            ip: ip.to_string(),
            requests_in_window: count,
            limit: budget,
            remaining: budget.saturating_sub(count as u32),
            oldest_age_secs: oldest,
        }
    }

    /// Install a new budget (hot reload). Existing windows keep their history.
    pub fn update_budget(&self, requests_per_minute: u32) {
        let mut budget = self.budget.write();
        if *budget != requests_per_minute {
            info!(
                "data-plane rate limit updated: {} -> {} req/min",
                *budget, requests_per_minute
            );
            *budget = requests_per_minute;
        }
    }

    /// Number of IPs currently tracked (admin status endpoint).
    pub fn tracked_ips(&self) -> usize {
        self.windows.len()
    }

    /// Opportunistic eviction when the map is at capacity: drop entries that
    /// have been idle for a full window.
    fn maybe_evict(&self, now: Instant) {
        if self.windows.len() < MAX_TRACKED_IPS {
            return;
        }
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.last_seen.map_or(false, |t| t >= cutoff));
        warn!(
            "rate limiter at capacity: evicted {} idle IPs",
            before - self.windows.len()
        );
    }
}

/// Outcome of an admin-plane admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCheck {
    Ok,
    /// Blocked; retry after this many whole seconds
    BlockedFor(u64),
}

#[derive(Debug, Default)]
struct AdminWindow {
    attempts: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Stats view for one `(ip, op)` admin key.
#[derive(Debug, Clone, Serialize)]
pub struct AdminWindowStats {
    pub ip: String,
    pub operation: String,
    pub attempts_in_window: usize,
    pub max_attempts: u32,
    pub is_blocked: bool,
    pub blocked_for_secs: u64,
}

/// Sliding-window limiter for sensitive admin operations, with temporary
/// blocking on saturation.
pub struct AdminRateLimiter {
    windows: DashMap<(IpAddr, String), AdminWindow>,
    settings: parking_lot::RwLock<AdminLimiterSettings>,
}

#[derive(Debug, Clone, Copy)]
struct AdminLimiterSettings {
    max_attempts: u32,
    window: Duration,
    block: Duration,
}

impl AdminRateLimiter {
    pub fn new(max_attempts: u32, window_seconds: u64, block_seconds: u64) -> Self {
        Self {
            windows: DashMap::new(),
            settings: parking_lot::RwLock::new(AdminLimiterSettings {
                max_attempts,
                window: Duration::from_secs(window_seconds),
                block: Duration::from_secs(block_seconds),
            }),
        }
    }

    /// Record one attempt against `(ip, op)` and decide.
    ///
    /// Reaching the budget inside the window sets `blocked_until`; while the
    /// block holds, every check reports the remaining seconds without
    /// recording further attempts.
    pub fn check(&self, ip: IpAddr, op: &str, now: Instant) -> AdminCheck {
        let settings = *self.settings.read();
        let mut entry = self.windows.entry((ip, op.to_string())).or_default();

        if let Some(until) = entry.blocked_until {
            if now < until {
                let remaining = until.duration_since(now).as_secs().max(1);
                warn!("blocked {} attempt from {} ({}s remaining)", op, ip, remaining);
                return AdminCheck::BlockedFor(remaining);
            }
            // Block expired: forget the old window entirely
            entry.blocked_until = None;
            entry.attempts.clear();
        }

        let cutoff = now.checked_sub(settings.window).unwrap_or(now);
        while let Some(front) = entry.attempts.front() {
            if *front < cutoff {
                entry.attempts.pop_front();
            } else {
                break;
            }
        }

        entry.attempts.push_back(now);

        if entry.attempts.len() > settings.max_attempts as usize {
            entry.blocked_until = Some(now + settings.block);
            warn!(
                "admin rate limit tripped for {} on '{}': {} attempts in window, blocking {}s",
                ip,
                op,
                entry.attempts.len(),
                settings.block.as_secs()
            );
            return AdminCheck::BlockedFor(settings.block.as_secs());
        }

        AdminCheck::Ok
    }

    /// Clear every operation window for `ip`.
    pub fn clear(&self, ip: IpAddr) {
        self.windows.retain(|(k, _), _| *k != ip);
        info!("cleared admin rate limit state for {}", ip);
    }

    /// Current state of one `(ip, op)` key.
    pub fn stats(&self, ip: IpAddr, op: &str, now: Instant) -> AdminWindowStats {
        let settings = *self.settings.read();
        let cutoff = now.checked_sub(settings.window).unwrap_or(now);

        let (attempts, blocked_for) = match self.windows.get(&(ip, op.to_string())) {
            Some(entry) => {
                let live = entry.attempts.iter().filter(|t| **t >= cutoff).count();
                let blocked = entry
                    .blocked_until
                    .filter(|until| now < *until)
                    .map(|until| until.duration_since(now).as_secs())
                    .unwrap_or(0);
                (live, blocked)
            }
            None => (0, 0),
        };

        AdminWindowStats {
            ip: ip.to_string(),
            operation: op.to_string(),
            attempts_in_window: attempts,
            max_attempts: settings.max_attempts,
            is_blocked: blocked_for > 0,
            blocked_for_secs: blocked_for,
        }
    }

    /// Install new settings (hot reload).
    pub fn update_settings(&self, max_attempts: u32, window_seconds: u64, block_seconds: u64) {
        *self.settings.write() = AdminLimiterSettings {
            max_attempts,
            window: Duration::from_secs(window_seconds),
            block: Duration::from_secs(block_seconds),
        };
    }
}
