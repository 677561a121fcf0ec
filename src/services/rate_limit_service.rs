use dashmap::DashMap;
use opentelemetry::{KeyValue, global, metrics::Counter};
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Rejected { retry_after_secs: u64 },
}

impl Decision {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Approximate per-key fixed-window counting with TTL expiry. Process-local
/// map and distributed counter stores are interchangeable behind this seam.
pub trait RateLimitStore: Send + Sync + std::fmt::Debug {
    fn check(&self, key: &str, window: Duration, max: u32) -> Decision;
}

/// Fixed-window counter over a concurrent map. The window resets lazily on
/// the first request after expiry; no background sweep. Known limitation: a
/// burst straddling a window boundary can admit up to 2x `max`, and counts
/// are per-process.
#[derive(Debug, Default)]
pub struct FixedWindowLimiter {
    windows: DashMap<String, Window>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u32,
    length: Duration,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_stale(&self) {
        self.windows.retain(|_, w| w.started_at.elapsed() < w.length * 2);
    }
}

impl RateLimitStore for FixedWindowLimiter {
    fn check(&self, key: &str, window: Duration, max: u32) -> Decision {
        // Opportunistic cleanup so abandoned keys do not accumulate.
        if rand::thread_rng().gen_ratio(1, 1000) {
            self.purge_stale();
        }

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert(Window { started_at: Instant::now(), count: 0, length: window });

        let elapsed = entry.started_at.elapsed();
        if elapsed >= window {
            entry.started_at = Instant::now();
            entry.count = 0;
        }

        if entry.count >= max {
            let retry_after = window.saturating_sub(entry.started_at.elapsed());
            return Decision::Rejected { retry_after_secs: retry_after.as_secs().max(1) };
        }

        entry.count += 1;
        Decision::Allowed
    }
}

#[derive(Clone)]
struct Metrics {
    decisions_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("reportdesk-server");
        Self {
            decisions_total: meter
                .u64_counter("rate_limit_decisions_total")
                .with_description("Rate limit decisions (allowed/throttled)")
                .build(),
        }
    }
}

/// Per-action keyed limiting for the auth endpoints. Key composition is the
/// action's choice: login and forgot-password key on (ip, email), the rest
/// on the ip alone.
#[derive(Clone)]
pub struct RateLimitService {
    store: Arc<dyn RateLimitStore>,
    metrics: Metrics,
}

impl std::fmt::Debug for RateLimitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitService").finish_non_exhaustive()
    }
}

impl RateLimitService {
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store, metrics: Metrics::new() }
    }

    pub fn check_login(&self, ip: IpAddr, email: &str, window_secs: u64, max: u32) -> Decision {
        self.check(&format!("login:{ip}:{email}"), window_secs, max)
    }

    pub fn check_refresh(&self, ip: IpAddr, window_secs: u64, max: u32) -> Decision {
        self.check(&format!("refresh:{ip}"), window_secs, max)
    }

    pub fn check_register(&self, ip: IpAddr, window_secs: u64, max: u32) -> Decision {
        self.check(&format!("register:{ip}"), window_secs, max)
    }

    pub fn check_forgot_password(&self, ip: IpAddr, email: &str, window_secs: u64, max: u32) -> Decision {
        self.check(&format!("forgot:{ip}:{email}"), window_secs, max)
    }

    pub fn check_reset_password(&self, ip: IpAddr, window_secs: u64, max: u32) -> Decision {
        self.check(&format!("reset:{ip}"), window_secs, max)
    }

    fn check(&self, key: &str, window_secs: u64, max: u32) -> Decision {
        let decision = self.store.check(key, Duration::from_secs(window_secs), max);

        let label = if decision.is_allowed() { "allowed" } else { "throttled" };
        if let Decision::Rejected { retry_after_secs } = decision {
            tracing::warn!(key, retry_after = retry_after_secs, "Rate limit exceeded");
        }
        self.metrics.decisions_total.add(1, &[KeyValue::new("status", label)]);

        decision
    }
}
