//! 按客户端的文件操作准入控制：固定窗口计数与并发上限。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config::{
    DEFAULT_THROTTLE_MAX_CONCURRENT, DEFAULT_THROTTLE_MAX_OPS, DEFAULT_THROTTLE_WINDOW_SECS,
};

#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    pub window: Duration,
    pub max_ops_per_window: u32,
    pub max_concurrent: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_THROTTLE_WINDOW_SECS),
            max_ops_per_window: DEFAULT_THROTTLE_MAX_OPS,
            max_concurrent: DEFAULT_THROTTLE_MAX_CONCURRENT,
        }
    }
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    RateLimitExceeded { retry_after: Duration },
    ConcurrencyLimitExceeded,
}

/// One admitted, in-flight operation.
///
/// The salt keeps tokens distinct when one client starts several operations
/// at the same instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationToken {
    client_id: Arc<str>,
    started_at: Instant,
    salt: Uuid,
}

#[derive(Debug)]
struct GateState {
    window_started_at: Instant,
    ops_in_window: HashMap<Arc<str>, u32>,
    pending: HashSet<OperationToken>,
}

impl GateState {
    fn in_flight(&self, client_id: &str) -> usize {
        self.pending
            .iter()
            .filter(|token| &*token.client_id == client_id)
            .count()
    }
}

/// Process-wide admission authority for filesystem work.
///
/// Construct one per process and share it by `Arc`. Counters and the pending
/// registry sit behind a single mutex that is never held across an await.
#[derive(Debug)]
pub struct ThrottleGate {
    config: ThrottleConfig,
    state: Mutex<GateState>,
}

impl ThrottleGate {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GateState {
                window_started_at: Instant::now(),
                ops_in_window: HashMap::new(),
                pending: HashSet::new(),
            }),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 尝试为客户端准入一次操作，成功时返回需释放的令牌。
    pub fn admit(&self, client_id: &str) -> Result<OperationToken, Denial> {
        let now = Instant::now();
        let mut state = self.lock();

        if now.duration_since(state.window_started_at) > self.config.window {
            state.ops_in_window.clear();
            state.window_started_at = now;
        }

        let used = state.ops_in_window.get(client_id).copied().unwrap_or(0);
        if used >= self.config.max_ops_per_window {
            let elapsed = now.duration_since(state.window_started_at);
            let retry_after = self.config.window.saturating_sub(elapsed);
            debug!(client = client_id, used, "file operation rate limit exceeded");
            return Err(Denial::RateLimitExceeded { retry_after });
        }

        let in_flight = state.in_flight(client_id);
        if in_flight >= self.config.max_concurrent {
            debug!(client = client_id, in_flight, "file operation concurrency limit exceeded");
            return Err(Denial::ConcurrencyLimitExceeded);
        }

        let client_id: Arc<str> = Arc::from(client_id);
        let token = OperationToken {
            client_id: client_id.clone(),
            started_at: now,
            salt: Uuid::new_v4(),
        };
        state.pending.insert(token.clone());
        *state.ops_in_window.entry(client_id).or_insert(0) += 1;
        Ok(token)
    }

    /// 无条件释放令牌；重复释放无副作用。
    pub fn release(&self, token: &OperationToken) {
        self.lock().pending.remove(token);
    }

    /// Admits an operation and returns a guard that releases it on drop.
    pub fn acquire(&self, client_id: &str) -> Result<Admission<'_>, Denial> {
        let token = self.admit(client_id)?;
        Ok(Admission { gate: self, token })
    }

    pub fn in_flight(&self, client_id: &str) -> usize {
        self.lock().in_flight(client_id)
    }

    pub fn ops_in_window(&self, client_id: &str) -> u32 {
        self.lock()
            .ops_in_window
            .get(client_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Holds one concurrency slot until dropped.
#[derive(Debug)]
pub struct Admission<'a> {
    gate: &'a ThrottleGate,
    token: OperationToken,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.gate.release(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ThrottleGate {
        ThrottleGate::new(ThrottleConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn thirty_first_operation_in_window_is_rate_limited() {
        let gate = gate();
        for _ in 0..30 {
            let token = gate.admit("10.0.0.1").expect("admitted");
            gate.release(&token);
        }
        let denied = gate.admit("10.0.0.1");
        assert!(matches!(denied, Err(Denial::RateLimitExceeded { .. })));
        assert!(gate.admit("10.0.0.2").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn denied_attempts_do_not_consume_budget() {
        let gate = gate();
        let held: Vec<_> = (0..5)
            .map(|_| gate.admit("client").expect("admitted"))
            .collect();
        for _ in 0..20 {
            assert_eq!(
                gate.admit("client"),
                Err(Denial::ConcurrencyLimitExceeded)
            );
        }
        assert_eq!(gate.ops_in_window("client"), 5);
        for token in &held {
            gate.release(token);
        }

        for _ in 0..25 {
            let token = gate.admit("client").expect("admitted");
            gate.release(&token);
        }
        assert_eq!(gate.ops_in_window("client"), 30);
        for _ in 0..3 {
            assert!(matches!(
                gate.admit("client"),
                Err(Denial::RateLimitExceeded { .. })
            ));
        }
        assert_eq!(gate.ops_in_window("client"), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_concurrent_operation_is_denied_until_one_completes() {
        let gate = gate();
        let mut held: Vec<_> = (0..5)
            .map(|_| gate.acquire("client").expect("admitted"))
            .collect();
        assert_eq!(gate.in_flight("client"), 5);
        assert!(matches!(
            gate.acquire("client"),
            Err(Denial::ConcurrencyLimitExceeded)
        ));

        drop(held.pop());
        assert_eq!(gate.in_flight("client"), 4);
        assert!(gate.acquire("client").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn admission_is_released_when_operation_fails() {
        let gate = gate();
        let result = (|| -> Result<(), &'static str> {
            let _admission = gate.acquire("client").map_err(|_| "denied")?;
            Err("io failure")
        })();
        assert_eq!(result, Err("io failure"));
        assert_eq!(gate.in_flight("client"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_it_elapses() {
        let gate = gate();
        for _ in 0..30 {
            let token = gate.admit("client").expect("admitted");
            gate.release(&token);
        }
        match gate.admit("client") {
            Err(Denial::RateLimitExceeded { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("unexpected admission result: {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        match gate.admit("client") {
            Err(Denial::RateLimitExceeded { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("unexpected admission result: {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(gate.admit("client").is_ok());
        assert_eq!(gate.ops_in_window("client"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_instant_tokens_are_distinct() {
        let gate = gate();
        let first = gate.admit("client").expect("admitted");
        let second = gate.admit("client").expect("admitted");
        assert_ne!(first, second);
        assert_eq!(&*first.client_id, "client");
        gate.release(&first);
        assert_eq!(gate.in_flight("client"), 1);
        gate.release(&first);
        assert_eq!(gate.in_flight("client"), 1);
        gate.release(&second);
        assert_eq!(gate.in_flight("client"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_counted_per_exact_client() {
        let gate = gate();
        let _held: Vec<_> = (0..5)
            .map(|_| gate.acquire("10.0.0.1").expect("admitted"))
            .collect();
        assert!(gate.acquire("10.0.0.10").is_ok());
    }
}
