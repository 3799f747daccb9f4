// ===============================
// src/retry.rs
// ===============================
use rand::Rng;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::config::RetryCfg;
use crate::gateway::BrokerError;
use crate::metrics::RETRIES;

/// Exponential delay for `attempt` (1-based), capped, with jitter in [d/2, d].
pub fn backoff_delay(cfg: &RetryCfg, attempt: u32) -> Duration {
    let exp = cfg.base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(20));
    let capped = exp.min(cfg.max_delay_ms);
    // ThreadRng is not Send; keep it out of any await
    let jittered = if capped > 1 { rand::thread_rng().gen_range(capped / 2..=capped) } else { capped };
    Duration::from_millis(jittered)
}

/// Run `f` until it succeeds, fails permanently, or `max_tries` is used up.
pub async fn with_retry<T, F, Fut>(cfg: &RetryCfg, op: &'static str, mut f: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < cfg.max_tries => {
                let delay = backoff_delay(cfg, attempt);
                warn!(op, attempt, ?delay, error = %e, "transient broker error, retrying");
                RETRIES.with_label_values(&[op]).inc();
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryCfg { RetryCfg { max_tries: 5, base_ms: 1, max_delay_ms: 4 } }

    #[test]
    fn delay_grows_and_caps() {
        let cfg = RetryCfg { max_tries: 5, base_ms: 100, max_delay_ms: 1_000 };
        for _ in 0..50 {
            let d1 = backoff_delay(&cfg, 1).as_millis();
            assert!((50..=100).contains(&d1));
            let d3 = backoff_delay(&cfg, 3).as_millis();
            assert!((200..=400).contains(&d3));
            let d10 = backoff_delay(&cfg, 10).as_millis();
            assert!((500..=1_000).contains(&d10));
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = with_retry(&fast(), "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BrokerError::Transport("reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_tries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = with_retry(&fast(), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::Status { code: 503, body: String::new() })
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn permanent_errors_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), _> = with_retry(&fast(), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::Status { code: 422, body: "bad qty".into() })
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
