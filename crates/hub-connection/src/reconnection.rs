//! Reconnect policies and the reconnect loop.
//!
//! A [`ReconnectPolicy`] decides, after each transport loss or failed
//! attempt, whether to retry and after which delay. The loop runs on the
//! session task; pending calls stay registered while it retries.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Inner;
use crate::error::HubError;
use crate::transport::Link;
use crate::types::{ConnectionEvent, ConnectionState};

/// Input to [`ReconnectPolicy::next_retry_delay`].
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempts already made in this reconnect cycle (0 before the first).
    pub previous_retry_count: u32,
    /// Time since the transport was lost.
    pub elapsed: Duration,
    /// Why the transport was lost, or why the last attempt failed.
    pub retry_reason: HubError,
}

/// Decides whether and when to retry after a transport loss.
pub trait ReconnectPolicy: Send + Sync + 'static {
    /// Returns the delay before the next attempt, or `None` to give up.
    ///
    /// Returning `None` on the first call disables auto-reconnect.
    fn next_retry_delay(&self, ctx: &RetryContext) -> Option<Duration>;
}

/// Fixed delay sequence: `0s, 2s, 10s, 30s`, then exhausted.
#[derive(Debug, Clone)]
pub struct DefaultReconnectPolicy {
    delays: Vec<Duration>,
}

impl Default for DefaultReconnectPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
        }
    }
}

impl DefaultReconnectPolicy {
    /// Uses a custom delay sequence; one attempt per entry.
    pub fn with_delays(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl ReconnectPolicy for DefaultReconnectPolicy {
    fn next_retry_delay(&self, ctx: &RetryContext) -> Option<Duration> {
        self.delays.get(ctx.previous_retry_count as usize).copied()
    }
}

/// Exponential backoff with ±25% jitter, bounded by `max_attempts`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Attempts per reconnect cycle before giving up.
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            max_attempts: 10,
        }
    }
}

impl ExponentialBackoff {
    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.jittered_delay(attempt, jitter_sample())
    }

    /// Delay for `attempt` with `sample` in `[0.0, 1.0)` mapped onto
    /// `[-25%, +25%)` of the capped base delay.
    fn jittered_delay(&self, attempt: u32, sample: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let offset = sample * 2.0 - 1.0; // [-1.0, 1.0)
        let with_jitter = (capped + capped * 0.25 * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }
}

/// Uniform-enough sample in `[0.0, 1.0)` from the clock's sub-second part.
fn jitter_sample() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos) / 1_000_000_000.0
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_retry_delay(&self, ctx: &RetryContext) -> Option<Duration> {
        if ctx.previous_retry_count >= self.max_attempts {
            return None;
        }
        Some(self.delay_for_attempt(ctx.previous_retry_count + 1))
    }
}

/// Auto-reconnect disabled: any transport loss closes the connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReconnect;

impl ReconnectPolicy for NoReconnect {
    fn next_retry_delay(&self, _ctx: &RetryContext) -> Option<Duration> {
        None
    }
}

/// Outcome of one reconnect cycle.
pub(crate) enum Reconnect {
    /// A new link completed the handshake; the connection is `Connected`.
    Linked { link: Link, leftover: Vec<u8> },
    /// `stop()` was called; teardown belongs to it.
    Stopped,
    /// Policy gave up (or was disabled). Carries the close error.
    Exhausted(HubError),
}

/// Retries opening the transport until a link is up, the policy gives up,
/// or the session is cancelled.
pub(crate) async fn reconnect(
    inner: &Inner,
    cancel: &CancellationToken,
    reason: HubError,
) -> Reconnect {
    let started = Instant::now();
    let mut attempt: u32 = 0;
    let mut last_error = reason;

    loop {
        let ctx = RetryContext {
            previous_retry_count: attempt,
            elapsed: started.elapsed(),
            retry_reason: last_error.clone(),
        };
        let Some(delay) = inner.policy.next_retry_delay(&ctx) else {
            if attempt == 0 {
                debug!(error = %last_error, "auto-reconnect disabled");
            } else {
                warn!(attempts = attempt, error = %last_error, "reconnect attempts exhausted");
            }
            return Reconnect::Exhausted(closed_error(last_error));
        };
        attempt = attempt.saturating_add(1);

        if !inner.transition(cancel, ConnectionState::Reconnecting { attempt }, None) {
            return Reconnect::Stopped;
        }
        inner.emit(ConnectionEvent::Reconnecting {
            attempt,
            next_retry: delay,
            error: last_error.clone(),
        });

        let delay_secs = delay.as_secs_f64();
        info!(
            attempt,
            delay_secs = format_args!("{delay_secs:.1}"),
            error = %last_error,
            "reconnecting"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconnect cancelled");
                return Reconnect::Stopped;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let opened = tokio::select! {
            _ = cancel.cancelled() => return Reconnect::Stopped,
            opened = inner.open_link() => opened,
        };

        match opened {
            Ok((link, leftover)) => {
                if !inner.transition(cancel, ConnectionState::Connected, Some(link.sender())) {
                    link.close();
                    return Reconnect::Stopped;
                }
                inner.emit(ConnectionEvent::Reconnected);
                info!(attempt, "reconnected");
                return Reconnect::Linked { link, leftover };
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
                last_error = e;
            }
        }
    }
}

/// Wraps a terminal failure as the error delivered to drained calls.
fn closed_error(error: HubError) -> HubError {
    match error {
        HubError::ConnectionClosed(_) => error,
        other => HubError::ConnectionClosed(Some(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(previous_retry_count: u32) -> RetryContext {
        RetryContext {
            previous_retry_count,
            elapsed: Duration::ZERO,
            retry_reason: HubError::ConnectionClosed(None),
        }
    }

    #[test]
    fn default_policy_delays_then_exhausts() {
        let policy = DefaultReconnectPolicy::default();
        let delays: Vec<_> = (0..5).map(|n| policy.next_retry_delay(&ctx(n))).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::ZERO),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(10)),
                Some(Duration::from_secs(30)),
                None,
            ]
        );
    }

    #[test]
    fn custom_delays() {
        let policy = DefaultReconnectPolicy::with_delays(vec![Duration::from_millis(5)]);
        assert_eq!(policy.next_retry_delay(&ctx(0)), Some(Duration::from_millis(5)));
        assert_eq!(policy.next_retry_delay(&ctx(1)), None);
    }

    #[test]
    fn no_reconnect_never_retries() {
        assert_eq!(NoReconnect.next_retry_delay(&ctx(0)), None);
    }

    #[test]
    fn backoff_delays_within_jitter() {
        let policy = ExponentialBackoff::default();
        // Base delays: 250ms, 500ms, 1s, 2s, 4s, 8s, 15s (capped), 15s...
        let expected_base = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 15.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let delay = policy.delay_for_attempt((i + 1) as u32);
            let secs = delay.as_secs_f64();
            let lo = base * 0.74;
            let hi = base * 1.26;
            assert!(
                secs >= lo && secs <= hi,
                "attempt {}: {secs:.3}s not in [{lo:.3}, {hi:.3}]",
                i + 1
            );
        }
    }

    #[test]
    fn backoff_jitter_spans_both_directions() {
        let policy = ExponentialBackoff {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let low = policy.jittered_delay(1, 0.0).as_secs_f64();
        let mid = policy.jittered_delay(1, 0.5).as_secs_f64();
        let high = policy.jittered_delay(1, 0.999_999).as_secs_f64();
        assert!((low - 7.5).abs() < 1e-9, "low {low}");
        assert!((mid - 10.0).abs() < 1e-9, "mid {mid}");
        assert!(high > 12.49 && high < 12.5, "high {high}");
    }

    #[test]
    fn jitter_sample_is_a_unit_fraction() {
        for _ in 0..1000 {
            let sample = jitter_sample();
            assert!((0.0..1.0).contains(&sample), "sample {sample}");
        }
    }

    #[test]
    fn backoff_respects_max_attempts() {
        let policy = ExponentialBackoff {
            max_attempts: 2,
            ..Default::default()
        };
        assert!(policy.next_retry_delay(&ctx(0)).is_some());
        assert!(policy.next_retry_delay(&ctx(1)).is_some());
        assert!(policy.next_retry_delay(&ctx(2)).is_none());
    }

    #[test]
    fn closed_error_wraps_other_failures() {
        assert_eq!(
            closed_error(HubError::ConnectionClosed(None)),
            HubError::ConnectionClosed(None)
        );
        assert_eq!(
            closed_error(HubError::Transport("refused".into())),
            HubError::ConnectionClosed(Some("transport error: refused".into()))
        );
    }
}
