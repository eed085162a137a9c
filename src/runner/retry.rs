use crate::runner::status::{StatsDelta, StatsStore};
use crate::sink::{Sink, SinkError};
use crate::source::Record;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
}

/// Where delivery of one batch to one sink stands. `pending` counts the
/// records at the tail of the batch that have not been delivered yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting { attempt: u32, pending: usize },
    PartiallyFailed { attempt: u32, pending: usize },
    Succeeded,
    ExhaustedFailed { attempts: u32, dropped: usize },
}

/// What a single call to `Sink::send` reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    /// The first `success` of the pending records were delivered.
    Partial { success: usize },
    Failed,
}

impl AttemptOutcome {
    pub fn of(result: &Result<(), SinkError>) -> Self {
        match result {
            Ok(()) => AttemptOutcome::Delivered,
            Err(SinkError::Partial { success, .. }) => AttemptOutcome::Partial {
                success: usize::try_from(*success).unwrap_or(usize::MAX),
            },
            Err(_) => AttemptOutcome::Failed,
        }
    }
}

impl RetryState {
    pub fn start(len: usize) -> Self {
        if len == 0 {
            RetryState::Succeeded
        } else {
            RetryState::Attempting {
                attempt: 1,
                pending: len,
            }
        }
    }

    /// Moves a partially failed delivery on to its next attempt.
    pub fn retry(self) -> Self {
        match self {
            RetryState::PartiallyFailed { attempt, pending } => RetryState::Attempting {
                attempt: attempt + 1,
                pending,
            },
            other => other,
        }
    }
}

/// Computes the state after an attempt and the statistics adjustment it implies.
///
/// The first attempt counts every undelivered record as an error. Later
/// attempts only move records from errors to success as they get through,
/// so a batch that eventually succeeds ends with no errors left over.
pub fn step(state: RetryState, outcome: AttemptOutcome, max_attempts: u32) -> (RetryState, StatsDelta) {
    let RetryState::Attempting { attempt, pending } = state else {
        return (state, StatsDelta::default());
    };
    let first = attempt <= 1;

    let delivered = match outcome {
        AttemptOutcome::Delivered => pending,
        AttemptOutcome::Partial { success } => success.min(pending),
        AttemptOutcome::Failed => 0,
    };
    let remaining = pending - delivered;

    let delta = if first {
        StatsDelta {
            success: delivered as i64,
            errors: remaining as i64,
        }
    } else {
        StatsDelta {
            success: delivered as i64,
            errors: -(delivered as i64),
        }
    };

    let next = if remaining == 0 {
        RetryState::Succeeded
    } else if attempt >= max_attempts {
        RetryState::ExhaustedFailed {
            attempts: attempt,
            dropped: remaining,
        }
    } else {
        RetryState::PartiallyFailed {
            attempt,
            pending: remaining,
        }
    };
    (next, delta)
}

/// Delivers a batch to one sink, retrying the undelivered tail with a fixed
/// backoff. Returns false if any record was dropped. Once `cancel` fires no
/// further attempts are made.
pub async fn send_with_retry(
    sink: &mut dyn Sink,
    batch: &[Record],
    policy: &RetryPolicy,
    stats: &StatsStore,
    cancel: &CancellationToken,
) -> bool {
    let mut state = RetryState::start(batch.len());
    let mut last_error: Option<SinkError> = None;

    loop {
        match state {
            RetryState::Attempting { pending, .. } => {
                let result = sink.send(&batch[batch.len() - pending..]).await;
                let (next, delta) = step(state, AttemptOutcome::of(&result), policy.max_attempts);
                stats.apply_sink_delta(sink.name(), delta);
                if let Err(e) = result {
                    last_error = Some(e);
                }
                state = next;
            }
            RetryState::PartiallyFailed { attempt, pending } => {
                let reason = last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                warn!(
                    sink = %sink.name(),
                    attempt,
                    pending,
                    error = %reason,
                    "Send failed, retrying"
                );
                if cancel.is_cancelled() {
                    warn!(sink = %sink.name(), dropped = pending, "Stop requested, not retrying");
                    return false;
                }
                tokio::select! {
                    _ = tokio::time::sleep(policy.backoff) => {}
                    _ = cancel.cancelled() => {
                        warn!(sink = %sink.name(), dropped = pending, "Stop requested, not retrying");
                        return false;
                    }
                }
                state = state.retry();
            }
            RetryState::Succeeded => return true,
            RetryState::ExhaustedFailed { attempts, dropped } => {
                let sample = batch
                    .get(batch.len() - dropped)
                    .and_then(|r| serde_json::to_string(r).ok())
                    .unwrap_or_default();
                let reason = last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                error!(
                    sink = %sink.name(),
                    attempts,
                    dropped,
                    sample = %sample,
                    error = %reason,
                    "Retries exhausted, discarding records"
                );
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    #[test]
    fn test_partial_then_success_leaves_no_errors() {
        let state = RetryState::start(10);
        let (state, d1) = step(state, AttemptOutcome::Partial { success: 3 }, 3);
        assert_eq!(state, RetryState::PartiallyFailed { attempt: 1, pending: 7 });
        assert_eq!(d1, StatsDelta { success: 3, errors: 7 });

        let (state, d2) = step(state.retry(), AttemptOutcome::Delivered, 3);
        assert_eq!(state, RetryState::Succeeded);
        assert_eq!(d2, StatsDelta { success: 7, errors: -7 });

        assert_eq!(d1.success + d2.success, 10);
        assert_eq!(d1.errors + d2.errors, 0);
    }

    #[test]
    fn test_untyped_failure_counts_once() {
        let state = RetryState::start(5);
        let (state, d1) = step(state, AttemptOutcome::Failed, 3);
        assert_eq!(d1, StatsDelta { success: 0, errors: 5 });

        let (state, d2) = step(state.retry(), AttemptOutcome::Failed, 3);
        assert_eq!(d2, StatsDelta::default());

        let (state, d3) = step(state.retry(), AttemptOutcome::Failed, 3);
        assert_eq!(d3, StatsDelta::default());
        assert_eq!(state, RetryState::ExhaustedFailed { attempts: 3, dropped: 5 });
    }

    #[test]
    fn test_partial_retry_then_exhausted() {
        let state = RetryState::start(10);
        let (state, d1) = step(state, AttemptOutcome::Partial { success: 4 }, 2);
        let (state, d2) = step(state.retry(), AttemptOutcome::Partial { success: 2 }, 2);
        assert_eq!(state, RetryState::ExhaustedFailed { attempts: 2, dropped: 4 });
        assert_eq!(d1.success + d2.success, 6);
        assert_eq!(d1.errors + d2.errors, 4);
    }

    #[test]
    fn test_over_reported_success_is_clamped() {
        let (state, delta) = step(RetryState::start(2), AttemptOutcome::Partial { success: 9 }, 3);
        assert_eq!(state, RetryState::Succeeded);
        assert_eq!(delta, StatsDelta { success: 2, errors: 0 });
    }

    #[test]
    fn test_empty_batch_is_already_delivered() {
        assert_eq!(RetryState::start(0), RetryState::Succeeded);
    }

    struct Scripted {
        results: VecDeque<Result<(), SinkError>>,
        seen: Vec<usize>,
    }

    #[async_trait]
    impl Sink for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&mut self, records: &[Record]) -> Result<(), SinkError> {
            self.seen.push(records.len());
            self.results.pop_front().unwrap_or(Ok(()))
        }
    }

    fn partial(success: u64, errors: u64) -> Result<(), SinkError> {
        Err(SinkError::Partial {
            success,
            errors,
            source: "rejected".into(),
        })
    }

    fn batch(n: usize) -> Vec<Record> {
        (0..n).map(|_| Record::new()).collect()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_send_with_retry_resends_only_the_tail() {
        let mut sink = Scripted {
            results: VecDeque::from(vec![partial(3, 7), Ok(())]),
            seen: Vec::new(),
        };
        let stats = StatsStore::new("t", &["scripted".to_string()], Duration::from_secs(3));
        let ok = send_with_retry(&mut sink, &batch(10), &policy(), &stats, &CancellationToken::new()).await;

        assert!(ok);
        assert_eq!(sink.seen, vec![10, 7]);
        let s = &stats.status().sinks["scripted"];
        assert_eq!((s.success, s.errors), (10, 0));
    }

    #[tokio::test]
    async fn test_send_with_retry_gives_up() {
        let mut sink = Scripted {
            results: (0..3)
                .map(|_| Err(SinkError::Rejected { status: 500, message: "down".into() }))
                .collect(),
            seen: Vec::new(),
        };
        let stats = StatsStore::new("t", &["scripted".to_string()], Duration::from_secs(3));
        let ok = send_with_retry(&mut sink, &batch(4), &policy(), &stats, &CancellationToken::new()).await;

        assert!(!ok);
        assert_eq!(sink.seen, vec![4, 4, 4]);
        let s = &stats.status().sinks["scripted"];
        assert_eq!((s.success, s.errors), (0, 4));
    }

    #[tokio::test]
    async fn test_cancelled_makes_single_attempt() {
        let mut sink = Scripted {
            results: VecDeque::from(vec![Err(SinkError::Rejected { status: 500, message: "down".into() })]),
            seen: Vec::new(),
        };
        let stats = StatsStore::new("t", &["scripted".to_string()], Duration::from_secs(3));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ok = send_with_retry(&mut sink, &batch(2), &policy(), &stats, &cancel).await;
        assert!(!ok);
        assert_eq!(sink.seen, vec![2]);
    }
}
