//! Token aggregation.
//!
//! One reputation evaluation fans out N independent token lookups (one per
//! query string the feature extractors produced), counts completions, and
//! finalizes exactly once when the count reaches N, whatever order the
//! lookups land in and however many of them fail. Failed lookups count
//! toward completion and contribute nothing to the score. N = 0 finalizes
//! immediately with an empty outcome.
//!
//! A lookup whose transport never resolves leaves its evaluation
//! unfinalized; timeouts belong to the transport, this layer has no
//! cancellation path.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::token::{TokenBackend, TokenValue};

/// Everything one evaluation collected, handed to the scoring function.
#[derive(Debug, Default)]
pub struct Outcome {
    pub expected: usize,
    pub received: usize,
    pub errors: usize,
    /// Per-query result in completion order; `None` marks a failed lookup.
    pub tokens: Vec<(String, Option<TokenValue>)>,
}

impl Outcome {
    /// Successfully returned token values.
    pub fn values(&self) -> impl Iterator<Item = &TokenValue> {
        self.tokens.iter().filter_map(|(_, v)| v.as_ref())
    }
}

/// Final result of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreReport {
    pub score: f64,
    pub expected: usize,
    pub received: usize,
    pub errors: usize,
}

/// Result of a fan-out write ([`Aggregator::update`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub expected: usize,
    pub received: usize,
    pub errors: usize,
}

pub type ScoreFn = Arc<dyn Fn(&Outcome) -> f64 + Send + Sync>;

/// Normalized weighted sum over category counters.
///
/// Sums `weight * counter` over every returned token and divides by the
/// total counter mass; below `min_samples` total mass the score is 0 (not
/// enough evidence to say anything).
pub fn weighted_score(weights: Vec<(String, f64)>, min_samples: f64) -> ScoreFn {
    Arc::new(move |outcome: &Outcome| {
        let mut num = 0.0;
        let mut total = 0.0;
        for token in outcome.values() {
            for (category, weight) in &weights {
                if let Some(count) = token.get(category) {
                    num += weight * count;
                    total += count;
                }
            }
        }
        if total < min_samples || total <= 0.0 {
            0.0
        } else {
            num / total
        }
    })
}

/// Fans token lookups out over a backend and folds them into one score.
pub struct Aggregator {
    backend: Arc<dyn TokenBackend>,
    score: ScoreFn,
}

impl Aggregator {
    pub fn new(backend: Arc<dyn TokenBackend>, score: ScoreFn) -> Aggregator {
        Aggregator { backend, score }
    }

    /// Aggregator with the default weighted scoring function.
    pub fn weighted(
        backend: Arc<dyn TokenBackend>,
        weights: Vec<(String, f64)>,
        min_samples: f64,
    ) -> Aggregator {
        Aggregator::new(backend, weighted_score(weights, min_samples))
    }

    /// Evaluate one query list. Resolves after exactly `queries.len()`
    /// completion signals, with the finalize step run exactly once.
    pub async fn run(&self, queries: Vec<String>) -> ScoreReport {
        let expected = queries.len();
        let mut outcome = Outcome {
            expected,
            ..Outcome::default()
        };

        let mut lookups = FuturesUnordered::new();
        for query in queries {
            let backend = self.backend.clone();
            lookups.push(async move {
                let result = backend.get_token(&query).await;
                (query, result)
            });
        }

        // The received counter is the sole completion trigger; both arms
        // increment it.
        while let Some((query, result)) = lookups.next().await {
            outcome.received += 1;
            match result {
                Ok(token) => outcome.tokens.push((query, Some(token))),
                Err(e) => {
                    debug!(%query, error = %e, "token lookup failed, counting as absent");
                    outcome.errors += 1;
                    outcome.tokens.push((query, None));
                }
            }
            if outcome.received == outcome.expected {
                break;
            }
        }

        let score = (self.score)(&outcome);
        ScoreReport {
            score,
            expected: outcome.expected,
            received: outcome.received,
            errors: outcome.errors,
        }
    }

    /// Fan `set_token` out over the same query list (the learn / feedback
    /// path). Same join semantics as [`Aggregator::run`]: resolves after
    /// every write completed, failures counted, never aborted early.
    pub async fn update(&self, queries: Vec<String>, values: &TokenValue) -> UpdateReport {
        let expected = queries.len();
        let mut received = 0;
        let mut errors = 0;

        let mut writes = FuturesUnordered::new();
        for query in queries {
            let backend = self.backend.clone();
            let values = values.clone();
            writes.push(async move {
                let result = backend.set_token(&query, &values).await;
                (query, result)
            });
        }

        while let Some((query, result)) = writes.next().await {
            received += 1;
            if let Err(e) = result {
                debug!(%query, error = %e, "token update failed");
                errors += 1;
            }
            if received == expected {
                break;
            }
        }

        UpdateReport {
            expected,
            received,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{ResolveError, TokenError};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend over a fixed table; names listed in `failing` error out.
    #[derive(Default)]
    struct TableBackend {
        tokens: HashMap<String, TokenValue>,
        failing: Vec<String>,
        writes: Mutex<Vec<(String, TokenValue)>>,
    }

    impl TokenBackend for TableBackend {
        fn get_token<'a>(
            &'a self,
            key: &'a str,
        ) -> BoxFuture<'a, Result<TokenValue, TokenError>> {
            Box::pin(async move {
                if self.failing.iter().any(|k| k == key) {
                    return Err(TokenError::Resolve(ResolveError("injected".into())));
                }
                Ok(self.tokens.get(key).cloned().unwrap_or_default())
            })
        }

        fn set_token<'a>(
            &'a self,
            key: &'a str,
            values: &'a TokenValue,
        ) -> BoxFuture<'a, Result<(), TokenError>> {
            Box::pin(async move {
                if self.failing.iter().any(|k| k == key) {
                    return Err(TokenError::Resolve(ResolveError("injected".into())));
                }
                self.writes.lock().push((key.to_string(), values.clone()));
                Ok(())
            })
        }
    }

    fn queries(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Scorer that counts invocations, for exactly-once checks.
    fn counting_score(calls: Arc<AtomicUsize>, inner: ScoreFn) -> ScoreFn {
        Arc::new(move |outcome| {
            calls.fetch_add(1, Ordering::SeqCst);
            inner(outcome)
        })
    }

    #[tokio::test]
    async fn empty_query_list_finalizes_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let aggregator = Aggregator::new(
            Arc::new(TableBackend::default()),
            counting_score(calls.clone(), weighted_score(vec![], 0.0)),
        );
        let report = aggregator.run(Vec::new()).await;
        assert_eq!(report.expected, 0);
        assert_eq!(report.received, 0);
        assert_eq!(report.score, 0.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finalize_runs_once_after_all_completions() {
        let mut backend = TableBackend::default();
        backend
            .tokens
            .insert("q1".into(), TokenValue::new().with("h", 2.0));
        backend
            .tokens
            .insert("q2".into(), TokenValue::new().with("s", 4.0));
        backend
            .tokens
            .insert("q3".into(), TokenValue::new().with("h", 1.0));

        let calls = Arc::new(AtomicUsize::new(0));
        let weights = vec![("h".to_string(), -1.0), ("s".to_string(), 1.0)];
        let aggregator = Aggregator::new(
            Arc::new(backend),
            counting_score(calls.clone(), weighted_score(weights, 0.0)),
        );

        let report = aggregator.run(queries(&["q1", "q2", "q3"])).await;
        assert_eq!(report.received, 3);
        assert_eq!(report.errors, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // (-1*2 + 1*4 + -1*1) / (2 + 4 + 1)
        assert!((report.score - (1.0 / 7.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_lookups_count_but_do_not_score() {
        let mut backend = TableBackend::default();
        backend
            .tokens
            .insert("q1".into(), TokenValue::new().with("s", 3.0));
        backend
            .tokens
            .insert("q3".into(), TokenValue::new().with("s", 1.0));
        backend.failing.push("q2".into());

        let calls = Arc::new(AtomicUsize::new(0));
        let weights = vec![("s".to_string(), 1.0)];
        let aggregator = Aggregator::new(
            Arc::new(backend),
            counting_score(calls.clone(), weighted_score(weights, 0.0)),
        );

        let report = aggregator.run(queries(&["q1", "q2", "q3"])).await;
        assert_eq!(report.received, 3);
        assert_eq!(report.errors, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Only q1 and q3 contribute: (3 + 1) / (3 + 1) = 1.
        assert!((report.score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn below_min_samples_scores_zero() {
        let mut backend = TableBackend::default();
        backend
            .tokens
            .insert("q1".into(), TokenValue::new().with("s", 2.0));

        let weights = vec![("s".to_string(), 1.0)];
        let aggregator = Aggregator::weighted(Arc::new(backend), weights, 10.0);
        let report = aggregator.run(queries(&["q1"])).await;
        assert_eq!(report.score, 0.0);
    }

    #[tokio::test]
    async fn empty_tokens_complete_without_contributing() {
        // Key absent: empty token, a valid zero-strength sample.
        let backend = TableBackend::default();
        let weights = vec![("s".to_string(), 1.0)];
        let aggregator = Aggregator::weighted(Arc::new(backend), weights, 0.0);
        let report = aggregator.run(queries(&["q1", "q2"])).await;
        assert_eq!(report.received, 2);
        assert_eq!(report.errors, 0);
        assert_eq!(report.score, 0.0);
    }

    #[tokio::test]
    async fn update_fans_out_and_counts_failures() {
        let mut backend = TableBackend::default();
        backend.failing.push("q2".into());
        let backend = Arc::new(backend);
        let aggregator =
            Aggregator::weighted(backend.clone(), vec![("s".to_string(), 1.0)], 0.0);

        let delta = TokenValue::new().with("s", 1.0);
        let report = aggregator
            .update(queries(&["q1", "q2", "q3"]), &delta)
            .await;
        assert_eq!(report.received, 3);
        assert_eq!(report.errors, 1);

        let writes = backend.writes.lock();
        let written: Vec<&str> = writes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(writes.len(), 2);
        assert!(written.contains(&"q1") && written.contains(&"q3"));
    }
}
