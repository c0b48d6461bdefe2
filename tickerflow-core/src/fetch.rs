//! Bounded-concurrency fan-out over a per-entity fetch function.
//!
//! Each fetcher owns a private rayon pool with exactly `max_concurrency`
//! threads, so at most that many fetches are ever in flight. Results come
//! back in input order: slot `i` belongs to entity `i` whatever order the
//! fetches finish in.

use crate::classify::{classify, Classified};
use crate::entity::EntityId;
use crate::error::EtlError;
use crate::source::{FetchFn, SourceError};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// What one entity's fetch produced.
#[derive(Debug)]
pub enum FetchOutcome {
    Payload(Vec<u8>),
    Empty,
    Failure(SourceError),
}

impl FetchOutcome {
    pub fn from_result(result: Result<Vec<u8>, SourceError>) -> Self {
        match result {
            Ok(body) => match classify(body) {
                Classified::Empty => FetchOutcome::Empty,
                Classified::Payload(bytes) => FetchOutcome::Payload(bytes),
            },
            Err(e) => FetchOutcome::Failure(e),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FetchOutcome::Failure(_))
    }
}

/// Runs fetches on a dedicated, fixed-size worker pool.
pub struct BoundedFetcher {
    pool: rayon::ThreadPool,
    max_concurrency: usize,
}

impl BoundedFetcher {
    pub fn new(max_concurrency: usize) -> Result<Self, EtlError> {
        if max_concurrency == 0 {
            return Err(EtlError::Configuration(
                "max_concurrency must be at least 1".into(),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_concurrency)
            .thread_name(|i| format!("fetch-{i}"))
            .build()
            .map_err(|e| EtlError::WorkerPool(e.to_string()))?;
        Ok(Self {
            pool,
            max_concurrency,
        })
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Fetch every entity and keep every outcome, failures included.
    pub fn fetch_outcomes(&self, entities: &[EntityId], fetch: &FetchFn<'_>) -> Vec<FetchOutcome> {
        self.pool.install(|| {
            entities
                .par_iter()
                .map(|entity| {
                    let outcome = FetchOutcome::from_result(fetch(entity));
                    log_outcome(entity, &outcome);
                    outcome
                })
                .collect()
        })
    }

    /// Fetch every entity, stopping at the first failure.
    ///
    /// `None` marks an entity that answered with the empty sentinel. After the
    /// first observed error no new fetch starts; fetches already running are
    /// allowed to finish, then the error is returned and every payload
    /// collected by this call is dropped.
    pub fn fetch_all(
        &self,
        entities: &[EntityId],
        fetch: &FetchFn<'_>,
    ) -> Result<Vec<Option<Vec<u8>>>, EtlError> {
        let aborted = AtomicBool::new(false);
        let first_error: Mutex<Option<EtlError>> = Mutex::new(None);

        let slots: Vec<Option<Vec<u8>>> = self.pool.install(|| {
            entities
                .par_iter()
                .map(|entity| {
                    if aborted.load(Ordering::Acquire) {
                        return None;
                    }
                    let outcome = FetchOutcome::from_result(fetch(entity));
                    log_outcome(entity, &outcome);
                    match outcome {
                        FetchOutcome::Payload(bytes) => Some(bytes),
                        FetchOutcome::Empty => None,
                        FetchOutcome::Failure(source) => {
                            if !aborted.swap(true, Ordering::AcqRel) {
                                let mut slot =
                                    first_error.lock().unwrap_or_else(|p| p.into_inner());
                                *slot = Some(EtlError::Fetch {
                                    entity: entity.clone(),
                                    source,
                                });
                            }
                            None
                        }
                    }
                })
                .collect()
        });

        match first_error.into_inner().unwrap_or_else(|p| p.into_inner()) {
            Some(err) => Err(err),
            None => Ok(slots),
        }
    }
}

fn log_outcome(entity: &EntityId, outcome: &FetchOutcome) {
    match outcome {
        FetchOutcome::Empty => {
            // The source also answers "None" to some unauthorized requests.
            tracing::debug!(ticker = %entity, "empty response");
        }
        FetchOutcome::Failure(e) => tracing::debug!(ticker = %entity, error = %e, "fetch failed"),
        FetchOutcome::Payload(bytes) => {
            tracing::trace!(ticker = %entity, bytes = bytes.len(), "fetched")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ids(n: usize) -> Vec<EntityId> {
        (0..n).map(|i| EntityId::new(format!("T{i}"))).collect()
    }

    #[test]
    fn zero_bound_is_rejected() {
        assert!(matches!(
            BoundedFetcher::new(0),
            Err(EtlError::Configuration(_))
        ));
    }

    #[test]
    fn sentinel_maps_to_none() {
        let fetcher = BoundedFetcher::new(4).unwrap();
        let entities = ids(3);
        let fetch = |e: &EntityId| -> Result<Vec<u8>, SourceError> {
            if e.as_str() == "T1" {
                Ok(b"None".to_vec())
            } else {
                Ok(e.as_str().as_bytes().to_vec())
            }
        };
        let out = fetcher.fetch_all(&entities, &fetch).unwrap();
        assert_eq!(out, vec![Some(b"T0".to_vec()), None, Some(b"T2".to_vec())]);
    }

    #[test]
    fn first_error_is_wrapped_with_entity() {
        let fetcher = BoundedFetcher::new(2).unwrap();
        let entities = ids(6);
        let fetch = |e: &EntityId| -> Result<Vec<u8>, SourceError> {
            if e.as_str() == "T3" {
                Err(SourceError::Timeout("slow".into()))
            } else {
                Ok(b"a\n1\n".to_vec())
            }
        };
        let err = fetcher.fetch_all(&entities, &fetch).unwrap_err();
        assert_eq!(err.entity(), Some(&EntityId::new("T3")));
        assert!(err.to_string().contains("T3"));
    }

    #[test]
    fn no_new_fetches_after_failure_on_single_worker() {
        let fetcher = BoundedFetcher::new(1).unwrap();
        let entities = ids(50);
        let calls = AtomicUsize::new(0);
        let fetch = |e: &EntityId| -> Result<Vec<u8>, SourceError> {
            calls.fetch_add(1, Ordering::SeqCst);
            if e.as_str() == "T0" {
                Err(SourceError::UnexpectedResponse("bad".into()))
            } else {
                Ok(Vec::new())
            }
        };
        assert!(fetcher.fetch_all(&entities, &fetch).is_err());
        assert!(calls.load(Ordering::SeqCst) < entities.len());
    }

    #[test]
    fn outcomes_keep_failures_in_place() {
        let fetcher = BoundedFetcher::new(3).unwrap();
        let entities = ids(5);
        let fetch = |e: &EntityId| -> Result<Vec<u8>, SourceError> {
            match e.as_str() {
                "T1" => Err(SourceError::Http {
                    status: 500,
                    body: String::new(),
                }),
                "T4" => Ok(b"None".to_vec()),
                _ => Ok(b"x\n".to_vec()),
            }
        };
        let out = fetcher.fetch_outcomes(&entities, &fetch);
        assert!(matches!(out[0], FetchOutcome::Payload(_)));
        assert!(out[1].is_failure());
        assert!(matches!(out[4], FetchOutcome::Empty));
    }
}
