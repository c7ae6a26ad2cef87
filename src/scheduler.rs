//! Kolejka skanów z ograniczoną współbieżnością.
//!
//! `tokio::sync::Semaphore` jest sprawiedliwy (FIFO), więc kolejność przyjęcia
//! = kolejność wywołań `submit`. Przyjęty skan działa w osobnym zadaniu z
//! własnym permitem: slot zwalnia się po zakończeniu (także po panice) i
//! nie zależy od tego, czy wywołujący jeszcze czeka na wynik.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::error::ScanError;
use crate::scanner::{DetectionResult, Detector, ScanRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub max_concurrent: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Zmniejsza licznik przy drop (czekający wywołujący mógł zostać anulowany).
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(c: &'a AtomicUsize) -> Self {
        c.fetch_add(1, Ordering::SeqCst);
        Self(c)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ScanScheduler {
    detector: Arc<Detector>,
    slots: Arc<Semaphore>,
    max: usize,
    counters: Arc<Counters>,
}

impl ScanScheduler {
    pub fn new(detector: Arc<Detector>, max_concurrent: usize) -> Self {
        let max = max_concurrent.max(1);
        Self {
            detector,
            slots: Arc::new(Semaphore::new(max)),
            max,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn detector(&self) -> &Arc<Detector> {
        &self.detector
    }

    /// Czeka na slot (FIFO), wykonuje skan i zwraca jego wynik.
    pub async fn submit(&self, req: ScanRequest) -> Result<DetectionResult, ScanError> {
        let permit = {
            let _queued = Gauge::enter(&self.counters.queued);
            self.slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ScanError::Aborted("scheduler closed".into()))?
        };

        let counters = self.counters.clone();
        let detector = self.detector.clone();
        counters.in_flight.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            submitted_at = %req.submitted_at,
            in_flight = counters.in_flight.load(Ordering::SeqCst),
            "scan admitted"
        );

        let handle = tokio::spawn(async move {
            let _in_flight = InFlight(counters.clone());
            let _permit = permit;
            let res = detector.scan(req).await;
            match &res {
                Ok(_) => counters.completed.fetch_add(1, Ordering::SeqCst),
                Err(_) => counters.failed.fetch_add(1, Ordering::SeqCst),
            };
            res
        });

        match handle.await {
            Ok(res) => res,
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                Err(ScanError::Aborted(e.to_string()))
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            max_concurrent: self.max,
            queued: self.counters.queued.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }
}

struct InFlight(Arc<Counters>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
