// src/ingest/scheduler.rs
//! Concurrent dispatch of fetches.
//!
//! - global bound: one semaphore permit per in-flight fetch
//! - per-source floor: `RateLimiter` reserves start slots spaced by the
//!   source's `min_interval`, also across runs of the same scheduler
//! - faults: every fetch is its own task; a panic becomes that source's
//!   failure
//! - deadline: whatever has not finished is aborted and marked as timed out

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::FetchError;
use crate::ingest::providers::Fetchers;
use crate::ingest::types::{FetchResult, SourceDescriptor};
use crate::ingest::Pipeline;
use crate::report::{ReportEmitter, ReportFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerCfg {
    pub max_concurrency: usize,
    pub run_deadline: Option<Duration>,
}

impl SchedulerCfg {
    pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
    pub const DEFAULT_RUN_DEADLINE: Duration = Duration::from_secs(300);
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            max_concurrency: Self::DEFAULT_MAX_CONCURRENCY,
            run_deadline: Some(Self::DEFAULT_RUN_DEADLINE),
        }
    }
}

/// Per-source start spacing.
#[derive(Debug, Default)]
pub struct RateLimiter {
    last_started: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    /// Stand-in for spacings too large to add to an `Instant`.
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `name` may start. The slot is reserved under the lock so
    /// concurrent callers for the same source queue up behind each other.
    pub async fn acquire(&self, name: &str, interval: Option<Duration>) {
        let Some(interval) = interval.filter(|d| !d.is_zero()) else {
            return;
        };
        let start_at = {
            let mut map = match self.last_started.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            let slot = match map.get(name) {
                Some(prev) => prev
                    .checked_add(interval)
                    .unwrap_or(now + Self::FAR_FUTURE)
                    .max(now),
                None => now,
            };
            map.insert(name.to_string(), slot);
            slot
        };
        if start_at > Instant::now() {
            tracing::debug!(target: "ingest", source = name, wait_ms = (start_at - Instant::now()).as_millis() as u64, "rate limited");
            tokio::time::sleep_until(start_at).await;
        }
    }
}

pub struct Scheduler {
    cfg: SchedulerCfg,
    permits: Arc<Semaphore>,
    limiter: Arc<RateLimiter>,
}

impl Scheduler {
    pub fn new(cfg: SchedulerCfg) -> Self {
        let cfg = SchedulerCfg {
            max_concurrency: cfg.max_concurrency.max(1),
            ..cfg
        };
        Self {
            permits: Arc::new(Semaphore::new(cfg.max_concurrency)),
            limiter: Arc::new(RateLimiter::new()),
            cfg,
        }
    }

    pub fn cfg(&self) -> SchedulerCfg {
        self.cfg
    }

    /// Fetch every source. Results come back in the order of `sources`,
    /// one per source, whatever happened to it.
    pub async fn run(&self, sources: &[SourceDescriptor], fetchers: &Fetchers) -> Vec<FetchResult> {
        let started = Instant::now();
        // a deadline past the end of representable time is no deadline
        let deadline = self.cfg.run_deadline.and_then(|d| started.checked_add(d));

        let mut handles = Vec::with_capacity(sources.len());
        let mut pending = FuturesUnordered::new();
        for (idx, desc) in sources.iter().cloned().enumerate() {
            let permits = self.permits.clone();
            let limiter = self.limiter.clone();
            let fetchers = fetchers.clone();
            let handle: JoinHandle<FetchResult> = tokio::spawn(async move {
                limiter.acquire(&desc.name, desc.min_interval).await;
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                tracing::debug!(target: "ingest", source = %desc.name, method = %desc.method, "fetch start");
                fetchers.fetch(&desc).await
            });
            handles.push(handle.abort_handle());
            pending.push(async move { (idx, handle.await) });
        }

        let mut slots: Vec<Option<FetchResult>> = vec![None; sources.len()];
        let collect = async {
            while let Some((idx, joined)) = pending.next().await {
                let name = &sources[idx].name;
                let result = match joined {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::error!(target: "ingest", source = %name, error = %e, "fetch task died");
                        FetchResult::failed(name, FetchError::Unexpected, started.elapsed())
                    }
                };
                slots[idx] = Some(result);
            }
        };

        match deadline {
            Some(at) => {
                if tokio::time::timeout_at(at, collect).await.is_err() {
                    for h in &handles {
                        h.abort();
                    }
                }
            }
            None => collect.await,
        }

        slots
            .into_iter()
            .zip(sources)
            .map(|(slot, desc)| {
                slot.unwrap_or_else(|| {
                    let after = started.elapsed();
                    tracing::warn!(target: "ingest", source = %desc.name, after_ms = after.as_millis() as u64, "run deadline reached");
                    counter!("ingest_fetch_errors_total", "method" => desc.method.to_string()).increment(1);
                    FetchResult::failed(&desc.name, FetchError::Timeout { after }, after)
                })
            })
            .collect()
    }
}

/// Run the pipeline every `interval` and write reports. A failed tick is
/// logged; the loop keeps going.
pub fn spawn_periodic(
    pipeline: Arc<Pipeline>,
    interval: Duration,
    emitter: ReportEmitter,
    formats: Vec<ReportFormat>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match pipeline.run(None).await {
                Ok(report) => {
                    if let Err(e) = emitter.emit_all(&report, &formats) {
                        tracing::error!(target: "ingest", error = %e, "report emission failed");
                    }
                    tracing::info!(
                        target: "ingest",
                        run_id = %report.run_id,
                        records = report.records.len(),
                        outcome = ?report.outcome(),
                        "scheduled run finished"
                    );
                }
                Err(e) => tracing::error!(target: "ingest", error = %e, "scheduled run failed"),
            }
            gauge!("ingest_pipeline_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_same_source() {
        let rl = Arc::new(RateLimiter::new());
        let t0 = Instant::now();
        rl.acquire("a", Some(Duration::from_secs(60))).await;
        assert_eq!(t0.elapsed(), Duration::ZERO);

        let (r1, r2) = (rl.clone(), rl.clone());
        let a = tokio::spawn(async move {
            r1.acquire("a", Some(Duration::from_secs(60))).await;
            Instant::now()
        });
        let b = tokio::spawn(async move {
            r2.acquire("a", Some(Duration::from_secs(60))).await;
            Instant::now()
        });
        let (ta, tb) = (a.await.unwrap(), b.await.unwrap());
        let mut times = [ta - t0, tb - t0];
        times.sort();
        assert_eq!(times, [Duration::from_secs(60), Duration::from_secs(120)]);
    }

    #[tokio::test(start_paused = true)]
    async fn other_sources_are_not_delayed() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        rl.acquire("a", Some(Duration::from_secs(60))).await;
        rl.acquire("b", Some(Duration::from_secs(60))).await;
        rl.acquire("a", None).await;
        assert_eq!(t0.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_spacing_does_not_overflow() {
        let rl = RateLimiter::new();
        let t0 = Instant::now();
        rl.acquire("a", Some(Duration::MAX)).await;
        rl.acquire("a", Some(Duration::MAX)).await;
        assert_eq!(t0.elapsed(), RateLimiter::FAR_FUTURE);
    }

    #[tokio::test]
    async fn unrepresentable_deadline_means_no_deadline() {
        let s = Scheduler::new(SchedulerCfg {
            max_concurrency: 1,
            run_deadline: Some(Duration::from_secs(u64::MAX)),
        });
        let sources = vec![SourceDescriptor::http("a", vec!["https://a.test".into()])];
        let fetchers = Fetchers::uniform(Arc::new(Immediate));
        let results = s.run(&sources, &fetchers).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success());
    }

    struct Immediate;

    #[async_trait::async_trait]
    impl crate::ingest::providers::FetchStrategy for Immediate {
        async fn fetch(&self, desc: &SourceDescriptor) -> FetchResult {
            FetchResult::ok(&desc.name, vec![], Duration::ZERO)
        }

        fn name(&self) -> &'static str {
            "instant"
        }
    }

    #[test]
    fn concurrency_floor_is_one() {
        let s = Scheduler::new(SchedulerCfg {
            max_concurrency: 0,
            run_deadline: None,
        });
        assert_eq!(s.cfg().max_concurrency, 1);
    }
}
