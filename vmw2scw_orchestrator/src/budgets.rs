//! Layered concurrency budgets (§4.8, §5): a global worker budget plus
//! resource-specific budgets for per-host exports, conversions, uploads
//! and imports. Each stage acquires the global permit first, then its
//! resource-specific permit, holding both for the stage's duration.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use vmw2scw_pipeline::StageGate;
use vmw2scw_types::{Concurrency, Stage};

/// The permits held for one stage invocation. Dropped (and so released)
/// when the stage finishes, whether it succeeded or failed.
pub struct StagePermits {
    _permits: Vec<OwnedSemaphorePermit>,
}

/// The full set of named budgets for one batch run.
pub struct Budgets {
    global: Arc<Semaphore>,
    conversions: Arc<Semaphore>,
    uploads: Arc<Semaphore>,
    imports: Arc<Semaphore>,
    max_exports_per_host: u32,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Budgets {
    pub fn new(concurrency: Concurrency) -> Self {
        Self {
            global: Arc::new(Semaphore::new(concurrency.max_total_workers as usize)),
            conversions: Arc::new(Semaphore::new(concurrency.max_concurrent_conversions as usize)),
            uploads: Arc::new(Semaphore::new(concurrency.max_concurrent_uploads as usize)),
            imports: Arc::new(Semaphore::new(concurrency.max_concurrent_imports as usize)),
            max_exports_per_host: concurrency.max_exports_per_host,
            per_host: Mutex::new(HashMap::new()),
        }
    }

    async fn host_budget(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.per_host.lock().await;
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_exports_per_host as usize)))
            .clone()
    }

    /// Acquire the permits required for `stage` against `source_host`,
    /// per the stage-to-budget table in §4.8. The global permit is always
    /// acquired first so a resource-starved stage never starves the rest
    /// of the worker pool waiting behind it.
    pub async fn acquire_for_stage(&self, stage: Stage, source_host: &str) -> StagePermits {
        let mut permits = Vec::with_capacity(2);
        permits.push(
            self.global
                .clone()
                .acquire_owned()
                .await
                .expect("global budget semaphore is never closed"),
        );

        let resource = match stage {
            Stage::Validate | Stage::Cleanup => None,
            Stage::Snapshot | Stage::Export => Some(self.host_budget(source_host).await),
            Stage::Convert
            | Stage::AdaptGuest
            | Stage::CleanTools
            | Stage::InjectVirtio
            | Stage::FixBootloader
            | Stage::EnsureUefi => Some(self.conversions.clone()),
            Stage::Upload => Some(self.uploads.clone()),
            Stage::Import | Stage::Verify => Some(self.imports.clone()),
        };

        if let Some(resource) = resource {
            permits.push(resource.acquire_owned().await.expect("resource budget semaphore is never closed"));
        }

        StagePermits { _permits: permits }
    }
}

#[async_trait::async_trait]
impl StageGate for Budgets {
    async fn acquire(&self, stage: Stage, source_host: &str) -> Box<dyn Send> {
        Box::new(self.acquire_for_stage(stage, source_host).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conversions_budget_caps_concurrent_holders() {
        let budgets = Arc::new(Budgets::new(Concurrency {
            max_total_workers: 10,
            max_exports_per_host: 4,
            max_concurrent_conversions: 2,
            max_concurrent_uploads: 6,
            max_concurrent_imports: 5,
        }));
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let budgets = budgets.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permits = budgets.acquire_for_stage(Stage::Convert, "esxi-1").await;
                let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn per_host_budget_is_independent_across_hosts() {
        let budgets = Budgets::new(Concurrency {
            max_total_workers: 10,
            max_exports_per_host: 1,
            max_concurrent_conversions: 3,
            max_concurrent_uploads: 6,
            max_concurrent_imports: 5,
        });
        let a = budgets.acquire_for_stage(Stage::Export, "esxi-1").await;
        let b = budgets.acquire_for_stage(Stage::Export, "esxi-2").await;
        drop(a);
        drop(b);
    }
}
