//! Wiring a scheduler for one CLI invocation

use crate::settings::GlobalArgs;
use anyhow::{Context, Result};
use kiln_cache::CacheStore;
use kiln_core::{CompileTask, HistorySink, NoopHistory, TaskId};
use kiln_task::{JsonlHistory, KilnConfig, ProcessBridge, Scheduler};
use std::sync::Arc;
use std::time::Duration;

/// A started scheduler plus the cache it owns
pub struct Session {
    pub scheduler: Scheduler,
    cache: Option<CacheStore>,
}

impl Session {
    /// Open the cache and history, then start a scheduler over the process bridge
    pub fn start(args: &GlobalArgs, config: &KilnConfig) -> Result<Self> {
        let cache = if config.cache.enabled {
            let cache = CacheStore::open(config.cache.clone()).with_context(|| {
                format!("failed to open cache at {}", config.cache.base_dir.display())
            })?;
            cache.start_background_cleanup();
            Some(cache)
        } else {
            None
        };

        let history: Arc<dyn HistorySink> = match args.history_path() {
            Some(path) => Arc::new(
                JsonlHistory::open(&path)
                    .with_context(|| format!("failed to open history {}", path.display()))?,
            ),
            None => Arc::new(NoopHistory),
        };

        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            Arc::new(ProcessBridge::new()),
            cache.clone(),
            history,
        )?;
        scheduler.start()?;
        Ok(Self { scheduler, cache })
    }

    /// Wait for `ids` to finish. Ctrl-C cancels whatever is still outstanding.
    pub async fn run_to_completion(&self, ids: &[TaskId]) -> Result<Vec<CompileTask>> {
        let budget = wait_budget(&self.scheduler, ids.len());
        let finished = async {
            let mut tasks = Vec::with_capacity(ids.len());
            for id in ids {
                tasks.push(self.scheduler.wait_for(*id, budget).await?);
            }
            Ok::<_, kiln_core::Error>(tasks)
        };

        tokio::select! {
            tasks = finished => Ok(tasks?),
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, cancelling outstanding compiles");
                self.scheduler.shutdown().await;
                Ok(ids.iter().filter_map(|id| self.scheduler.get_task(*id)).collect())
            }
        }
    }

    pub async fn close(self) {
        self.scheduler.shutdown().await;
        if let Some(cache) = &self.cache {
            cache.shutdown();
        }
    }
}

/// Long enough for `count` tasks to each hit the timeout one after another
fn wait_budget(scheduler: &Scheduler, count: usize) -> Duration {
    let timeout = scheduler.config().task_timeout;
    let rounds = u32::try_from(count.max(1)).unwrap_or(u32::MAX);
    timeout
        .saturating_mul(rounds)
        .saturating_add(Duration::from_secs(60))
}
