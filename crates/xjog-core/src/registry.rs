// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The machine registry.
//!
//! One slot per registered machine, each holding an LRU cache of chart
//! executors. A cache miss rehydrates the executor from the persisted
//! snapshot; overflow evicts the least-recently-used executor, waiting for
//! its chart mutex to fall idle so a live transition is never torn.
//! Registration closes once the engine starts.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use lru::LruCache;
use tracing::debug;

use xjog_machine::{ChartReference, Machine};

use crate::engine::EngineInner;
use crate::error::{ChartError, Result};
use crate::persistence::PersistenceStore;
use crate::executor::ChartExecutor;
use crate::util::TimedMutex;

/// Result of a chart lookup.
pub(crate) enum ChartLookup {
    /// A live executor, cached or freshly rehydrated.
    Hit(Arc<ChartExecutor>),
    /// The chart row exists but is paused awaiting adoption; sends must be
    /// parked on the deferred queue.
    Paused,
    /// No such chart.
    Missing,
}

struct MachineSlot {
    machine: Arc<dyn Machine>,
    charts: TimedMutex<LruCache<String, Arc<ChartExecutor>>>,
}

/// Per-machine chart executor cache.
pub struct MachineRegistry {
    engine: Weak<EngineInner>,
    machines: RwLock<std::collections::HashMap<String, Arc<MachineSlot>>>,
    registration_open: AtomicBool,
}

impl MachineRegistry {
    pub(crate) fn new(engine: Weak<EngineInner>) -> Self {
        Self {
            engine,
            machines: RwLock::new(std::collections::HashMap::new()),
            registration_open: AtomicBool::new(true),
        }
    }

    fn inner(&self) -> Result<Arc<EngineInner>> {
        self.engine
            .upgrade()
            .ok_or_else(|| ChartError::storage("registry", "engine dropped"))
    }

    /// Add a machine definition. Legal only before the engine starts.
    pub(crate) fn register_machine(&self, machine: Arc<dyn Machine>) -> Result<()> {
        if !self.registration_open.load(Ordering::SeqCst) {
            return Err(ChartError::RegistrationClosed);
        }
        let inner = self.inner()?;
        let cache_size = NonZeroUsize::new(inner.options.machine.cache_size)
            .unwrap_or(NonZeroUsize::MIN);
        let machine_id = machine.id().to_string();

        let mut machines = self.machines.write().expect("machine registry poisoned");
        if machines.contains_key(&machine_id) {
            return Err(ChartError::Conflict {
                what: format!("machine '{machine_id}'"),
            });
        }
        machines.insert(
            machine_id,
            Arc::new(MachineSlot {
                machine,
                charts: TimedMutex::new(
                    LruCache::new(cache_size),
                    inner.options.cache_mutex_timeout(),
                ),
            }),
        );
        Ok(())
    }

    /// Refuse further machine registration.
    pub(crate) fn close_registration(&self) {
        self.registration_open.store(false, Ordering::SeqCst);
    }

    fn slot(&self, machine_id: &str) -> Result<Arc<MachineSlot>> {
        self.machines
            .read()
            .expect("machine registry poisoned")
            .get(machine_id)
            .cloned()
            .ok_or_else(|| ChartError::MachineNotFound {
                machine_id: machine_id.to_string(),
            })
    }

    /// The machine definition behind an id.
    pub(crate) fn machine(&self, machine_id: &str) -> Result<Arc<dyn Machine>> {
        Ok(self.slot(machine_id)?.machine.clone())
    }

    /// Look a chart up, rehydrating it into the cache on a miss.
    pub(crate) async fn get_chart(&self, reference: &ChartReference) -> Result<ChartLookup> {
        let inner = self.inner()?;
        let slot = self.slot(&reference.machine_id)?;

        let (executor, evicted) = {
            let mut cache = slot.charts.lock("machine cache").await?;
            if let Some(executor) = cache.get(&reference.chart_id) {
                return Ok(ChartLookup::Hit(executor.clone()));
            }

            let Some(row) = inner.store.read_chart(reference).await? else {
                return Ok(ChartLookup::Missing);
            };
            if row.paused {
                return Ok(ChartLookup::Paused);
            }

            let executor = ChartExecutor::rehydrate(
                &inner,
                slot.machine.clone(),
                row.reference(),
                row.parent_reference(),
                &row.state,
            )?;
            let evicted = match cache.push(reference.chart_id.clone(), executor.clone()) {
                Some((key, victim)) if key != reference.chart_id => Some(victim),
                _ => None,
            };
            (executor, evicted)
        };

        if let Some(victim) = evicted {
            Self::retire(victim).await;
        }

        Ok(ChartLookup::Hit(executor))
    }

    /// Insert a freshly created executor, evicting overflow.
    pub(crate) async fn insert(
        &self,
        reference: &ChartReference,
        executor: Arc<ChartExecutor>,
    ) -> Result<()> {
        let slot = self.slot(&reference.machine_id)?;
        let evicted = {
            let mut cache = slot.charts.lock("machine cache").await?;
            match cache.push(reference.chart_id.clone(), executor) {
                Some((key, victim)) if key != reference.chart_id => Some(victim),
                _ => None,
            }
        };
        if let Some(victim) = evicted {
            Self::retire(victim).await;
        }
        Ok(())
    }

    /// Promote a chart to most-recently-used.
    pub(crate) async fn touch(&self, reference: &ChartReference) {
        let Ok(slot) = self.slot(&reference.machine_id) else {
            return;
        };
        if let Ok(mut cache) = slot.charts.lock("machine cache").await {
            let _ = cache.get(&reference.chart_id);
        };
    }

    /// Drop a chart from the cache (after destruction).
    pub(crate) async fn remove(&self, reference: &ChartReference) -> Result<()> {
        let slot = self.slot(&reference.machine_id)?;
        let mut cache = slot.charts.lock("machine cache").await?;
        cache.pop(&reference.chart_id);
        Ok(())
    }

    /// Wait for an evicted executor's chart mutex to fall idle before
    /// letting it go, so eviction never tears a live transition.
    async fn retire(victim: Arc<ChartExecutor>) {
        debug!(chart = %victim.reference(), "evicting chart executor");
        victim.wait_idle().await;
    }

    /// Number of cached executors for one machine.
    #[cfg(test)]
    pub(crate) async fn cached_count(&self, machine_id: &str) -> Result<usize> {
        let slot = self.slot(machine_id)?;
        let cache = slot.charts.lock("machine cache").await?;
        Ok(cache.len())
    }
}
