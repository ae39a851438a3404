// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance startup, overthrow, adoption and shutdown.
//!
//! An engine instance moves through
//!
//! ```text
//!     initial → starting → adopting → ready → dying → halted
//! ```
//!
//! Starting commits the overthrow: every other instance is flagged dying
//! and every chart paused. Adoption then repeatedly picks up idle paused
//! charts; charts guarded by activity markers wait for the grace period,
//! which is quiescence-based: every pass that adopts at least one chart
//! pushes the deadline out, and only a quiet period with paused charts
//! still remaining triggers forcible adoption.
//!
//! Dying reverses it: deferred leases released, activities stopped, the
//! instance row removed, and, while another live instance exists, a
//! poll until our charts have been adopted. Background loops never throw;
//! they log and re-arm.

use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use xjog_machine::ChartReference;

use crate::engine::EngineInner;
use crate::error::{ChartError, Result};
use crate::registry::ChartLookup;
use crate::persistence::PersistenceStore;
use crate::util::correlation_id;

/// How often a non-dying instance checks its own death flag.
const DEATH_POLL_FREQUENCY: Duration = Duration::from_millis(500);

/// Lifecycle phase of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum EnginePhase {
    /// Constructed, not yet started.
    Initial,
    /// Overthrow in progress.
    Starting,
    /// Adopting paused charts.
    Adopting,
    /// Serving sends.
    Ready,
    /// Draining for shutdown.
    Dying,
    /// Fully stopped.
    Halted,
}

/// Drives instance registration, adoption and shutdown.
pub struct StartupManager {
    engine: Weak<EngineInner>,
    phase_tx: watch::Sender<EnginePhase>,
    shutdown_started: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl StartupManager {
    pub(crate) fn new(engine: Weak<EngineInner>) -> Self {
        let (phase_tx, _) = watch::channel(EnginePhase::Initial);
        Self {
            engine,
            phase_tx,
            shutdown_started: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> EnginePhase {
        *self.phase_tx.borrow()
    }

    /// Watch phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<EnginePhase> {
        self.phase_tx.subscribe()
    }

    fn set_phase(&self, phase: EnginePhase) {
        if *self.phase_tx.borrow() != phase {
            info!(phase = %phase, "engine phase");
            let _ = self.phase_tx.send(phase);
        }
    }

    /// Whether the instance is draining or stopped.
    pub fn is_dying(&self) -> bool {
        matches!(self.phase(), EnginePhase::Dying | EnginePhase::Halted)
    }

    /// Starting: commit the overthrow and enter adoption.
    pub(crate) async fn begin(&self, inner: &Arc<EngineInner>) -> Result<()> {
        self.set_phase(EnginePhase::Starting);
        inner
            .store
            .overthrow_other_instances(&inner.instance_id)
            .await?;
        info!(instance = %inner.instance_id, "other instances overthrown");
        self.set_phase(EnginePhase::Adopting);
        Ok(())
    }

    /// Spawn the adoption loop and the death-note poll.
    pub(crate) fn spawn_background(&self, inner: Arc<EngineInner>) {
        let mut background = self.background.lock().expect("startup tasks poisoned");
        background.push(tokio::spawn(Self::run_adoption(inner.clone())));
        background.push(tokio::spawn(Self::run_death_watch(inner)));
    }

    /// The adoption loop: gentle passes, quiescence grace, forcible
    /// fallback.
    async fn run_adoption(inner: Arc<EngineInner>) {
        let options = inner.options.startup.clone();
        let mut deadline = Instant::now() + options.grace_period;

        loop {
            if inner.startup.phase() != EnginePhase::Adopting {
                return;
            }

            match inner.store.gently_adopt_charts(&inner.instance_id).await {
                Ok(adopted) => {
                    if !adopted.is_empty() {
                        info!(count = adopted.len(), "charts adopted");
                        // Progress resets the quiescence grace.
                        deadline = Instant::now() + options.grace_period;
                    }
                    for reference in adopted {
                        Self::run_step_for(&inner, &reference).await;
                    }
                }
                Err(error) => error!(%error, "gentle adoption pass failed"),
            }

            match inner.store.count_paused_charts().await {
                Ok(0) => {
                    inner.startup.set_phase(EnginePhase::Ready);
                    return;
                }
                Ok(paused) => {
                    if Instant::now() >= deadline {
                        warn!(paused, "grace period expired, adopting forcibly");
                        match inner.store.forcibly_adopt_charts(&inner.instance_id).await {
                            Ok(adopted) => {
                                info!(count = adopted.len(), "charts adopted forcibly");
                                for reference in adopted {
                                    Self::run_step_for(&inner, &reference).await;
                                }
                                inner.startup.set_phase(EnginePhase::Ready);
                                return;
                            }
                            Err(error) => error!(%error, "forcible adoption failed"),
                        }
                    }
                }
                Err(error) => error!(%error, "paused chart count failed"),
            }

            tokio::time::sleep(options.adoption_frequency).await;
        }
    }

    /// Load an adopted chart and re-run its entry actions, restarting its
    /// activities.
    async fn run_step_for(inner: &Arc<EngineInner>, reference: &ChartReference) {
        let cid = correlation_id();
        match inner.registry.get_chart(reference).await {
            Ok(ChartLookup::Hit(executor)) => {
                if let Err(error) = executor.run_step(&cid).await {
                    error!(cid, chart = %reference, %error, "post-adoption step failed");
                }
            }
            Ok(ChartLookup::Paused) => {
                warn!(cid, chart = %reference, "adopted chart still paused");
            }
            Ok(ChartLookup::Missing) => {
                warn!(cid, chart = %reference, "adopted chart vanished");
            }
            Err(error) => {
                error!(cid, chart = %reference, %error, "adopted chart load failed");
            }
        }
    }

    /// Poll our own instance row; a dying flag (or a removed row) triggers
    /// shutdown.
    async fn run_death_watch(inner: Arc<EngineInner>) {
        loop {
            tokio::time::sleep(DEATH_POLL_FREQUENCY).await;
            if inner.startup.is_dying() {
                return;
            }
            match inner.store.is_instance_dying(&inner.instance_id).await {
                Ok(true) => {
                    info!(instance = %inner.instance_id, "death note received");
                    inner.initiate_shutdown();
                    return;
                }
                Ok(false) => {}
                Err(error) => warn!(%error, "death note poll failed"),
            }
        }
    }

    /// Drive the instance into `dying` and drain. Idempotent: concurrent
    /// callers wait for the first one to finish.
    pub(crate) async fn run_shutdown(inner: Arc<EngineInner>) -> Result<()> {
        let startup = &inner.startup;
        if startup.shutdown_started.swap(true, Ordering::SeqCst) {
            let mut phases = startup.subscribe();
            while *phases.borrow_and_update() != EnginePhase::Halted {
                if phases.changed().await.is_err() {
                    break;
                }
            }
            return Ok(());
        }

        startup.set_phase(EnginePhase::Dying);

        // Stop the adoption loop and death-note poll.
        let background: Vec<JoinHandle<()>> = {
            let mut tasks = startup.background.lock().expect("startup tasks poisoned");
            tasks.drain(..).collect()
        };
        for task in background {
            task.abort();
        }

        if let Err(error) = inner.store.remove_instance(&inner.instance_id).await {
            error!(%error, "instance row removal failed");
        }

        inner.deferred.stop_and_release().await;
        inner.activities.stop_all().await;

        // While another live instance exists, wait for it to adopt our
        // charts before halting.
        loop {
            let alive = match inner.store.count_alive_instances().await {
                Ok(alive) => alive,
                Err(error) => {
                    error!(%error, "alive instance count failed");
                    break;
                }
            };
            if alive == 0 {
                break;
            }
            let own = match inner.store.count_own_charts(&inner.instance_id).await {
                Ok(own) => own,
                Err(error) => {
                    error!(%error, "own chart count failed");
                    break;
                }
            };
            if own == 0 {
                break;
            }
            tokio::time::sleep(inner.options.shutdown.own_chart_polling_frequency).await;
        }

        startup.set_phase(EnginePhase::Halted);
        info!(instance = %inner.instance_id, "engine halted");
        Ok(())
    }

    /// Wait for the engine to reach `ready` (or fail if it halts first).
    pub(crate) async fn wait_ready(&self) -> Result<()> {
        let mut phases = self.subscribe();
        loop {
            match *phases.borrow_and_update() {
                EnginePhase::Ready => return Ok(()),
                EnginePhase::Dying | EnginePhase::Halted => {
                    return Err(ChartError::storage("start", "engine halted during startup"));
                }
                _ => {}
            }
            phases
                .changed()
                .await
                .map_err(|_| ChartError::storage("start", "phase channel closed"))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_displays_lowercase() {
        assert_eq!(EnginePhase::Initial.to_string(), "initial");
        assert_eq!(EnginePhase::Adopting.to_string(), "adopting");
        assert_eq!(EnginePhase::Halted.to_string(), "halted");
    }
}
