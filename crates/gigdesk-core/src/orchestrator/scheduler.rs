//! Periodic drivers for the two sweeps.
//!
//! Each sweep runs in its own task driven by a `Ticker`. A tick that arrives
//! while a sweep is still running waits for it; ticks never overlap within
//! one task. `EngineHandle::stop` signals both tasks and waits for any
//! in-flight sweep to finish.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use super::engine::Engine;

#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick. `false` means the ticker is closed.
    async fn tick(&mut self) -> bool;
}

/// Fires immediately, then every `period`. Late ticks are delayed rather
/// than bunched.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticks whenever the paired sender sends; closes when every sender drops.
pub struct ChannelTicker {
    rx: mpsc::Receiver<()>,
}

pub fn channel_ticker() -> (mpsc::Sender<()>, ChannelTicker) {
    let (tx, rx) = mpsc::channel(16);
    (tx, ChannelTicker { rx })
}

#[async_trait]
impl Ticker for ChannelTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

// ---------------------------------------------------------------------------
// EngineHandle
// ---------------------------------------------------------------------------

pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Signal both sweep loops to exit and wait for them.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "sweep task panicked");
            }
        }
        tracing::info!("engine stopped");
    }

    /// Wait until both loops end on their own (their tickers closed).
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "sweep task panicked");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Detection,
    Execution,
}

impl Sweep {
    fn name(self) -> &'static str {
        match self {
            Sweep::Detection => "detection",
            Sweep::Execution => "execution",
        }
    }

    async fn run(self, engine: &Engine) {
        let result = match self {
            Sweep::Detection => engine.run_detection_sweep().await.map(|_| ()),
            Sweep::Execution => engine.run_execution_sweep().await.map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!(sweep = self.name(), error = %e, "sweep failed; retrying next tick");
        }
    }
}

fn spawn_loop(
    engine: Arc<Engine>,
    sweep: Sweep,
    mut ticker: impl Ticker + 'static,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                alive = ticker.tick() => {
                    if !alive {
                        break;
                    }
                    sweep.run(&engine).await;
                }
            }
        }
        tracing::debug!(sweep = sweep.name(), "sweep loop exited");
    })
}

/// Run each sweep whenever its ticker fires.
pub fn start_with_tickers(
    engine: Arc<Engine>,
    detection: impl Ticker + 'static,
    execution: impl Ticker + 'static,
) -> EngineHandle {
    let (shutdown, rx) = watch::channel(false);
    let tasks = vec![
        spawn_loop(engine.clone(), Sweep::Detection, detection, rx.clone()),
        spawn_loop(engine, Sweep::Execution, execution, rx),
    ];
    EngineHandle { shutdown, tasks }
}

/// Run both sweeps now and then every `interval`.
pub fn start_engine(engine: Arc<Engine>, interval: Duration) -> EngineHandle {
    tracing::info!(interval_secs = interval.as_secs(), "engine started");
    start_with_tickers(
        engine,
        IntervalTicker::new(interval),
        IntervalTicker::new(interval),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::{harness, lead, sent_invoice, t0, user};
    use crate::store::{EntityStore, MemoryStore};
    use chrono::Duration as CDur;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.upsert_user(user("u1", None));
        store.upsert_lead(lead("lead-1", "u1", t0() - CDur::hours(30)));
        store.upsert_invoice(sent_invoice("inv-1", "u1", t0() - CDur::hours(100), 40000));
        store
    }

    #[tokio::test]
    async fn channel_tickers_drive_sweeps() {
        let h = harness(store());
        let (detect_tx, detect) = channel_ticker();
        let (exec_tx, exec) = channel_ticker();
        let handle = start_with_tickers(h.engine.clone(), detect, exec);

        detect_tx.send(()).await.unwrap();
        drop(detect_tx);
        // The execution tick must find the invoice's auto-executable action.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let actions = h.store.list_next_actions_for_user("u1").await.unwrap();
                if actions.iter().any(|a| a.auto_executable) {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("detection sweep creates the invoice action");
        exec_tx.send(()).await.unwrap();
        drop(exec_tx);
        handle.wait().await;

        assert_eq!(h.store.list_open_stall_detections("u1").await.unwrap().len(), 2);
        assert_eq!(h.delivery.count(), 1);
    }

    #[tokio::test]
    async fn stop_ends_idle_loops() {
        let h = harness(store());
        let (_detect_tx, detect) = channel_ticker();
        let (_exec_tx, exec) = channel_ticker();
        let handle = start_with_tickers(h.engine.clone(), detect, exec);
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop returns");
        assert_eq!(h.delivery.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticker_fires_immediately_then_periodically() {
        let mut ticker = IntervalTicker::new(Duration::from_secs(900));
        let start = tokio::time::Instant::now();
        assert!(ticker.tick().await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(ticker.tick().await);
        assert_eq!(start.elapsed(), Duration::from_secs(900));
    }

    #[tokio::test(start_paused = true)]
    async fn start_engine_runs_first_sweep_at_once() {
        let h = harness(store());
        let handle = h.engine.start(Duration::from_secs(900));
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.stop().await;
        assert_eq!(h.store.list_open_stall_detections("u1").await.unwrap().len(), 2);
    }
}
