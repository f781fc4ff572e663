//! Session scheduling: one decision loop, at most one in-flight session
//! per tier.
//!
//! Timer ticks and manual triggers merge at the same `select!` decision
//! point. A tick that finds its tier busy is skipped and logged — no
//! queueing, no backlog. A failing session is never retried by the loop;
//! the next tick simply makes a fresh decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::supervisor::{SessionRequest, SessionSupervisor};

/// On-demand session request, merged with timer ticks first-available-wins.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub tier: i64,
    pub parent_id: Option<i64>,
}

const DEFAULT_TIER: i64 = 1;

/// Bound on waiting for in-flight sessions while shutting down. Sessions
/// get the cancellation signal first, so this only covers the
/// terminate-and-flush tail.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Scheduler {
    supervisor: Arc<SessionSupervisor>,
    interval: Duration,
    trigger_rx: mpsc::Receiver<TriggerRequest>,
    cancel: CancellationToken,
    inflight: HashMap<i64, JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        supervisor: Arc<SessionSupervisor>,
        interval: Duration,
        trigger_rx: mpsc::Receiver<TriggerRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            supervisor,
            interval,
            trigger_rx,
            cancel,
            inflight: HashMap::new(),
        }
    }

    /// Drive the scheduling loop until shutdown, then drain in-flight
    /// sessions with a bounded wait.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // first tick is immediate; skip it
        let mut triggers_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.maybe_start(TriggerRequest {
                        tier: DEFAULT_TIER,
                        parent_id: None,
                    });
                }
                maybe_req = self.trigger_rx.recv(), if triggers_open => {
                    match maybe_req {
                        Some(req) => self.maybe_start(req),
                        None => {
                            // All trigger senders dropped; timer keeps running.
                            info!("trigger channel closed");
                            triggers_open = false;
                        }
                    }
                }
                () = self.cancel.cancelled() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }

        self.drain().await;
    }

    fn maybe_start(&mut self, req: TriggerRequest) {
        if let Some(handle) = self.inflight.get(&req.tier) {
            if !handle.is_finished() {
                info!(tier = req.tier, "session already in flight — tick skipped");
                return;
            }
        }

        let supervisor = Arc::clone(&self.supervisor);
        let cancel = self.cancel.child_token();
        let tier = req.tier;
        let handle = tokio::spawn(async move {
            let request = SessionRequest {
                tier: req.tier,
                parent_id: req.parent_id,
            };
            // A failed session must never take the scheduler down with it.
            if let Err(e) = supervisor.run_session(request, cancel).await {
                error!(tier = req.tier, error = %e, "session ended with supervisor error");
            }
        });
        self.inflight.insert(tier, handle);
    }

    async fn drain(self) {
        for (tier, handle) in self.inflight {
            if handle.is_finished() {
                continue;
            }
            match timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => info!(tier, "in-flight session drained"),
                Ok(Err(e)) => error!(tier, error = %e, "in-flight session task failed"),
                Err(_) => warn!(tier, "in-flight session did not drain in time"),
            }
        }
    }
}
