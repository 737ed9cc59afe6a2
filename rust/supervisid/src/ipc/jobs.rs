use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, SendError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::evidence::{contain_panics, normalize_image, EvidenceError, NormalizeConfig, NormalizedImage};
use crate::workflow::AssessmentWorkflow;

/// Normalization threads shared by every session.
const WORKERS: usize = 2;

struct QueuedJob {
    visit_id: String,
    ticket: u64,
    raw: Vec<u8>,
    config: NormalizeConfig,
}

struct FinishedJob {
    visit_id: String,
    ticket: u64,
    outcome: Result<NormalizedImage, EvidenceError>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedEvidence {
    pub ticket: u64,
    pub message: String,
}

fn worker_loop(queue: Arc<Mutex<Receiver<QueuedJob>>>, done: Sender<FinishedJob>) {
    loop {
        // The guard drops at the end of the match, before the job runs.
        let next = match queue.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => return,
        };
        let Ok(job) = next else {
            return;
        };
        let outcome = contain_panics(|| normalize_image(&job.raw, &job.config));
        let finished = FinishedJob {
            visit_id: job.visit_id,
            ticket: job.ticket,
            outcome,
        };
        if done.send(finished).is_err() {
            return;
        }
    }
}

/// Off-thread evidence normalization on a small fixed pool. Workers report
/// back over a channel; the results are folded into the owning session on the
/// request thread. Every queued ticket yields exactly one `FinishedJob`.
pub struct EvidenceJobs {
    next_ticket: u64,
    queue: Option<Sender<QueuedJob>>,
    tx: Sender<FinishedJob>,
    rx: Receiver<FinishedJob>,
    rejected: HashMap<String, Vec<RejectedEvidence>>,
}

impl EvidenceJobs {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self {
            next_ticket: 0,
            queue: None,
            tx,
            rx,
            rejected: HashMap::new(),
        }
    }

    pub fn reserve_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Starts the pool on first use. `None` when no worker thread could start.
    fn queue(&mut self) -> Option<&Sender<QueuedJob>> {
        if self.queue.is_none() {
            let (queue_tx, queue_rx) = channel();
            let shared = Arc::new(Mutex::new(queue_rx));
            let mut started = 0;
            for n in 0..WORKERS {
                let shared = Arc::clone(&shared);
                let done = self.tx.clone();
                match thread::Builder::new()
                    .name(format!("evidence-{}", n))
                    .spawn(move || worker_loop(shared, done))
                {
                    Ok(_) => started += 1,
                    Err(e) => warn!(error = %e, "evidence worker failed to start"),
                }
            }
            if started == 0 {
                return None;
            }
            self.queue = Some(queue_tx);
        }
        self.queue.as_ref()
    }

    pub fn spawn(&mut self, visit_id: &str, ticket: u64, raw: Vec<u8>, config: NormalizeConfig) {
        let job = QueuedJob {
            visit_id: visit_id.to_string(),
            ticket,
            raw,
            config,
        };
        let job = match self.queue() {
            Some(queue) => match queue.send(job) {
                Ok(()) => return,
                Err(SendError(job)) => job,
            },
            None => job,
        };
        // No worker to take it: resolve the slot now rather than leave it pending.
        self.queue = None;
        let _ = self.tx.send(FinishedJob {
            visit_id: job.visit_id,
            ticket: job.ticket,
            outcome: Err(EvidenceError::ImageProcessing(
                "no normalization worker available".into(),
            )),
        });
    }

    fn record(&mut self, job: FinishedJob, sessions: &mut HashMap<String, AssessmentWorkflow>) {
        let Some(session) = sessions.get_mut(&job.visit_id) else {
            // Session abandoned or deleted while the worker ran.
            return;
        };
        let failure = job.outcome.as_ref().err().map(|e| e.to_string());
        if !session.finish_evidence(job.ticket, job.outcome) {
            return;
        }
        match failure {
            None => info!(visit_id = %job.visit_id, ticket = job.ticket, "evidence accepted"),
            Some(message) => {
                warn!(visit_id = %job.visit_id, ticket = job.ticket, %message, "evidence rejected");
                self.rejected
                    .entry(job.visit_id)
                    .or_default()
                    .push(RejectedEvidence {
                        ticket: job.ticket,
                        message,
                    });
            }
        }
    }

    pub fn apply_finished(&mut self, sessions: &mut HashMap<String, AssessmentWorkflow>) {
        while let Ok(job) = self.rx.try_recv() {
            self.record(job, sessions);
        }
    }

    /// Blocks until the session has no pending slot. Returns false on timeout.
    pub fn wait_idle(
        &mut self,
        visit_id: &str,
        sessions: &mut HashMap<String, AssessmentWorkflow>,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = sessions
                .get(visit_id)
                .map(|s| s.evidence().pending())
                .unwrap_or(0);
            if pending == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(job) => self.record(job, sessions),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return false
                }
            }
        }
    }

    pub fn rejected(&self, visit_id: &str) -> &[RejectedEvidence] {
        self.rejected.get(visit_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn take_rejected(&mut self, visit_id: &str) -> Vec<RejectedEvidence> {
        self.rejected.remove(visit_id).unwrap_or_default()
    }

    pub fn forget(&mut self, visit_id: &str) {
        self.rejected.remove(visit_id);
    }
}
