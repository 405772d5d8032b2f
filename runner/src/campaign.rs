use crate::{
    checkpoint::CheckpointStore,
    manifest::JobSpec,
    scheduler::Scheduler,
    status::{JobRecord, JobState, RecordMap, Reconciler},
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tracing::{error, info, warn};

/// Global campaign phase, derived from the records each round
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// admitting jobs up to the concurrency cap
    Filling,
    /// cap reached, waiting out the polling interval
    Polling,
    /// everything admitted, waiting for in-flight jobs to finish
    Draining,
    /// every job reached a terminal state
    Complete,
}

#[derive(Clone, Debug)]
pub struct CampaignConfig {
    /// max number of simultaneously in-flight jobs
    pub cap: usize,
    /// sleep between polling rounds
    pub poll_interval: Duration,
    /// fixed delay between consecutive submissions within a round
    pub submit_throttle: Duration,
}

/// The scheduling state machine driving one campaign to completion.
///
/// Owns the records map exclusively; every round admits pending specs up to
/// the cap, refreshes every non-finished record through the reconciler and
/// checkpoints the result, in that order, so a checkpoint never reflects a
/// half-admitted round.
pub struct Campaign<'a, S: Scheduler> {
    scheduler: &'a S,
    reconciler: Reconciler,
    checkpoint: CheckpointStore,
    config: CampaignConfig,
    pending: VecDeque<JobSpec>,
    records: RecordMap,
    cancel: Arc<AtomicBool>,
}

impl<'a, S: Scheduler> Campaign<'a, S> {
    pub fn new(
        scheduler: &'a S,
        reconciler: Reconciler,
        checkpoint: CheckpointStore,
        config: CampaignConfig,
        specs: Vec<JobSpec>,
    ) -> Self {
        Self {
            scheduler,
            reconciler,
            checkpoint,
            config,
            pending: specs.into(),
            records: RecordMap::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// flag a cooperating signal handler may set to stop after the current
    /// round; a final checkpoint is written before exit
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn records(&self) -> &RecordMap {
        &self.records
    }

    /// specs not yet admitted
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn phase(&self) -> Phase {
        let all_terminal = self
            .records
            .values()
            .all(|record| record.state.is_terminal());

        if self.pending.is_empty() {
            if all_terminal {
                Phase::Complete
            } else {
                Phase::Draining
            }
        } else if self.in_flight() < self.config.cap {
            Phase::Filling
        } else {
            Phase::Polling
        }
    }

    /// Drive the campaign until every job is terminal. Returns the final
    /// phase, which is `Complete` unless cancellation cut the run short.
    pub fn run(&mut self) -> Phase {
        info!(
            jobs = self.pending.len(),
            cap = self.config.cap,
            "starting campaign"
        );

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                info!("cancellation requested, writing final checkpoint");
                self.save_checkpoint();

                return self.phase();
            }

            let phase = self.round();
            if phase == Phase::Complete {
                info!("campaign complete");

                return Phase::Complete;
            }

            thread::sleep(self.config.poll_interval);
        }
    }

    /// one scheduling round: admit, refresh, checkpoint
    pub fn round(&mut self) -> Phase {
        self.admit();
        self.refresh();
        self.report();
        self.save_checkpoint();

        self.phase()
    }

    fn in_flight(&self) -> usize {
        self.records
            .values()
            .filter(|record| record.state.is_in_flight())
            .count()
    }

    /// Admit pending specs while capacity is free. A failed submission is
    /// terminal for that job only; the campaign keeps going.
    fn admit(&mut self) {
        while self.in_flight() < self.config.cap {
            let Some(spec) = self.pending.pop_front() else {
                break;
            };

            let record = match self.scheduler.submit(&spec) {
                Ok(handle) => JobRecord::admitted(spec, handle),
                Err(submit_error) => {
                    error!(
                        job = %spec.name,
                        error = %submit_error,
                        "submission failed, recording the job as unknown"
                    );

                    JobRecord::failed_submit(spec)
                }
            };
            self.records.insert(record.spec.name.clone(), record);

            // avoid hammering the scheduler's submit path
            thread::sleep(self.config.submit_throttle);
        }
    }

    /// Re-poll every record that still has a handle and is not finished.
    /// Unknown jobs are included: re-polling is unbounded and a later round
    /// may still resolve them.
    fn refresh(&mut self) {
        let stale: Vec<String> = self
            .records
            .values()
            .filter(|record| record.state != JobState::Done && record.handle.is_some())
            .map(|record| record.spec.name.clone())
            .collect();

        for name in stale {
            if let Some(record) = self.records.get(&name) {
                let updated = self.reconciler.reconcile(self.scheduler, record);
                self.records.insert(name, updated);
            }
        }
    }

    /// per-round status line for every job, the campaign's visible pulse
    fn report(&self) {
        for record in self.records.values() {
            info!(
                job = %record.spec.name,
                state = ?record.state,
                procs = record.spec.procs(),
                exit = ?record.exit_code,
                wall = ?record.wall_time,
                cpu = ?record.cpu_time,
                hosts = ?record.hosts,
                "status"
            );
        }
    }

    /// persistence failures are logged and retried next round, never fatal
    fn save_checkpoint(&self) {
        if let Err(checkpoint_error) = self.checkpoint.save(&self.records) {
            warn!(error = %checkpoint_error, "failed to write checkpoint, continuing");
        }
    }
}
