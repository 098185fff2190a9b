//! poll finalization: merge, prove, submit
//!
//! # flow
//! 1. read the tally contract; an already tallied poll is left alone
//! 2. `Merging`: merge through the coordinator unless the state tree is merged
//! 3. `Proving`: resolve the end block and have the coordinator generate proofs
//! 4. `Submitting`: have the coordinator submit proofs and tally on-chain
//!
//! a stage failure aborts the run and leaves `Failed`, from which a new run
//! starts over at merging. the merge check makes that re-run cheap.
//!
//! one run per poll at a time: a second concurrent `finalize` for the same
//! poll is rejected, and so is any run on a poll that is not idle. dropping the run future cancels it and marks the poll
//! failed at the stage it was in.

use crate::alerts::{Alert, AlertSink};
use crate::contracts::PollStateSource;
use crate::coordinator::{Coordinator, GenerateProofsArgs};
use crate::error::{Error, Operation, Result, ServiceError, ServiceResult};
use crate::schema::TallyData;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// stage a run failed in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Merge,
    Prove,
    Submit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Merge => write!(f, "merge"),
            Stage::Prove => write!(f, "prove"),
            Stage::Submit => write!(f, "submit"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizeStatus {
    NotStarted,
    Merging,
    Merged,
    Proving,
    Proved,
    Submitting,
    Submitted,
    Failed { stage: Stage, reason: String },
}

impl FinalizeStatus {
    /// transition table
    pub fn can_transition_to(&self, next: &FinalizeStatus) -> bool {
        use FinalizeStatus::*;
        match (self, next) {
            (NotStarted, Merging) => true,
            (Failed { .. }, Merging) | (Failed { .. }, NotStarted) => true,
            (Merging, Merged) => true,
            (Merged, Proving) => true,
            (Proving, Proved) => true,
            (Proved, Submitting) => true,
            (Submitting, Submitted) => true,
            (Merging, Failed { stage: Stage::Merge, .. }) => true,
            (Merged | Proving, Failed { stage: Stage::Prove, .. }) => true,
            (Proved | Submitting, Failed { stage: Stage::Submit, .. }) => true,
            _ => false,
        }
    }

    /// a new run may start from here
    pub fn is_idle(&self) -> bool {
        matches!(self, FinalizeStatus::NotStarted | FinalizeStatus::Failed { .. })
    }

    pub fn is_running(&self) -> bool {
        !self.is_idle() && *self != FinalizeStatus::Submitted
    }

    /// failed state a run dropped in this status ends up in
    pub fn cancelled(&self) -> Option<FinalizeStatus> {
        let stage = match self {
            FinalizeStatus::Merging => Stage::Merge,
            FinalizeStatus::Merged | FinalizeStatus::Proving => Stage::Prove,
            FinalizeStatus::Proved | FinalizeStatus::Submitting => Stage::Submit,
            _ => return None,
        };
        Some(FinalizeStatus::Failed {
            stage,
            reason: "cancelled".into(),
        })
    }

    /// stage a running status belongs to
    pub fn stage(&self) -> Option<Stage> {
        match self {
            FinalizeStatus::Merging | FinalizeStatus::Merged => Some(Stage::Merge),
            FinalizeStatus::Proving | FinalizeStatus::Proved => Some(Stage::Prove),
            FinalizeStatus::Submitting => Some(Stage::Submit),
            FinalizeStatus::Failed { stage, .. } => Some(*stage),
            FinalizeStatus::NotStarted | FinalizeStatus::Submitted => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FinalizeStatus::NotStarted => "not started",
            FinalizeStatus::Merging => "merging",
            FinalizeStatus::Merged => "merged",
            FinalizeStatus::Proving => "proving",
            FinalizeStatus::Proved => "proved",
            FinalizeStatus::Submitting => "submitting",
            FinalizeStatus::Submitted => "submitted",
            FinalizeStatus::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for FinalizeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalizeStatus::Failed { stage, reason } => {
                write!(f, "failed at {}: {}", stage, reason)
            }
            other => write!(f, "{}", other.label()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FinalizeOutcome {
    /// tally already on-chain, nothing was sent to the coordinator
    AlreadyFinalized,
    Finalized(Box<TallyData>),
    Failed { stage: Stage, reason: String },
}

/// result of one `finalize` call
#[derive(Clone, Debug, PartialEq)]
pub struct FinalizeReport {
    pub poll_id: u64,
    pub outcome: FinalizeOutcome,
    /// every status published during the run, starting with the initial one
    pub transitions: Vec<FinalizeStatus>,
}

struct PollEntry {
    status: watch::Sender<FinalizeStatus>,
    running: bool,
}

type Registry = Arc<Mutex<HashMap<u64, PollEntry>>>;

fn lock(registry: &Registry) -> std::sync::MutexGuard<'_, HashMap<u64, PollEntry>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// marks a poll as running until dropped
struct RunGuard {
    registry: Registry,
    poll_id: u64,
    status: watch::Sender<FinalizeStatus>,
    transitions: Vec<FinalizeStatus>,
}

impl RunGuard {
    fn current(&self) -> FinalizeStatus {
        self.status.borrow().clone()
    }

    fn transition(&mut self, next: FinalizeStatus) -> Result<()> {
        let current = self.current();
        if !current.can_transition_to(&next) {
            tracing::error!(poll_id = self.poll_id, "invalid transition {} -> {}", current, next);
            return Err(Error::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        tracing::info!(poll_id = self.poll_id, "finalize: {} -> {}", current, next);
        self.transitions.push(next.clone());
        self.status.send_replace(next);
        Ok(())
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let current = self.current();
        if let Some(cancelled) = current.cancelled() {
            // future dropped mid-stage
            tracing::warn!(poll_id = self.poll_id, "finalize cancelled while {}", current);
            self.status.send_replace(cancelled);
        }
        if let Some(entry) = lock(&self.registry).get_mut(&self.poll_id) {
            entry.running = false;
        }
    }
}

/// drives finalization for any number of polls
pub struct Finalizer {
    coordinator: Arc<dyn Coordinator>,
    source: Arc<dyn PollStateSource>,
    alerts: Arc<dyn AlertSink>,
    /// first block the coordinator scans for maci events
    start_block: u64,
    stage_timeout: Option<Duration>,
    polls: Registry,
}

impl Finalizer {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        source: Arc<dyn PollStateSource>,
        alerts: Arc<dyn AlertSink>,
        start_block: u64,
    ) -> Self {
        Self {
            coordinator,
            source,
            alerts,
            start_block,
            stage_timeout: None,
            polls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// bound each coordinator call, on top of the client's own request timeout
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    /// current status of a poll, `NotStarted` if never run
    pub fn status(&self, poll_id: u64) -> FinalizeStatus {
        lock(&self.polls)
            .get(&poll_id)
            .map(|entry| entry.status.borrow().clone())
            .unwrap_or(FinalizeStatus::NotStarted)
    }

    /// watch a poll's status
    pub fn subscribe(&self, poll_id: u64) -> watch::Receiver<FinalizeStatus> {
        lock(&self.polls)
            .entry(poll_id)
            .or_insert_with(|| PollEntry {
                status: watch::channel(FinalizeStatus::NotStarted).0,
                running: false,
            })
            .status
            .subscribe()
    }

    /// move a failed poll back to `NotStarted`
    pub fn reset(&self, poll_id: u64) {
        if let Some(entry) = lock(&self.polls).get(&poll_id) {
            entry.status.send_if_modified(|status| {
                if matches!(status, FinalizeStatus::Failed { .. }) {
                    *status = FinalizeStatus::NotStarted;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// drop the state of a poll that is no longer displayed
    pub fn forget(&self, poll_id: u64) {
        let mut polls = lock(&self.polls);
        if polls.get(&poll_id).map_or(false, |entry| !entry.running) {
            polls.remove(&poll_id);
        }
    }

    fn begin(&self, poll_id: u64) -> Result<RunGuard> {
        let mut polls = lock(&self.polls);
        let entry = polls.entry(poll_id).or_insert_with(|| PollEntry {
            status: watch::channel(FinalizeStatus::NotStarted).0,
            running: false,
        });
        if entry.running {
            return Err(Error::FinalizeInProgress(poll_id));
        }
        let initial = entry.status.borrow().clone();
        if !initial.is_idle() {
            return Err(Error::FinalizeNotIdle {
                poll_id,
                status: initial.to_string(),
            });
        }
        entry.running = true;

        let status = entry.status.clone();
        Ok(RunGuard {
            registry: self.polls.clone(),
            poll_id,
            status,
            transitions: vec![initial],
        })
    }

    async fn bounded<T, F>(&self, op: Operation, fut: F) -> ServiceResult<T>
    where
        F: Future<Output = ServiceResult<T>>,
    {
        match self.stage_timeout {
            None => fut.await,
            Some(after) => tokio::time::timeout(after, fut)
                .await
                .unwrap_or(Err(ServiceError::Timeout { op, after })),
        }
    }

    fn fail(&self, run: &mut RunGuard, stage: Stage, reason: String) -> Result<FinalizeOutcome> {
        tracing::warn!(poll_id = run.poll_id, "finalize failed at {}: {}", stage, reason);
        let title = match stage {
            Stage::Merge => "Failed to merge votes",
            Stage::Prove => "Failed to generate proofs",
            Stage::Submit => "Failed to submit proofs",
        };
        self.alerts
            .push(Alert::error(title).with_description(reason.clone()));
        run.transition(FinalizeStatus::Failed {
            stage,
            reason: reason.clone(),
        })?;
        Ok(FinalizeOutcome::Failed { stage, reason })
    }

    /// run finalization for `poll_id`
    ///
    /// stage failures are reported in the outcome. `Err` means the run never
    /// started: another run is in flight, the poll was already submitted by
    /// this finalizer, or the tally state could not be read.
    pub async fn finalize(&self, poll_id: u64) -> Result<FinalizeReport> {
        let mut run = self.begin(poll_id)?;
        let outcome = self.run(&mut run).await?;
        Ok(FinalizeReport {
            poll_id,
            outcome,
            transitions: std::mem::take(&mut run.transitions),
        })
    }

    async fn run(&self, run: &mut RunGuard) -> Result<FinalizeOutcome> {
        let poll_id = run.poll_id;

        let tallied = match self.source.is_tallied(poll_id).await {
            Ok(tallied) => tallied,
            Err(e) => {
                self.alerts.push(
                    Alert::error("Could not read the poll tally state").with_description(e.to_string()),
                );
                return Err(e);
            }
        };
        if tallied {
            tracing::info!(poll_id, "poll already finalized");
            self.alerts.push(Alert::info("Poll already finalized"));
            if matches!(run.current(), FinalizeStatus::Failed { .. }) {
                run.transition(FinalizeStatus::NotStarted)?;
            }
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        // merge
        run.transition(FinalizeStatus::Merging)?;
        self.alerts.push(Alert::info("Merging votes..."));
        let merged = match self.source.is_merged(poll_id).await {
            Ok(merged) => merged,
            Err(e) => return self.fail(run, Stage::Merge, e.to_string()),
        };
        if merged {
            tracing::debug!(poll_id, "state tree already merged");
        } else {
            match self
                .bounded(Operation::Merge, self.coordinator.merge(poll_id))
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    return self.fail(
                        run,
                        Stage::Merge,
                        "Failed to merge: coordinator did not confirm the merge".into(),
                    )
                }
                Err(e) => return self.fail(run, Stage::Merge, e.to_string()),
            }
        }
        run.transition(FinalizeStatus::Merged)?;
        self.alerts.push(Alert::success("Votes merged"));

        // prove
        run.transition(FinalizeStatus::Proving)?;
        self.alerts.push(Alert::info("Generating proofs..."));
        let end_block = match self.end_block(poll_id).await {
            Ok(block) => block,
            Err(e) => return self.fail(run, Stage::Prove, e.to_string()),
        };
        let args = GenerateProofsArgs {
            poll_id,
            start_block: self.start_block,
            end_block,
        };
        tracing::info!(poll_id, start_block = args.start_block, end_block, "generating proofs");
        if let Err(e) = self
            .bounded(Operation::GenerateProofs, self.coordinator.generate_proofs(args))
            .await
        {
            return self.fail(run, Stage::Prove, e.to_string());
        }
        run.transition(FinalizeStatus::Proved)?;
        self.alerts.push(Alert::success("Proofs generated"));

        // submit
        run.transition(FinalizeStatus::Submitting)?;
        self.alerts.push(Alert::info("Submitting proofs..."));
        let tally = match self
            .bounded(Operation::Submit, self.coordinator.submit(poll_id))
            .await
        {
            Ok(tally) => tally,
            Err(e) => return self.fail(run, Stage::Submit, e.to_string()),
        };
        run.transition(FinalizeStatus::Submitted)?;
        self.alerts.push(
            Alert::success("Poll finalized")
                .with_description("Proofs and results have been submitted on-chain"),
        );

        Ok(FinalizeOutcome::Finalized(Box::new(tally)))
    }

    async fn end_block(&self, poll_id: u64) -> Result<u64> {
        let dates = self.source.poll_dates(poll_id).await?;
        self.source.block_at_timestamp(dates.end).await
    }
}
