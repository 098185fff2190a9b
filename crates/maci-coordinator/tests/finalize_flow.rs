//! finalizer runs against an in-memory coordinator and chain

use async_trait::async_trait;
use maci_coordinator::alerts::{AlertKind, AlertLog};
use maci_coordinator::contracts::{PollDates, PollStateSource, TallyResult};
use maci_coordinator::coordinator::{Coordinator, GenerateProofsArgs};
use maci_coordinator::error::{Error, Operation, Result, ServiceError, ServiceResult};
use maci_coordinator::finalize::{FinalizeOutcome, FinalizeStatus, Finalizer, Stage};
use maci_coordinator::schema::{GenerateResponse, SubmitResponse, TallyData};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const POLL: u64 = 0;
const DEPLOYMENT_BLOCK: u64 = 100;
const END_BLOCK: u64 = 180;

fn tally_data() -> TallyData {
    serde_json::from_value(json!({
        "maci": "0x00000000000000000000000000000000000000aa",
        "pollId": "0",
        "mode": 1,
        "tallyAddress": "0x00000000000000000000000000000000000000cc",
        "newTallyCommitment": "0x1234",
        "results": { "tally": ["3", "1", "0"], "salt": "0x1", "commitment": "0x2" },
        "totalSpentVoiceCredits": { "spent": "4", "salt": "0x3", "commitment": "0x4" }
    }))
    .unwrap()
}

/// coordinator and chain in one: a merge flips the on-chain merged flag
#[derive(Default)]
struct FakeBackend {
    tallied: AtomicBool,
    merged: AtomicBool,
    tally_unreadable: AtomicBool,
    merge_reply: Mutex<Option<ServiceResult<bool>>>,
    generate_error: Mutex<Option<ServiceError>>,
    generate_gate: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<Vec<&'static str>>,
    generate_args: Mutex<Vec<GenerateProofsArgs>>,
}

impl FakeBackend {
    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    fn coordinator_calls(&self) -> usize {
        self.count("merge") + self.count("generate") + self.count("submit")
    }

    fn hold_generate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.generate_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn fail_generate(&self, err: ServiceError) {
        *self.generate_error.lock().unwrap() = Some(err);
    }
}

#[async_trait]
impl PollStateSource for FakeBackend {
    async fn is_tallied(&self, _poll_id: u64) -> Result<bool> {
        if self.tally_unreadable.load(Ordering::SeqCst) {
            return Err(Error::Rpc("connection refused".into()));
        }
        Ok(self.tallied.load(Ordering::SeqCst))
    }

    async fn is_merged(&self, _poll_id: u64) -> Result<bool> {
        Ok(self.merged.load(Ordering::SeqCst))
    }

    async fn poll_dates(&self, _poll_id: u64) -> Result<PollDates> {
        Ok(PollDates {
            start: 1_000,
            end: 2_000,
        })
    }

    async fn tally_results(&self, _poll_id: u64) -> Result<Vec<TallyResult>> {
        Ok(Vec::new())
    }

    async fn chain_time(&self) -> Result<u64> {
        Ok(2_500)
    }

    async fn block_at_timestamp(&self, timestamp: u64) -> Result<u64> {
        assert_eq!(timestamp, 2_000);
        Ok(END_BLOCK)
    }
}

#[async_trait]
impl Coordinator for FakeBackend {
    async fn merge(&self, _poll_id: u64) -> ServiceResult<bool> {
        self.record("merge");
        let reply = self.merge_reply.lock().unwrap().clone().unwrap_or(Ok(true));
        if reply == Ok(true) {
            self.merged.store(true, Ordering::SeqCst);
        }
        reply
    }

    async fn generate_proofs(&self, args: GenerateProofsArgs) -> ServiceResult<GenerateResponse> {
        self.record("generate");
        self.generate_args.lock().unwrap().push(args);
        let gate = self.generate_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.generate_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(GenerateResponse {
            process_proofs: Vec::new(),
            tally_proofs: Vec::new(),
            tally_data: tally_data(),
        })
    }

    async fn submit(&self, _poll_id: u64) -> ServiceResult<SubmitResponse> {
        self.record("submit");
        Ok(tally_data())
    }
}

fn finalizer(backend: &Arc<FakeBackend>, alerts: &Arc<AlertLog>) -> Finalizer {
    Finalizer::new(backend.clone(), backend.clone(), alerts.clone(), DEPLOYMENT_BLOCK)
}

fn http_error() -> ServiceError {
    ServiceError::Http {
        op: Operation::GenerateProofs,
        status: 500,
        status_text: "Internal Server Error".into(),
        message: Some("circuit files missing".into()),
    }
}

#[tokio::test]
async fn test_successful_run_visits_every_stage_in_order() {
    let backend = Arc::new(FakeBackend::default());
    let alerts = Arc::new(AlertLog::new());
    let finalizer = finalizer(&backend, &alerts);

    let report = finalizer.finalize(POLL).await.unwrap();

    assert!(matches!(report.outcome, FinalizeOutcome::Finalized(ref tally) if tally.results.tally == ["3", "1", "0"]));
    assert_eq!(
        report.transitions,
        vec![
            FinalizeStatus::NotStarted,
            FinalizeStatus::Merging,
            FinalizeStatus::Merged,
            FinalizeStatus::Proving,
            FinalizeStatus::Proved,
            FinalizeStatus::Submitting,
            FinalizeStatus::Submitted,
        ]
    );
    assert_eq!(finalizer.status(POLL), FinalizeStatus::Submitted);
    assert_eq!(*backend.calls.lock().unwrap(), ["merge", "generate", "submit"]);
    assert_eq!(
        backend.generate_args.lock().unwrap()[0],
        GenerateProofsArgs {
            poll_id: POLL,
            start_block: DEPLOYMENT_BLOCK,
            end_block: END_BLOCK,
        }
    );
    assert_eq!(
        alerts.messages(),
        [
            "Merging votes...",
            "Votes merged",
            "Generating proofs...",
            "Proofs generated",
            "Submitting proofs...",
            "Poll finalized",
        ]
    );
}

#[tokio::test]
async fn test_tallied_poll_is_left_alone() {
    let backend = Arc::new(FakeBackend::default());
    backend.tallied.store(true, Ordering::SeqCst);
    let alerts = Arc::new(AlertLog::new());
    let finalizer = finalizer(&backend, &alerts);

    let report = finalizer.finalize(POLL).await.unwrap();

    assert_eq!(report.outcome, FinalizeOutcome::AlreadyFinalized);
    assert_eq!(report.transitions, vec![FinalizeStatus::NotStarted]);
    assert_eq!(finalizer.status(POLL), FinalizeStatus::NotStarted);
    assert_eq!(backend.coordinator_calls(), 0);
    assert_eq!(alerts.messages(), ["Poll already finalized"]);
}

#[tokio::test]
async fn test_generate_failure_stops_before_submit() {
    let backend = Arc::new(FakeBackend::default());
    backend.fail_generate(http_error());
    let alerts = Arc::new(AlertLog::new());
    let finalizer = finalizer(&backend, &alerts);

    let report = finalizer.finalize(POLL).await.unwrap();

    let reason = "Failed to generate proofs: 500 - Internal Server Error. circuit files missing";
    assert_eq!(
        report.outcome,
        FinalizeOutcome::Failed {
            stage: Stage::Prove,
            reason: reason.into(),
        }
    );
    assert_eq!(backend.count("submit"), 0);

    let status = finalizer.status(POLL);
    assert!(matches!(status, FinalizeStatus::Failed { stage: Stage::Prove, .. }));
    assert!(status.is_idle());

    let last = alerts.snapshot().pop().unwrap();
    assert_eq!(last.kind, AlertKind::Error);
    assert_eq!(last.message, "Failed to generate proofs");
    assert_eq!(last.description.as_deref(), Some(reason));

    finalizer.reset(POLL);
    assert_eq!(finalizer.status(POLL), FinalizeStatus::NotStarted);
}

#[tokio::test]
async fn test_rerun_does_not_merge_twice() {
    let backend = Arc::new(FakeBackend::default());
    backend.fail_generate(http_error());
    let alerts = Arc::new(AlertLog::new());
    let finalizer = finalizer(&backend, &alerts);

    let first = finalizer.finalize(POLL).await.unwrap();
    assert!(matches!(first.outcome, FinalizeOutcome::Failed { .. }));
    assert_eq!(backend.count("merge"), 1);

    *backend.generate_error.lock().unwrap() = None;
    let second = finalizer.finalize(POLL).await.unwrap();

    assert!(matches!(second.outcome, FinalizeOutcome::Finalized(_)));
    assert_eq!(backend.count("merge"), 1);
    assert_eq!(backend.count("generate"), 2);
    assert!(matches!(second.transitions[0], FinalizeStatus::Failed { .. }));
    assert_eq!(second.transitions[1], FinalizeStatus::Merging);
}

#[tokio::test]
async fn test_submitted_poll_is_not_finalized_again() {
    let backend = Arc::new(FakeBackend::default());
    let alerts = Arc::new(AlertLog::new());
    let finalizer = finalizer(&backend, &alerts);

    let first = finalizer.finalize(POLL).await.unwrap();
    assert!(matches!(first.outcome, FinalizeOutcome::Finalized(_)));

    // tally not yet visible on-chain, the local status still blocks a rerun
    let err = finalizer.finalize(POLL).await.unwrap_err();
    assert!(matches!(err, Error::FinalizeNotIdle { poll_id: POLL, .. }), "{}", err);
    assert_eq!(finalizer.status(POLL), FinalizeStatus::Submitted);
    assert_eq!(*backend.calls.lock().unwrap(), ["merge", "generate", "submit"]);

    // submitted is terminal, reset leaves it alone
    finalizer.reset(POLL);
    assert_eq!(finalizer.status(POLL), FinalizeStatus::Submitted);
}

#[tokio::test]
async fn test_unconfirmed_merge_fails() {
    let backend = Arc::new(FakeBackend::default());
    *backend.merge_reply.lock().unwrap() = Some(Ok(false));
    let alerts = Arc::new(AlertLog::new());
    let finalizer = finalizer(&backend, &alerts);

    let report = finalizer.finalize(POLL).await.unwrap();

    assert!(matches!(
        report.outcome,
        FinalizeOutcome::Failed {
            stage: Stage::Merge,
            ..
        }
    ));
    assert_eq!(backend.count("generate"), 0);
    assert!(alerts.messages().contains(&"Failed to merge votes".to_string()));
}

#[tokio::test]
async fn test_unreadable_tally_state_never_starts() {
    let backend = Arc::new(FakeBackend::default());
    backend.tally_unreadable.store(true, Ordering::SeqCst);
    let alerts = Arc::new(AlertLog::new());
    let finalizer = finalizer(&backend, &alerts);

    assert!(matches!(finalizer.finalize(POLL).await, Err(Error::Rpc(_))));
    assert_eq!(finalizer.status(POLL), FinalizeStatus::NotStarted);
    assert_eq!(backend.coordinator_calls(), 0);
    assert_eq!(alerts.snapshot()[0].kind, AlertKind::Error);
}

#[tokio::test]
async fn test_concurrent_run_for_same_poll_rejected() {
    let backend = Arc::new(FakeBackend::default());
    let gate = backend.hold_generate();
    let alerts = Arc::new(AlertLog::new());
    let finalizer = Arc::new(finalizer(&backend, &alerts));

    let mut status = finalizer.subscribe(POLL);
    let running = tokio::spawn({
        let finalizer = finalizer.clone();
        async move { finalizer.finalize(POLL).await }
    });
    status
        .wait_for(|s| *s == FinalizeStatus::Proving)
        .await
        .unwrap();

    assert!(matches!(
        finalizer.finalize(POLL).await,
        Err(Error::FinalizeInProgress(POLL))
    ));
    // other polls are independent
    assert_eq!(finalizer.status(POLL + 1), FinalizeStatus::NotStarted);

    gate.notify_one();
    let report = running.await.unwrap().unwrap();
    assert!(matches!(report.outcome, FinalizeOutcome::Finalized(_)));
    assert_eq!(backend.count("merge"), 1);
}

#[tokio::test]
async fn test_dropped_run_is_marked_cancelled() {
    let backend = Arc::new(FakeBackend::default());
    let _gate = backend.hold_generate();
    let alerts = Arc::new(AlertLog::new());
    let finalizer = Arc::new(finalizer(&backend, &alerts));

    let mut status = finalizer.subscribe(POLL);
    let running = tokio::spawn({
        let finalizer = finalizer.clone();
        async move { finalizer.finalize(POLL).await }
    });
    status
        .wait_for(|s| *s == FinalizeStatus::Proving)
        .await
        .unwrap();

    running.abort();
    assert!(running.await.unwrap_err().is_cancelled());

    assert_eq!(
        finalizer.status(POLL),
        FinalizeStatus::Failed {
            stage: Stage::Prove,
            reason: "cancelled".into(),
        }
    );

    // the poll is free again
    *backend.generate_gate.lock().unwrap() = None;
    let report = finalizer.finalize(POLL).await.unwrap();
    assert!(matches!(report.outcome, FinalizeOutcome::Finalized(_)));
}

#[tokio::test(start_paused = true)]
async fn test_hung_coordinator_hits_stage_timeout() {
    let backend = Arc::new(FakeBackend::default());
    let _gate = backend.hold_generate();
    let alerts = Arc::new(AlertLog::new());
    let finalizer = finalizer(&backend, &alerts).with_stage_timeout(Duration::from_secs(30));

    let report = finalizer.finalize(POLL).await.unwrap();

    assert_eq!(
        report.outcome,
        FinalizeOutcome::Failed {
            stage: Stage::Prove,
            reason: "Failed to generate proofs: no response after 30s".into(),
        }
    );
    assert_eq!(backend.count("submit"), 0);
}
