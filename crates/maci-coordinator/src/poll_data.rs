//! poll window, tally state and results as shown next to a proposal

use crate::contracts::{PollStateSource, TallyResult};
use crate::error::Result;
use crate::proposal::Tally;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// published results of a tallied poll
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteResults {
    /// raw per-option results in vote option order
    pub results: Vec<TallyResult>,
    pub tally: Tally,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollData {
    pub poll_id: u64,
    pub vote_start: u64,
    pub vote_end: u64,
    /// chain time the data was computed at
    pub now: u64,
    pub vote_ended: bool,
    /// voting closed or not open yet
    pub disabled: bool,
    pub tallied: bool,
    pub results: Option<VoteResults>,
}

/// results once the tally is on-chain, `None` before
pub async fn fetch_results(source: &dyn PollStateSource, poll_id: u64) -> Result<Option<VoteResults>> {
    if !source.is_tallied(poll_id).await? {
        return Ok(None);
    }
    let results = source.tally_results(poll_id).await?;
    let tally = Tally::from_results(&results);
    Ok(Some(VoteResults { results, tally }))
}

pub async fn fetch_poll_data(source: &dyn PollStateSource, poll_id: u64) -> Result<PollData> {
    let (dates, now) = futures::try_join!(source.poll_dates(poll_id), source.chain_time())?;

    let vote_ended = dates.end < now;
    let disabled = vote_ended || dates.start > now;

    let mut tallied = false;
    let mut results = None;
    if vote_ended {
        // result reads are best effort, the window is still worth showing
        match fetch_results(source, poll_id).await {
            Ok(fetched) => {
                tallied = fetched.is_some();
                results = fetched;
            }
            Err(e) => tracing::debug!(poll_id, "results unavailable: {}", e),
        }
    }

    Ok(PollData {
        poll_id,
        vote_start: dates.start,
        vote_end: dates.end,
        now,
        vote_ended,
        disabled,
        tallied,
        results,
    })
}

/// true once the latest block is at or past the poll end date
pub async fn can_finalize(source: &dyn PollStateSource, poll_id: u64) -> bool {
    let check: Result<_> = futures::try_join!(source.poll_dates(poll_id), source.chain_time());
    match check {
        Ok((dates, now)) => now >= dates.end,
        Err(e) => {
            tracing::warn!(poll_id, "could not check if poll can be finalized: {}", e);
            false
        }
    }
}

/// refreshes poll data on an interval until voting ends
///
/// a failed refresh keeps the previous value. the background task is
/// aborted when the watcher is dropped.
pub struct PollWatcher {
    rx: watch::Receiver<Option<PollData>>,
    task: JoinHandle<()>,
}

impl PollWatcher {
    pub fn spawn(source: Arc<dyn PollStateSource>, poll_id: u64, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(async move {
            loop {
                match fetch_poll_data(&*source, poll_id).await {
                    Ok(data) => {
                        let ended = data.vote_ended;
                        tx.send_replace(Some(data));
                        if ended {
                            tracing::debug!(poll_id, "voting ended, poll refresh stopped");
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(poll_id, "poll refresh failed: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        });
        Self { rx, task }
    }

    /// last fetched data, `None` until the first successful read
    pub fn latest(&self) -> Option<PollData> {
        self.rx.borrow().clone()
    }

    /// wait for the next update, `None` once refreshing has stopped
    pub async fn changed(&mut self) -> Option<PollData> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
