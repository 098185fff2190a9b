//! governance proposals backed by maci polls

use crate::abi::Address;
use crate::alerts::{Alert, AlertSink};
use crate::contracts::{MaciVoting, TallyResult};
use crate::error::Result;
use crate::rpc::TxHash;
use crate::tx_errors::{classify_error, TxFailure};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProposalParameters {
    pub start_date: u64,
    pub end_date: u64,
    pub snapshot_block: u64,
    pub min_voting_power: u128,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub yes: u128,
    pub no: u128,
    pub abstain: u128,
}

impl Tally {
    /// map maci tally results (option 0 yes, 1 no, 2 abstain)
    pub fn from_results(results: &[TallyResult]) -> Self {
        let at = |i: usize| results.get(i).map(|r| r.value).unwrap_or(0);
        Self {
            yes: at(VoteOption::Yes.index()),
            no: at(VoteOption::No.index()),
            abstain: at(VoteOption::Abstain.index()),
        }
    }

    pub fn total(&self) -> u128 {
        self.yes + self.no + self.abstain
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// a dao action executed when the proposal passes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub to: Address,
    pub value: u128,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetConfig {
    pub target: Address,
    /// 0 call, 1 delegatecall
    pub operation: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub executed: bool,
    pub parameters: ProposalParameters,
    pub tally: Tally,
    pub actions: Vec<Action>,
    pub allow_failure_map: u128,
    pub target_config: TargetConfig,
    pub poll_id: u64,
    pub poll_address: Address,
}

impl Proposal {
    /// voting still open at `now`
    pub fn is_active(&self, now: u64) -> bool {
        now < self.parameters.end_date
    }
}

/// creator and metadata from the `ProposalCreated` event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposalCreation {
    pub creator: Address,
    /// metadata uri, usually `ipfs://...`
    pub metadata: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteOption {
    Yes,
    No,
    Abstain,
}

impl VoteOption {
    /// vote option index in the maci poll
    pub fn index(self) -> usize {
        match self {
            VoteOption::Yes => 0,
            VoteOption::No => 1,
            VoteOption::Abstain => 2,
        }
    }
}

impl fmt::Display for VoteOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteOption::Yes => write!(f, "Yes"),
            VoteOption::No => write!(f, "No"),
            VoteOption::Abstain => write!(f, "Abstain"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tone {
    Info,
    Primary,
    Success,
    Critical,
}

/// badge shown next to a proposal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusVariant {
    Loading,
    Executed,
    Defeated,
    LowTurnout,
    Executable,
    Active,
}

impl StatusVariant {
    pub fn label(self) -> &'static str {
        match self {
            StatusVariant::Loading => "(Loading)",
            StatusVariant::Executed => "Executed",
            StatusVariant::Defeated => "Defeated",
            StatusVariant::LowTurnout => "Low turnout",
            StatusVariant::Executable => "Executable",
            StatusVariant::Active => "Active",
        }
    }

    pub fn tone(self) -> Tone {
        match self {
            StatusVariant::Loading | StatusVariant::Active => Tone::Info,
            StatusVariant::Executed => Tone::Primary,
            StatusVariant::Executable => Tone::Success,
            StatusVariant::Defeated | StatusVariant::LowTurnout => Tone::Critical,
        }
    }
}

pub fn status_variant(proposal: Option<&Proposal>, now: u64) -> StatusVariant {
    let Some(proposal) = proposal else {
        return StatusVariant::Loading;
    };
    if proposal.executed {
        return StatusVariant::Executed;
    }
    if proposal.is_active(now) {
        return StatusVariant::Active;
    }

    let tally = &proposal.tally;
    let yes_no = tally.yes + tally.no;
    if yes_no == 0 {
        return StatusVariant::Defeated;
    }
    if yes_no + tally.abstain < proposal.parameters.min_voting_power {
        return StatusVariant::LowTurnout;
    }
    if tally.yes > tally.no {
        StatusVariant::Executable
    } else {
        StatusVariant::Defeated
    }
}

/// lifecycle status of a proposal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposalStatus {
    Executed,
    Active,
    /// voting closed, tally not published yet
    Pending,
    Rejected,
    Accepted,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Executed => "executed",
            ProposalStatus::Active => "active",
            ProposalStatus::Pending => "pending",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Accepted => "accepted",
        }
    }
}

pub fn proposal_status(proposal: &Proposal, now: u64, is_tallied: bool) -> ProposalStatus {
    if proposal.executed {
        ProposalStatus::Executed
    } else if proposal.is_active(now) {
        ProposalStatus::Active
    } else if !is_tallied {
        ProposalStatus::Pending
    } else if status_variant(Some(proposal), now) == StatusVariant::Executable {
        ProposalStatus::Accepted
    } else {
        ProposalStatus::Rejected
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WinningOption {
    pub option: VoteOption,
    pub votes: u128,
    /// integer percentage of all votes
    pub percentage: u8,
}

/// leading option; yes wins ties with no, and yes wins ties with abstain
pub fn winning_option(tally: Option<&Tally>) -> WinningOption {
    let empty = WinningOption {
        option: VoteOption::Yes,
        votes: 0,
        percentage: 0,
    };
    let Some(tally) = tally else {
        return empty;
    };
    let total = tally.total();
    if total == 0 {
        return empty;
    }

    let (option, votes) = if tally.yes >= tally.no {
        if tally.yes >= tally.abstain {
            (VoteOption::Yes, tally.yes)
        } else {
            (VoteOption::Abstain, tally.abstain)
        }
    } else {
        (VoteOption::No, tally.no)
    };

    WinningOption {
        option,
        votes,
        percentage: (votes * 100 / total) as u8,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// `canExecute` returned false, nothing was sent
    NotExecutable,
    Submitted(TxHash),
    Failed(TxFailure),
}

/// executes passed proposals and reports through alerts
pub struct ProposalExecutor {
    voting: MaciVoting,
    alerts: Arc<dyn AlertSink>,
}

impl ProposalExecutor {
    pub fn new(voting: MaciVoting, alerts: Arc<dyn AlertSink>) -> Self {
        Self { voting, alerts }
    }

    pub async fn execute(&self, proposal_id: u64) -> Result<ExecuteOutcome> {
        if !self.voting.can_execute(proposal_id).await? {
            tracing::info!(proposal_id, "proposal cannot be executed");
            return Ok(ExecuteOutcome::NotExecutable);
        }

        match self.voting.execute(proposal_id).await {
            Ok(tx_hash) => {
                tracing::info!(proposal_id, %tx_hash, "execute sent");
                self.alerts.push(
                    Alert::info("Proposal submitted")
                        .with_description("Waiting for the transaction to be validated")
                        .with_tx_hash(tx_hash.clone()),
                );
                Ok(ExecuteOutcome::Submitted(tx_hash))
            }
            Err(e) => {
                let failure = classify_error(&e);
                if !failure.is_user_rejection() {
                    tracing::error!(proposal_id, "execute failed: {}", e);
                }
                self.alerts
                    .push(failure.alert("Could not execute the proposal"));
                Ok(ExecuteOutcome::Failed(failure))
            }
        }
    }
}
