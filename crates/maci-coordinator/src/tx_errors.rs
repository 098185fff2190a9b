//! classification of transaction failures into user guidance

use crate::abi::selector_hex;
use crate::alerts::Alert;
use crate::error::Error;
use std::time::Duration;

const USER_REJECTED_PREFIX: &str = "User rejected the request";
const ACTION_FAILED: &str = "ActionFailed(uint256)";
const ACTION_FAILED_NAMED: &str = "ActionFailed(uint256 index)";
const VOTING_PERIOD_OVER: &str = "VotingPeriodOver()";
const VOTING_PERIOD_NOT_STARTED: &str = "VotingPeriodNotStarted()";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxFailure {
    /// the wallet declined to sign
    UserRejected,
    /// a dao action reverted, zero-based index
    ActionFailed { index: u64 },
    VotingPeriodOver,
    VotingPeriodNotStarted,
    Other(String),
}

/// match a wallet/node error message against known revert reasons
pub fn classify(message: &str) -> TxFailure {
    if message.starts_with(USER_REJECTED_PREFIX) {
        return TxFailure::UserRejected;
    }
    if let Some(index) = action_failed_index(message) {
        return TxFailure::ActionFailed { index };
    }
    if matches_error(message, VOTING_PERIOD_NOT_STARTED) {
        return TxFailure::VotingPeriodNotStarted;
    }
    if matches_error(message, VOTING_PERIOD_OVER) {
        return TxFailure::VotingPeriodOver;
    }
    TxFailure::Other(message.to_string())
}

/// classify a provider error by the node's own message
pub fn classify_error(err: &Error) -> TxFailure {
    match err {
        Error::RpcResponse { message, .. } | Error::Sdk(message) => classify(message),
        other => classify(&other.to_string()),
    }
}

/// revert matched by error name or by its selector
fn matches_error(message: &str, signature: &str) -> bool {
    let name = signature.trim_end_matches("()");
    message.contains(name) || message.contains(&selector_hex(signature))
}

fn action_failed_index(message: &str) -> Option<u64> {
    // decoded form: `ActionFailed(uint256 index)\n    (2)`
    if let Some(pos) = message.find(ACTION_FAILED_NAMED) {
        let rest = message[pos + ACTION_FAILED_NAMED.len()..].trim_start();
        let digits: String = rest
            .strip_prefix('(')?
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        return digits.parse().ok();
    }

    // raw revert data: selector followed by the index word
    let selector = selector_hex(ACTION_FAILED);
    let pos = message.find(&selector)?;
    let word = message.get(pos + selector.len()..pos + selector.len() + 64)?;
    u64::from_str_radix(word.trim_start_matches('0'), 16)
        .ok()
        .or_else(|| word.chars().all(|c| c == '0').then_some(0))
}

impl TxFailure {
    /// message shown when a vote cannot be published
    pub fn vote_message(&self) -> String {
        match self {
            TxFailure::UserRejected => "The vote signature was declined".into(),
            TxFailure::VotingPeriodOver => "The voting period has ended".into(),
            TxFailure::VotingPeriodNotStarted => "The voting period has not started yet".into(),
            _ => "Error submitting vote".into(),
        }
    }

    pub fn is_user_rejection(&self) -> bool {
        matches!(self, TxFailure::UserRejected)
    }

    /// alert for a failed transaction, `title` used for genuine failures
    pub fn alert(&self, title: &str) -> Alert {
        match self {
            TxFailure::UserRejected => {
                Alert::neutral("Transaction rejected by the user").with_timeout(Duration::from_secs(4))
            }
            TxFailure::ActionFailed { index } => Alert::error(title).with_description(format!(
                "Action {} failed to complete successfully",
                index + 1
            )),
            TxFailure::VotingPeriodOver | TxFailure::VotingPeriodNotStarted => {
                Alert::error(title).with_description(self.vote_message())
            }
            TxFailure::Other(_) => Alert::error(title)
                .with_description("The proposal may contain actions with invalid operations"),
        }
    }
}
