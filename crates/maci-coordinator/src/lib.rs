//! maci-coordinator: poll finalization for maci voting
//!
//! drives a closed maci poll to an on-chain tally through the coordinator
//! service, reads poll state from the chain and orchestrates the voter side
//! (keypair, signup, poll join, vote).
//!
//! ## finalize flow
//!
//! ```text
//!   isTallied? ──yes──▶ already finalized (no coordinator calls)
//!       │ no
//!       ▼
//!   merging ── stateMerged? ──no──▶ POST /proof/merge
//!       │
//!       ▼
//!   proving ──▶ POST /proof/generate  (start block .. block at poll end)
//!       │
//!       ▼
//!   submitting ──▶ POST /proof/submit
//!       │
//!       ▼
//!   submitted
//! ```
//!
//! any failed step stops the run in `Failed { stage, .. }`. a rerun starts
//! over from merging, the merge check skips work already on-chain.
//!
//! ## usage
//!
//! ```rust,ignore
//! let config = Config::from_env()?;
//! let provider = Arc::new(RpcProvider::new(&config.rpc_endpoint));
//! let reader = Arc::new(MaciReader::new(config.maci_address, provider, config.seconds_per_block));
//! let coordinator = Arc::new(CoordinatorClient::new(&config)?);
//!
//! let finalizer = Finalizer::new(coordinator, reader, Arc::new(TracingAlerts), config.maci_deployment_block);
//! let report = finalizer.finalize(poll_id).await?;
//! ```

pub mod abi;
pub mod alerts;
pub mod auth;
pub mod blocks;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod coordinator;
pub mod error;
pub mod finalize;
pub mod keystore;
pub mod poll_data;
pub mod proposal;
pub mod rpc;
pub mod schema;
pub mod sdk;
pub mod session;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod tx_errors;

pub use abi::Address;
pub use alerts::{Alert, AlertKind, AlertLog, AlertSink, ChannelAlerts, TracingAlerts};
pub use chain::to_backend_chain_format;
pub use config::Config;
pub use contracts::{MaciReader, MaciVoting, PollStateSource};
pub use coordinator::{Coordinator, CoordinatorClient, GenerateProofsArgs};
pub use error::{Error, Operation, Result, ServiceError, ServiceResult};
pub use finalize::{FinalizeOutcome, FinalizeReport, FinalizeStatus, Finalizer, Stage};
pub use keystore::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use poll_data::{can_finalize, fetch_poll_data, PollData, PollWatcher};
pub use proposal::{Proposal, ProposalExecutor, ProposalStatus, Tally, VoteOption};
pub use rpc::{ChainProvider, RpcProvider};
pub use schema::{GenerateResponse, SubmitResponse, TallyData, VoteMode};
pub use sdk::{Keypair, MaciSdk};
pub use session::{MaciSession, SessionError, SessionState};
pub use tx_errors::TxFailure;
