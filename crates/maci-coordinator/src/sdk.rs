//! the maci protocol sdk, consumed as an opaque collaborator
//!
//! key derivation, signup, poll joining (inclusion proof against the rebuilt
//! state tree) and vote publishing all live behind [`MaciSdk`]. this crate
//! only sequences the calls.

use crate::error::Result;
use crate::rpc::TxHash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// maci keypair in the sdk's serialized form (`macisk.` / `macipk.`)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keypair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignupReceipt {
    /// leaf index in the maci state tree
    pub state_index: u64,
    pub tx_hash: Option<TxHash>,
}

/// zk circuit parameters needed to prove poll membership
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactBundle {
    pub zkey: Vec<u8>,
    pub wasm: Vec<u8>,
}

pub struct JoinPollRequest<'a> {
    pub poll_id: u64,
    pub keypair: &'a Keypair,
    pub state_index: u64,
    pub artifacts: &'a ArtifactBundle,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinReceipt {
    pub poll_state_index: u64,
    pub voice_credits: u128,
    pub tx_hash: TxHash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoteMessage {
    pub vote_option_index: u64,
    pub new_vote_weight: u128,
}

#[async_trait]
pub trait MaciSdk: Send + Sync {
    /// derive a keypair from a wallet signature
    async fn generate_keypair(&self, seed: &str) -> Result<Keypair>;

    /// rebuild a keypair from a serialized private key
    async fn keypair_from_private_key(&self, private_key: &str) -> Result<Keypair>;

    /// state index when the public key is already signed up
    async fn is_signed_up(&self, public_key: &str) -> Result<Option<u64>>;

    async fn signup(&self, public_key: &str) -> Result<SignupReceipt>;

    async fn download_artifacts(&self, poll_id: u64) -> Result<ArtifactBundle>;

    async fn has_joined_poll(&self, poll_id: u64, keypair: &Keypair) -> Result<bool>;

    async fn join_poll(&self, request: JoinPollRequest<'_>) -> Result<JoinReceipt>;

    /// encrypt, sign and publish vote messages to the poll
    async fn publish_votes(
        &self,
        poll_id: u64,
        keypair: &Keypair,
        votes: &[VoteMessage],
    ) -> Result<TxHash>;
}
