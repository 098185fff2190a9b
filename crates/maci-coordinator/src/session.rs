//! keypair, signup, poll join and vote orchestration for one wallet
//!
//! [`MaciSession`] owns the state a voter's view needs and exposes it through
//! a watch channel. each operation checks its preconditions before touching
//! the sdk, and operations that write on-chain are gated so only one runs at a
//! time. failures are recorded in [`SessionState::error`] as well as returned.

use crate::abi::Address;
use crate::alerts::{Alert, AlertSink};
use crate::error::Error;
use crate::keystore::{KeyStore, KEY_ADDRESS, KEY_PRIVATE_KEY};
use crate::proposal::VoteOption;
use crate::rpc::{ChainProvider, TxHash};
use crate::sdk::{ArtifactBundle, JoinPollRequest, Keypair, MaciSdk, VoteMessage};
use crate::tx_errors::{classify_error, TxFailure};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Wallet client not found")]
    WalletNotFound,

    #[error("Keypair not found")]
    KeypairNotFound,

    #[error("You need to sign up first")]
    NotRegistered,

    #[error("You have already joined the poll")]
    AlreadyJoined,

    #[error("You need to join the poll first")]
    NotJoined,

    #[error("No poll selected")]
    NoPoll,

    #[error("Another operation is in progress")]
    Busy,

    #[error("Error signing up")]
    Signup(#[source] Error),

    #[error("{}", .0.vote_message())]
    Vote(TxFailure),

    #[error(transparent)]
    Backend(#[from] Error),
}

/// everything a voter's view renders
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
    pub address: Option<Address>,
    pub keypair: Option<Keypair>,
    pub is_registered: bool,
    pub state_index: Option<u64>,
    pub poll_id: Option<u64>,
    pub has_joined_poll: bool,
    /// circuit artifacts for the current poll are downloaded
    pub has_artifacts: bool,
    pub initial_voice_credits: u128,
    pub is_loading: bool,
    pub error: Option<String>,
}

/// clears the loading flag when an operation ends
struct Busy<'a> {
    state: &'a watch::Sender<SessionState>,
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|s| s.is_loading = false);
    }
}

pub struct MaciSession {
    provider: Arc<dyn ChainProvider>,
    sdk: Arc<dyn MaciSdk>,
    store: Arc<dyn KeyStore>,
    alerts: Arc<dyn AlertSink>,
    /// origin shown in the keypair signing message
    origin: String,
    state: watch::Sender<SessionState>,
    artifacts: Mutex<Option<(u64, ArtifactBundle)>>,
}

impl MaciSession {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        sdk: Arc<dyn MaciSdk>,
        store: Arc<dyn KeyStore>,
        alerts: Arc<dyn AlertSink>,
        origin: impl Into<String>,
    ) -> Self {
        let state = SessionState {
            address: provider.signer(),
            ..SessionState::default()
        };
        Self {
            provider,
            sdk,
            store,
            alerts,
            origin: origin.into(),
            state: watch::Sender::new(state),
            artifacts: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// message the wallet signs to seed keypair generation
    pub fn keypair_message(&self) -> String {
        format!("Sign to generate MACI keypair at {}", self.origin)
    }

    fn begin(&self) -> Result<Busy<'_>, SessionError> {
        let acquired = self.state.send_if_modified(|s| {
            if s.is_loading {
                return false;
            }
            s.is_loading = true;
            s.error = None;
            true
        });
        if acquired {
            Ok(Busy { state: &self.state })
        } else {
            Err(SessionError::Busy)
        }
    }

    /// record the failure for the view and hand it back
    fn fail(&self, err: SessionError) -> SessionError {
        let message = err.to_string();
        tracing::debug!("session error: {}", message);
        self.state.send_modify(|s| s.error = Some(message));
        err
    }

    fn account(&self) -> Result<Address, SessionError> {
        self.state
            .borrow()
            .address
            .or_else(|| self.provider.signer())
            .ok_or(SessionError::WalletNotFound)
    }

    fn keypair(&self) -> Result<Keypair, SessionError> {
        self.state
            .borrow()
            .keypair
            .clone()
            .ok_or(SessionError::KeypairNotFound)
    }

    /// stored key for `account`, dropping a key that belongs to another account
    async fn stored_keypair(&self, account: Address) -> Result<Option<Keypair>, SessionError> {
        let Some(private_key) = self.store.get(KEY_PRIVATE_KEY)? else {
            return Ok(None);
        };
        let owner = self.store.get(KEY_ADDRESS)?;
        if !owner.is_some_and(|o| o.eq_ignore_ascii_case(&account.to_string())) {
            tracing::info!("stored maci key belongs to another account, removing it");
            self.store.remove(KEY_PRIVATE_KEY)?;
            self.store.remove(KEY_ADDRESS)?;
            return Ok(None);
        }
        Ok(Some(self.sdk.keypair_from_private_key(&private_key).await?))
    }

    /// load the stored keypair or derive a new one from a wallet signature
    pub async fn create_keypair(&self) -> Result<Keypair, SessionError> {
        let account = self.account().map_err(|e| self.fail(e))?;

        let keypair = match self.stored_keypair(account).await.map_err(|e| self.fail(e))? {
            Some(keypair) => keypair,
            None => {
                let signature = match self.provider.sign_message(&self.keypair_message()).await {
                    Ok(signature) => signature,
                    Err(e) => {
                        let failure = classify_error(&e);
                        if failure.is_user_rejection() {
                            self.alerts.push(failure.alert("Could not create the keypair"));
                        }
                        return Err(self.fail(e.into()));
                    }
                };
                let keypair = self
                    .sdk
                    .generate_keypair(&signature)
                    .await
                    .map_err(|e| self.fail(e.into()))?;
                self.store
                    .set(KEY_PRIVATE_KEY, &keypair.private_key)
                    .and_then(|_| self.store.set(KEY_ADDRESS, &account.to_string()))
                    .map_err(|e| self.fail(e.into()))?;
                tracing::info!(%account, "maci keypair generated");
                keypair
            }
        };

        self.state.send_modify(|s| s.keypair = Some(keypair.clone()));
        Ok(keypair)
    }

    /// forget the local key and everything derived from it
    pub fn delete_keypair(&self) -> Result<(), SessionError> {
        self.store.remove(KEY_PRIVATE_KEY)?;
        self.store.remove(KEY_ADDRESS)?;
        self.state.send_modify(|s| {
            s.keypair = None;
            s.is_registered = false;
            s.state_index = None;
            s.has_joined_poll = false;
            s.initial_voice_credits = 0;
        });
        tracing::info!("maci keypair deleted");
        Ok(())
    }

    /// the wallet switched accounts or disconnected
    pub async fn on_account_change(&self, address: Option<Address>) -> Result<(), SessionError> {
        if self.state.borrow().address == address {
            return Ok(());
        }
        self.state.send_modify(|s| {
            *s = SessionState {
                address,
                poll_id: s.poll_id,
                has_artifacts: s.has_artifacts,
                ..SessionState::default()
            }
        });

        let Some(account) = address else {
            return Ok(());
        };
        if let Some(keypair) = self.stored_keypair(account).await.map_err(|e| self.fail(e))? {
            self.state.send_modify(|s| s.keypair = Some(keypair));
            self.check_registration().await?;
            let poll_id = self.state.borrow().poll_id;
            if let Some(poll_id) = poll_id {
                self.refresh_joined(poll_id).await?;
            }
        }
        Ok(())
    }

    /// read signup state for the current keypair from the chain
    pub async fn check_registration(&self) -> Result<bool, SessionError> {
        let keypair = self.keypair().map_err(|e| self.fail(e))?;
        let state_index = self
            .sdk
            .is_signed_up(&keypair.public_key)
            .await
            .map_err(|e| self.fail(e.into()))?;
        self.state.send_modify(|s| {
            s.is_registered = state_index.is_some();
            s.state_index = state_index;
        });
        Ok(state_index.is_some())
    }

    /// sign up the current keypair unless the chain already knows it
    pub async fn on_signup(&self) -> Result<u64, SessionError> {
        let _busy = self.begin()?;
        self.account().map_err(|e| self.fail(e))?;
        let keypair = self.keypair().map_err(|e| self.fail(e))?;

        let existing = self
            .sdk
            .is_signed_up(&keypair.public_key)
            .await
            .map_err(|e| self.fail(e.into()))?;
        if let Some(state_index) = existing {
            tracing::debug!(state_index, "already signed up");
            self.state.send_modify(|s| {
                s.is_registered = true;
                s.state_index = Some(state_index);
            });
            return Ok(state_index);
        }

        match self.sdk.signup(&keypair.public_key).await {
            Ok(receipt) => {
                tracing::info!(state_index = receipt.state_index, "signed up to maci");
                self.state.send_modify(|s| {
                    s.is_registered = true;
                    s.state_index = Some(receipt.state_index);
                });
                let mut alert = Alert::success("Signed up to MACI");
                if let Some(tx_hash) = receipt.tx_hash {
                    alert = alert.with_tx_hash(tx_hash);
                }
                self.alerts.push(alert);
                Ok(receipt.state_index)
            }
            Err(e) => {
                tracing::warn!("signup failed: {}", e);
                self.state.send_modify(|s| {
                    s.is_registered = false;
                    s.state_index = None;
                });
                Err(self.fail(SessionError::Signup(e)))
            }
        }
    }

    async fn refresh_joined(&self, poll_id: u64) -> Result<bool, SessionError> {
        let keypair = self.keypair().map_err(|e| self.fail(e))?;
        let joined = self
            .sdk
            .has_joined_poll(poll_id, &keypair)
            .await
            .map_err(|e| self.fail(e.into()))?;
        self.state.send_modify(|s| {
            if s.poll_id == Some(poll_id) {
                s.has_joined_poll = joined;
            }
        });
        Ok(joined)
    }

    /// select the poll the view is showing, returns whether it is joined
    pub async fn set_poll_id(&self, poll_id: u64) -> Result<bool, SessionError> {
        let changed = self.state.send_if_modified(|s| {
            if s.poll_id == Some(poll_id) {
                return false;
            }
            s.poll_id = Some(poll_id);
            s.has_joined_poll = false;
            s.has_artifacts = false;
            true
        });
        if !changed {
            return Ok(self.state.borrow().has_joined_poll);
        }
        if self.state.borrow().keypair.is_none() {
            return Ok(false);
        }
        self.refresh_joined(poll_id).await
    }

    async fn fetch_artifacts(&self, poll_id: u64) -> Result<ArtifactBundle, SessionError> {
        let mut cached = self.artifacts.lock().await;
        if let Some((cached_poll, bundle)) = cached.as_ref() {
            if *cached_poll == poll_id {
                return Ok(bundle.clone());
            }
        }
        tracing::info!(poll_id, "downloading poll joining artifacts");
        let bundle = self.sdk.download_artifacts(poll_id).await?;
        *cached = Some((poll_id, bundle.clone()));
        self.state.send_modify(|s| {
            if s.poll_id == Some(poll_id) {
                s.has_artifacts = true;
            }
        });
        Ok(bundle)
    }

    /// fetch circuit artifacts for the selected poll
    pub async fn download_artifacts(&self) -> Result<(), SessionError> {
        let _busy = self.begin()?;
        let poll_id = self.state.borrow().poll_id;
        let poll_id = poll_id.ok_or(SessionError::NoPoll).map_err(|e| self.fail(e))?;
        self.fetch_artifacts(poll_id)
            .await
            .map(|_| ())
            .map_err(|e| self.fail(e))
    }

    pub async fn on_join_poll(&self, poll_id: u64) -> Result<TxHash, SessionError> {
        let _busy = self.begin()?;
        self.account().map_err(|e| self.fail(e))?;
        let keypair = self.keypair().map_err(|e| self.fail(e))?;
        let state_index = {
            let state = self.state.borrow();
            match state.state_index {
                Some(index) if state.is_registered => Some(index),
                _ => None,
            }
        };
        let state_index = state_index
            .ok_or(SessionError::NotRegistered)
            .map_err(|e| self.fail(e))?;

        self.state.send_modify(|s| {
            if s.poll_id != Some(poll_id) {
                s.poll_id = Some(poll_id);
                s.has_joined_poll = false;
                s.has_artifacts = false;
            }
        });
        let joined = self.state.borrow().has_joined_poll;
        if joined || self.refresh_joined(poll_id).await? {
            return Err(self.fail(SessionError::AlreadyJoined));
        }

        let artifacts = self.fetch_artifacts(poll_id).await.map_err(|e| self.fail(e))?;
        let request = JoinPollRequest {
            poll_id,
            keypair: &keypair,
            state_index,
            artifacts: &artifacts,
        };
        match self.sdk.join_poll(request).await {
            Ok(receipt) => {
                tracing::info!(poll_id, poll_state_index = receipt.poll_state_index, "joined poll");
                self.state.send_modify(|s| {
                    s.has_joined_poll = true;
                    s.initial_voice_credits = receipt.voice_credits;
                });
                self.alerts
                    .push(Alert::success("Joined the poll").with_tx_hash(receipt.tx_hash.clone()));
                Ok(receipt.tx_hash)
            }
            Err(e) => {
                let failure = classify_error(&e);
                if failure.is_user_rejection() {
                    self.alerts.push(failure.alert("Could not join the poll"));
                } else {
                    self.alerts.push(Alert::error("Could not join the poll"));
                }
                Err(self.fail(e.into()))
            }
        }
    }

    /// publish votes to the selected poll
    pub async fn on_vote(&self, votes: &[VoteMessage]) -> Result<TxHash, SessionError> {
        let (poll_id, keypair, joined) = {
            let state = self.state.borrow();
            (state.poll_id, state.keypair.clone(), state.has_joined_poll)
        };
        let poll_id = poll_id.ok_or(SessionError::NoPoll).map_err(|e| self.fail(e))?;
        let keypair = keypair
            .ok_or(SessionError::KeypairNotFound)
            .map_err(|e| self.fail(e))?;
        if !joined {
            return Err(self.fail(SessionError::NotJoined));
        }

        let _busy = self.begin()?;
        match self.sdk.publish_votes(poll_id, &keypair, votes).await {
            Ok(tx_hash) => {
                tracing::info!(poll_id, votes = votes.len(), "vote published");
                self.alerts
                    .push(Alert::success("Vote submitted").with_tx_hash(tx_hash.clone()));
                Ok(tx_hash)
            }
            Err(e) => {
                tracing::warn!(poll_id, "vote failed: {}", e);
                let failure = classify_error(&e);
                let alert = match failure {
                    TxFailure::UserRejected => failure.alert("Error submitting vote"),
                    _ => Alert::error(failure.vote_message()),
                };
                self.alerts.push(alert);
                Err(self.fail(SessionError::Vote(failure)))
            }
        }
    }

    /// a single full-weight vote for `option`
    pub async fn vote(&self, option: VoteOption) -> Result<TxHash, SessionError> {
        let message = VoteMessage {
            vote_option_index: option.index() as u64,
            new_vote_weight: 1,
        };
        self.on_vote(&[message]).await
    }
}
