//! typed views over the maci, poll, tally and voting plugin contracts

use crate::abi::{decode_hex, encode_call, encode_tokens, keccak256, Address, Token, Words};
use crate::blocks;
use crate::error::{Error, Result};
use crate::proposal::{Action, Proposal, ProposalCreation, ProposalParameters, TargetConfig, Tally};
use crate::rpc::{BlockTag, ChainProvider, Log, LogFilter, TxHash};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// upper bound on vote options read from a tally contract
pub const MAX_TALLY_RESULTS: u64 = 1 << 16;

/// contracts deployed for one poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollContracts {
    pub poll: Address,
    pub message_processor: Address,
    pub tally: Address,
}

/// voting window in unix seconds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollDates {
    pub start: u64,
    pub end: u64,
}

/// one entry of the on-chain tally
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TallyResult {
    pub value: u128,
    /// set once the result has been verified on-chain
    pub is_set: bool,
}

async fn view(
    provider: &dyn ChainProvider,
    to: Address,
    signature: &str,
    args: &[Token],
) -> Result<Vec<u8>> {
    provider
        .call(to, encode_call(signature, args))
        .await
        .map_err(|e| match e {
            Error::RpcResponse { code, message } => Error::RpcResponse {
                code,
                message: format!("{} on {}: {}", signature, to, message),
            },
            other => other,
        })
}

#[derive(Clone)]
pub struct Maci {
    address: Address,
    provider: Arc<dyn ChainProvider>,
}

impl Maci {
    pub fn new(address: Address, provider: Arc<dyn ChainProvider>) -> Self {
        Self { address, provider }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn get_poll(&self, poll_id: u64) -> Result<PollContracts> {
        let out = view(
            &*self.provider,
            self.address,
            "getPoll(uint256)",
            &[Token::Uint(poll_id.into())],
        )
        .await?;
        let words = Words::new(&out);
        Ok(PollContracts {
            poll: words.address(0)?,
            message_processor: words.address(1)?,
            tally: words.address(2)?,
        })
    }

    pub async fn total_signups(&self) -> Result<u64> {
        let out = view(&*self.provider, self.address, "totalSignups()", &[]).await?;
        Words::new(&out).uint64(0)
    }
}

#[derive(Clone)]
pub struct PollContract {
    address: Address,
    provider: Arc<dyn ChainProvider>,
}

impl PollContract {
    pub fn new(address: Address, provider: Arc<dyn ChainProvider>) -> Self {
        Self { address, provider }
    }

    /// whether the state tree has been merged
    pub async fn state_merged(&self) -> Result<bool> {
        let out = view(&*self.provider, self.address, "stateMerged()", &[]).await?;
        Words::new(&out).boolean(0)
    }

    pub async fn start_and_end_date(&self) -> Result<PollDates> {
        let out = view(&*self.provider, self.address, "getStartAndEndDate()", &[]).await?;
        let words = Words::new(&out);
        Ok(PollDates {
            start: words.uint64(0)?,
            end: words.uint64(1)?,
        })
    }

    pub async fn end_date(&self) -> Result<u64> {
        let out = view(&*self.provider, self.address, "endDate()", &[]).await?;
        Words::new(&out).uint64(0)
    }
}

#[derive(Clone)]
pub struct TallyContract {
    address: Address,
    provider: Arc<dyn ChainProvider>,
}

impl TallyContract {
    pub fn new(address: Address, provider: Arc<dyn ChainProvider>) -> Self {
        Self { address, provider }
    }

    pub async fn is_tallied(&self) -> Result<bool> {
        let out = view(&*self.provider, self.address, "isTallied()", &[]).await?;
        Words::new(&out).boolean(0)
    }

    pub async fn total_tally_results(&self) -> Result<u64> {
        let out = view(&*self.provider, self.address, "totalTallyResults()", &[]).await?;
        Words::new(&out).uint64(0)
    }

    pub async fn tally_result(&self, index: u64) -> Result<TallyResult> {
        let out = view(
            &*self.provider,
            self.address,
            "tallyResults(uint256)",
            &[Token::Uint(index.into())],
        )
        .await?;
        let words = Words::new(&out);
        Ok(TallyResult {
            value: words.uint128(0)?,
            is_set: words.boolean(1)?,
        })
    }

    /// every published result, in vote option order
    pub async fn results(&self) -> Result<Vec<TallyResult>> {
        let total = self.total_tally_results().await?;
        if total > MAX_TALLY_RESULTS {
            return Err(Error::AbiDecode(format!(
                "totalTallyResults {} exceeds {}",
                total, MAX_TALLY_RESULTS
            )));
        }
        let mut results = Vec::with_capacity(total as usize);
        for index in 0..total {
            results.push(self.tally_result(index).await?);
        }
        Ok(results)
    }

    pub async fn total_spent(&self) -> Result<u128> {
        let out = view(&*self.provider, self.address, "totalSpent()", &[]).await?;
        Words::new(&out).uint128(0)
    }
}

/// the maci voting governance plugin
#[derive(Clone)]
pub struct MaciVoting {
    address: Address,
    provider: Arc<dyn ChainProvider>,
}

impl MaciVoting {
    pub fn new(address: Address, provider: Arc<dyn ChainProvider>) -> Self {
        Self { address, provider }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn proposal_count(&self) -> Result<u64> {
        let out = view(&*self.provider, self.address, "proposalCount()", &[]).await?;
        Words::new(&out).uint64(0)
    }

    pub async fn can_execute(&self, proposal_id: u64) -> Result<bool> {
        let out = view(
            &*self.provider,
            self.address,
            "canExecute(uint256)",
            &[Token::Uint(proposal_id.into())],
        )
        .await?;
        Words::new(&out).boolean(0)
    }

    pub async fn has_succeeded(&self, proposal_id: u64) -> Result<bool> {
        let out = view(
            &*self.provider,
            self.address,
            "hasSucceeded(uint256)",
            &[Token::Uint(proposal_id.into())],
        )
        .await?;
        Words::new(&out).boolean(0)
    }

    pub async fn get_proposal(&self, proposal_id: u64) -> Result<Proposal> {
        let out = view(
            &*self.provider,
            self.address,
            "getProposal(uint256)",
            &[Token::Uint(proposal_id.into())],
        )
        .await?;
        decode_proposal(&out)
    }

    /// creator and metadata, looked up around the snapshot block
    pub async fn proposal_creation(
        &self,
        proposal_id: u64,
        snapshot_block: u64,
    ) -> Result<Option<ProposalCreation>> {
        let filter = LogFilter {
            address: Some(self.address),
            topics: vec![
                Some(format!("0x{}", hex::encode(keccak256(PROPOSAL_CREATED.as_bytes())))),
                Some(format!("0x{}", hex::encode(encode_tokens(&[Token::Uint(proposal_id.into())])))),
            ],
            from_block: Some(snapshot_block),
            to_block: Some(snapshot_block + 1),
        };
        match self.provider.get_logs(&filter).await?.first() {
            Some(log) => decode_proposal_created(log).map(Some),
            None => Ok(None),
        }
    }

    pub async fn execute(&self, proposal_id: u64) -> Result<TxHash> {
        self.provider
            .send_transaction(
                self.address,
                encode_call("execute(uint256)", &[Token::Uint(proposal_id.into())]),
            )
            .await
    }
}

pub const PROPOSAL_CREATED: &str =
    "ProposalCreated(uint256,address,uint64,uint64,bytes,(address,uint256,bytes)[],uint256)";

fn decode_proposal_created(log: &Log) -> Result<ProposalCreation> {
    let creator_topic = log
        .topics
        .get(2)
        .ok_or_else(|| Error::AbiDecode("ProposalCreated without creator topic".into()))?;
    let creator = Words::new(&decode_hex(creator_topic)?).address(0)?;
    let metadata = Words::new(&log.data).bytes(2)?;
    Ok(ProposalCreation {
        creator,
        metadata: String::from_utf8_lossy(&metadata).into_owned(),
    })
}

/// decode the single dynamic tuple returned by `getProposal`
pub fn decode_proposal(data: &[u8]) -> Result<Proposal> {
    let tuple = Words::new(data).follow(0)?;

    let actions_view = tuple.follow(8)?;
    let count = actions_view.uint64(0)? as usize;
    let elements = actions_view.skip(1)?;
    let mut actions = Vec::with_capacity(count);
    for i in 0..count {
        let action = elements.follow(i)?;
        actions.push(Action {
            to: action.address(0)?,
            value: action.uint128(1)?,
            data: action.bytes(2)?,
        });
    }

    let operation = tuple.uint64(11)?;
    Ok(Proposal {
        executed: tuple.boolean(0)?,
        parameters: ProposalParameters {
            start_date: tuple.uint64(1)?,
            end_date: tuple.uint64(2)?,
            snapshot_block: tuple.uint64(3)?,
            min_voting_power: tuple.uint128(4)?,
        },
        tally: Tally {
            yes: tuple.uint128(5)?,
            no: tuple.uint128(6)?,
            abstain: tuple.uint128(7)?,
        },
        actions,
        allow_failure_map: tuple.uint128(9)?,
        target_config: TargetConfig {
            target: tuple.address(10)?,
            operation: u8::try_from(operation).map_err(|_| Error::Overflow {
                target: "u8",
                value: format!("{:x}", operation),
            })?,
        },
        poll_id: tuple.uint64(12)?,
        poll_address: tuple.address(13)?,
    })
}

/// the chain reads finalization and poll views depend on
#[async_trait]
pub trait PollStateSource: Send + Sync {
    async fn is_tallied(&self, poll_id: u64) -> Result<bool>;

    async fn is_merged(&self, poll_id: u64) -> Result<bool>;

    async fn poll_dates(&self, poll_id: u64) -> Result<PollDates>;

    async fn tally_results(&self, poll_id: u64) -> Result<Vec<TallyResult>>;

    /// timestamp of the latest block
    async fn chain_time(&self) -> Result<u64>;

    async fn block_at_timestamp(&self, timestamp: u64) -> Result<u64>;
}

/// [`PollStateSource`] backed by the maci contracts
pub struct MaciReader {
    maci: Maci,
    provider: Arc<dyn ChainProvider>,
    seconds_per_block: u64,
    /// poll deployments never change once created
    polls: RwLock<HashMap<u64, PollContracts>>,
}

impl MaciReader {
    pub fn new(maci_address: Address, provider: Arc<dyn ChainProvider>, seconds_per_block: u64) -> Self {
        Self {
            maci: Maci::new(maci_address, provider.clone()),
            provider,
            seconds_per_block,
            polls: RwLock::new(HashMap::new()),
        }
    }

    pub fn maci(&self) -> &Maci {
        &self.maci
    }

    pub async fn poll_contracts(&self, poll_id: u64) -> Result<PollContracts> {
        if let Some(contracts) = self.polls.read().await.get(&poll_id) {
            return Ok(*contracts);
        }
        let contracts = self.maci.get_poll(poll_id).await?;
        if contracts.poll.is_zero() {
            return Err(Error::AbiDecode(format!("poll {} does not exist", poll_id)));
        }
        self.polls.write().await.insert(poll_id, contracts);
        Ok(contracts)
    }

    async fn poll(&self, poll_id: u64) -> Result<PollContract> {
        let contracts = self.poll_contracts(poll_id).await?;
        Ok(PollContract::new(contracts.poll, self.provider.clone()))
    }

    async fn tally(&self, poll_id: u64) -> Result<TallyContract> {
        let contracts = self.poll_contracts(poll_id).await?;
        Ok(TallyContract::new(contracts.tally, self.provider.clone()))
    }
}

#[async_trait]
impl PollStateSource for MaciReader {
    async fn is_tallied(&self, poll_id: u64) -> Result<bool> {
        self.tally(poll_id).await?.is_tallied().await
    }

    async fn is_merged(&self, poll_id: u64) -> Result<bool> {
        self.poll(poll_id).await?.state_merged().await
    }

    async fn poll_dates(&self, poll_id: u64) -> Result<PollDates> {
        self.poll(poll_id).await?.start_and_end_date().await
    }

    async fn tally_results(&self, poll_id: u64) -> Result<Vec<TallyResult>> {
        self.tally(poll_id).await?.results().await
    }

    async fn chain_time(&self) -> Result<u64> {
        Ok(self.provider.get_block(BlockTag::Latest).await?.timestamp)
    }

    async fn block_at_timestamp(&self, timestamp: u64) -> Result<u64> {
        blocks::block_at_timestamp(&*self.provider, timestamp, self.seconds_per_block).await
    }
}
