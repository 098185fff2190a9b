//! in-memory chain for tests and dry runs
//!
//! blocks are produced at a fixed interval from a genesis timestamp, view
//! calls are answered from a table keyed by exact calldata, and sent
//! transactions are recorded instead of executed.

use crate::abi::{encode_call, keccak256, Address, Token};
use crate::error::{Error, Result};
use crate::rpc::{Block, BlockTag, ChainProvider, Log, LogFilter, TxHash};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// a transaction recorded by [`SimulatedChain::send_transaction`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentTransaction {
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct SimState {
    head: u64,
    views: HashMap<(Address, Vec<u8>), Vec<u8>>,
    logs: Vec<Log>,
    sent: Vec<SentTransaction>,
    send_error: Option<String>,
    block_reads: usize,
}

pub struct SimulatedChain {
    genesis_timestamp: u64,
    block_time: u64,
    signer: Option<Address>,
    state: Mutex<SimState>,
}

impl SimulatedChain {
    pub fn new(genesis_timestamp: u64, block_time: u64) -> Self {
        Self {
            genesis_timestamp,
            block_time,
            signer: None,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_signer(mut self, account: Address) -> Self {
        self.signer = Some(account);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_head(&self, number: u64) {
        self.state().head = number;
    }

    pub fn advance(&self, blocks: u64) {
        self.state().head += blocks;
    }

    pub fn head(&self) -> u64 {
        self.state().head
    }

    pub fn timestamp_of(&self, number: u64) -> u64 {
        self.genesis_timestamp + number * self.block_time
    }

    pub fn head_timestamp(&self) -> u64 {
        self.timestamp_of(self.head())
    }

    /// answer `signature(args)` on `to` with `returns`
    pub fn set_view(&self, to: Address, signature: &str, args: &[Token], returns: Vec<u8>) {
        self.state()
            .views
            .insert((to, encode_call(signature, args)), returns);
    }

    pub fn push_log(&self, log: Log) {
        self.state().logs.push(log);
    }

    /// make every following transaction fail with `message`
    pub fn fail_transactions(&self, message: impl Into<String>) {
        self.state().send_error = Some(message.into());
    }

    pub fn sent(&self) -> Vec<SentTransaction> {
        self.state().sent.clone()
    }

    /// number of `get_block` calls served so far
    pub fn block_reads(&self) -> usize {
        self.state().block_reads
    }
}

#[async_trait]
impl ChainProvider for SimulatedChain {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.head())
    }

    async fn get_block(&self, tag: BlockTag) -> Result<Block> {
        let number = {
            let mut state = self.state();
            state.block_reads += 1;
            match tag {
                BlockTag::Latest => state.head,
                BlockTag::Number(n) if n <= state.head => n,
                BlockTag::Number(n) => return Err(Error::Rpc(format!("block {} not found", n))),
            }
        };
        Ok(Block {
            number,
            timestamp: self.timestamp_of(number),
            hash: format!("0x{}", hex::encode(keccak256(&number.to_be_bytes()))),
        })
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        let state = self.state();
        Ok(state
            .logs
            .iter()
            .filter(|log| filter.address.map_or(true, |a| a == log.address))
            .filter(|log| {
                let n = log.block_number.unwrap_or(0);
                filter.from_block.map_or(true, |from| n >= from)
                    && filter.to_block.map_or(true, |to| n <= to)
            })
            .filter(|log| {
                filter.topics.iter().enumerate().all(|(i, topic)| match topic {
                    None => true,
                    Some(t) => log.topics.get(i).map_or(false, |lt| lt.eq_ignore_ascii_case(t)),
                })
            })
            .cloned()
            .collect())
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        self.state()
            .views
            .get(&(to, data))
            .cloned()
            .ok_or_else(|| Error::RpcResponse {
                code: 3,
                message: "execution reverted".into(),
            })
    }

    async fn send_transaction(&self, to: Address, data: Vec<u8>) -> Result<TxHash> {
        let from = self.signer.ok_or(Error::NoSigner)?;
        let mut state = self.state();
        if let Some(message) = &state.send_error {
            return Err(Error::RpcResponse {
                code: -32000,
                message: message.clone(),
            });
        }
        let mut preimage = data.clone();
        preimage.extend_from_slice(&(state.sent.len() as u64).to_be_bytes());
        state.sent.push(SentTransaction { from, to, data });
        Ok(format!("0x{}", hex::encode(keccak256(&preimage))))
    }

    async fn sign_message(&self, message: &str) -> Result<String> {
        let signer = self.signer.ok_or(Error::NoSigner)?;
        // deterministic per (signer, message), shaped like r || s || v
        let r = keccak256(&[signer.0.as_slice(), message.as_bytes()].concat());
        let s = keccak256(&r);
        Ok(format!("0x{}{}1b", hex::encode(r), hex::encode(s)))
    }

    fn signer(&self) -> Option<Address> {
        self.signer
    }
}
