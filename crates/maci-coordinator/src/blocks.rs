//! timestamp to block number resolution
//!
//! future timestamps are extrapolated from the head using the average block
//! time. past timestamps are binary searched inside a window sized from the
//! same estimate, returning the last block at or before the timestamp.

use crate::error::Result;
use crate::rpc::{Block, BlockTag, ChainProvider};

/// minimum number of extra blocks searched below the estimate
const MIN_SEARCH_MARGIN: u64 = 50;

pub async fn block_at_timestamp(
    provider: &dyn ChainProvider,
    timestamp: u64,
    seconds_per_block: u64,
) -> Result<u64> {
    let latest = provider.get_block(BlockTag::Latest).await?;
    if timestamp > latest.timestamp {
        return Ok(future_block_at_timestamp(&latest, timestamp, seconds_per_block));
    }
    past_block_at_timestamp(provider, &latest, timestamp, seconds_per_block).await
}

/// estimate of the block that will be produced at `timestamp`
pub fn future_block_at_timestamp(latest: &Block, timestamp: u64, seconds_per_block: u64) -> u64 {
    let diff = timestamp.saturating_sub(latest.timestamp);
    latest.number + diff.div_ceil(seconds_per_block.max(1))
}

/// last block with a timestamp not after `timestamp`
pub async fn past_block_at_timestamp(
    provider: &dyn ChainProvider,
    latest: &Block,
    timestamp: u64,
    seconds_per_block: u64,
) -> Result<u64> {
    let seconds_ago = latest.timestamp.saturating_sub(timestamp);
    let estimated_blocks_ago = seconds_ago / seconds_per_block.max(1);
    let margin = MIN_SEARCH_MARGIN.max(estimated_blocks_ago / 5);

    let mut start = latest
        .number
        .saturating_sub(estimated_blocks_ago.saturating_add(margin));
    let mut end = latest.number;

    while start <= end {
        let mid = start + (end - start) / 2;
        let block = provider.get_block(BlockTag::Number(mid)).await?;

        if block.timestamp == timestamp {
            return Ok(block.number);
        }
        if block.timestamp < timestamp {
            start = mid + 1;
        } else if mid == 0 {
            // even genesis is newer than the timestamp
            return Ok(0);
        } else {
            end = mid - 1;
        }
    }

    tracing::debug!(timestamp, block = end, "resolved past block");
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedChain;

    fn chain() -> SimulatedChain {
        // block n has timestamp 1_000 + 12n
        let chain = SimulatedChain::new(1_000, 12);
        chain.set_head(1_000);
        chain
    }

    #[tokio::test]
    async fn test_future_estimate_rounds_up() {
        let chain = chain();
        let head_time = chain.head_timestamp();
        let block = block_at_timestamp(&chain, head_time + 25, 12).await.unwrap();
        assert_eq!(block, 1_003);
        assert_eq!(chain.block_reads(), 1);
    }

    #[tokio::test]
    async fn test_past_exact_match() {
        let chain = chain();
        let block = block_at_timestamp(&chain, 1_000 + 12 * 900, 12).await.unwrap();
        assert_eq!(block, 900);
    }

    #[tokio::test]
    async fn test_past_between_blocks() {
        let chain = chain();
        // between block 900 and 901
        let block = block_at_timestamp(&chain, 1_000 + 12 * 900 + 5, 12).await.unwrap();
        assert_eq!(block, 900);
    }

    #[tokio::test]
    async fn test_head_timestamp_is_past() {
        let chain = chain();
        let head_time = chain.head_timestamp();
        assert_eq!(block_at_timestamp(&chain, head_time, 12).await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_before_genesis() {
        let chain = chain();
        assert_eq!(block_at_timestamp(&chain, 10, 12).await.unwrap(), 0);
    }

    #[test]
    fn test_future_with_zero_block_time() {
        let latest = Block {
            number: 5,
            timestamp: 100,
            hash: String::new(),
        };
        assert_eq!(future_block_at_timestamp(&latest, 103, 0), 8);
    }
}
