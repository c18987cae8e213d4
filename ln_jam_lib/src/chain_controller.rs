// External Modules
use async_trait::async_trait;
use thiserror::Error;

// Refuse requests above this many blocks, nothing in an experiment needs more and a typo should not
// spin the regtest node for minutes
pub const MAX_BLOCKS_PER_CALL: u32 = 1000;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("refusing to mine {0} blocks (limit {})", MAX_BLOCKS_PER_CALL)]
    TooManyBlocks(u32),
}

/*
 * Something that can confirm on-chain transactions by mining blocks.
 */
#[async_trait]
pub trait BlockMiner: Send + Sync {
    async fn generate(&self, blocks: u32) -> Result<(), ChainError>;
}

/*
 * Mine blocks through `miner`, applying the sanity limit.
 */
pub async fn mine_blocks(miner: &dyn BlockMiner, blocks: u32) -> Result<(), ChainError> {
    if blocks > MAX_BLOCKS_PER_CALL {
        return Err(ChainError::TooManyBlocks(blocks));
    }

    log::debug!("mining {} blocks", blocks);
    miner.generate(blocks).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingMiner {
        mined: AtomicU32,
    }

    #[async_trait]
    impl BlockMiner for CountingMiner {
        async fn generate(&self, blocks: u32) -> Result<(), ChainError> {
            self.mined.fetch_add(blocks, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn mining_above_the_limit_is_refused() {
        let miner = CountingMiner::default();
        mine_blocks(&miner, 6).await.unwrap();
        mine_blocks(&miner, MAX_BLOCKS_PER_CALL).await.unwrap();

        let err = mine_blocks(&miner, MAX_BLOCKS_PER_CALL + 1).await.unwrap_err();
        assert!(matches!(err, ChainError::TooManyBlocks(1001)));
        assert_eq!(miner.mined.load(Ordering::SeqCst), 1006);
    }

    #[tokio::test]
    async fn simulated_network_mines_through_the_limit() {
        let network = crate::sim_network::tests::payment_network();
        let start = network.height().await;

        mine_blocks(&*network, 6).await.unwrap();
        assert!(mine_blocks(&*network, 5000).await.is_err());
        assert_eq!(network.height().await, start + 6);
    }
}
