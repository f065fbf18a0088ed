mod support;

use std::time::Duration;

use anyhow::Result;
use tempfile::tempdir;

use dpos_chain::chain::Chain;
use dpos_chain::errors::ChainError;
use dpos_chain::types::Block;

use support::{
    add_forging_delegate, base_config, build_block, delegate_keypair, InMemoryNetwork,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_chain_syncs_three_blocks_from_a_forward_peer() -> Result<()> {
    let dir = tempdir()?;
    let delegate = delegate_keypair();
    let mut config = base_config(dir.path(), 1, 120);
    config.constants.block_receipt_timeout = 0;
    add_forging_delegate(&mut config, &delegate);

    let network = InMemoryNetwork::new();
    let chain = Chain::new(config.clone(), network.clone())?;
    let handle = chain.handle();

    // Script the peer's chain: genesis plus three blocks in slots 1..3.
    let genesis = handle.get_last_block();
    let mut peer_chain = vec![genesis.clone()];
    let mut previous = genesis.clone();
    for (height, slot) in [(2u64, 1u64), (3, 2), (4, 3)] {
        let block = build_block(&config, &delegate, height, &previous.id, slot, Vec::new());
        peer_chain.push(block.clone());
        previous = block;
    }
    network.set_peer_chain(peer_chain);
    network.add_peer("forward-peer", "peer-broadhash", 4);

    assert_eq!(handle.get_last_block().header.height, 1);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(handle.is_stale());

    handle.sync_now().await?;
    assert!(!handle.syncing());
    assert_eq!(handle.get_last_block().header.height, 4);
    assert_eq!(handle.get_max_block_height()?, 4);
    assert_eq!(handle.get_last_block().id, previous.id);

    chain.cleanup(None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_is_a_no_op_without_forward_peers() -> Result<()> {
    let dir = tempdir()?;
    let mut config = base_config(dir.path(), 1, 60);
    add_forging_delegate(&mut config, &delegate_keypair());
    let network = InMemoryNetwork::new();
    let chain = Chain::new(config, network.clone())?;
    let handle = chain.handle();

    network.add_peer("behind-peer", "bh", 0);
    handle.sync_now().await?;
    assert_eq!(handle.get_last_block().header.height, 1);

    chain.cleanup(None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejoining_a_better_fork_rolls_back_to_the_common_block() -> Result<()> {
    let dir = tempdir()?;
    let delegate = delegate_keypair();
    let mut config = base_config(dir.path(), 1, 120);
    add_forging_delegate(&mut config, &delegate);
    let network = InMemoryNetwork::new();
    let chain = Chain::new(config.clone(), network.clone())?;
    let handle = chain.handle();

    // Our side forges one block; the peer's fork from genesis is longer.
    assert!(handle.forge_once().await?);
    assert_eq!(handle.get_last_block().header.height, 2);

    let genesis = handle.get_block_at_height(1)?.expect("genesis");
    let mut peer_chain = vec![genesis.clone()];
    let mut previous: Block = genesis;
    for (height, slot) in [(2u64, 1u64), (3, 2), (4, 3)] {
        let block = build_block(&config, &delegate, height, &previous.id, slot, Vec::new());
        peer_chain.push(block.clone());
        previous = block;
    }
    network.set_peer_chain(peer_chain);
    network.add_peer("forward-peer", "peer-broadhash", 4);

    handle.sync_now().await?;
    assert_eq!(handle.get_last_block().header.height, 4);
    assert_eq!(handle.get_last_block().id, previous.id);

    chain.cleanup(None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocks_common_enforces_the_candidate_limit() -> Result<()> {
    let dir = tempdir()?;
    let mut config = base_config(dir.path(), 1, 60);
    add_forging_delegate(&mut config, &delegate_keypair());
    let network = InMemoryNetwork::new();
    let chain = Chain::new(config, network.clone())?;
    let handle = chain.handle();

    let ids: Vec<String> = (0..1_001).map(|i| i.to_string()).collect();
    let err = handle
        .blocks_common("peer-1", &ids.join(","))
        .expect_err("over limit");
    assert!(matches!(err, ChainError::Validation(_)));
    assert_eq!(
        err.to_string(),
        "validation error: ids property contains more than 1000 values"
    );
    assert!(!network.penalties.read().is_empty());

    // Non-numeric ids are rejected too.
    let err = handle
        .blocks_common("peer-1", "123,not-a-number")
        .expect_err("bad id");
    assert!(matches!(err, ChainError::Validation(_)));

    // A valid probe finds the genesis block.
    let genesis = handle.get_last_block();
    let common = handle
        .blocks_common("peer-1", &format!("999,{}", genesis.id))?
        .expect("common block");
    assert_eq!(common.height, 1);
    assert_eq!(common.id, genesis.id);

    chain.cleanup(None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loader_pulls_the_shared_pool_from_a_forward_peer() -> Result<()> {
    let dir = tempdir()?;
    let delegate = delegate_keypair();
    let wallet = support::wallet_keypair();
    let mut config = base_config(dir.path(), 1, 60);
    add_forging_delegate(&mut config, &delegate);
    support::fund_account(&mut config, &wallet, 1_000_000);
    let network = InMemoryNetwork::new();

    let tx = support::signed_transfer(&wallet, &"aa".repeat(32), 50, 1_000, 7, None);
    network.shared_pool.write().push(tx.clone());
    network.add_peer("forward-peer", "bh", 10);

    let chain = Chain::new(config, network)?;
    let handle = chain.handle();

    // The startup load normally runs from Chain::start; drive it directly.
    handle.load_unconfirmed_now().await?;
    assert!(handle.pool_counts().verified == 1);
    assert_eq!(handle.get_transactions()[0].id, tx.id);

    chain.cleanup(None);
    Ok(())
}
