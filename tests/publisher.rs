//! End-to-end behavior of `TxManager::send` against an in-memory chain

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{candidate, init_tracing, manager, test_config, wait_for_broadcasts, FakeChain};
use op_txmgr::{AbortReason, BroadcastOutcome, TxMgrConfig, TxMgrError};

#[tokio::test(start_paused = true)]
async fn test_send_returns_receipt_once_mined() {
    init_tracing();
    let chain = Arc::new(FakeChain::new());
    chain.set_auto_mine(true);
    let mgr = manager(&chain, test_config());

    let receipt = mgr
        .send(&CancellationToken::new(), candidate())
        .await
        .unwrap();

    let broadcasts = chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(receipt.tx_hash, broadcasts[0].hash);
    assert!(receipt.status);
    assert_eq!(broadcasts[0].nonce, 0);
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_confirmation_depth() {
    let chain = Arc::new(FakeChain::new());
    chain.set_auto_mine(true);
    let config = TxMgrConfig {
        num_confirmations: 3,
        ..test_config()
    };
    let mgr = manager(&chain, config);

    let send = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.send(&CancellationToken::new(), candidate()).await }
    });

    wait_for_broadcasts(&chain, 1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!send.is_finished());

    // included block plus two more
    chain.advance(2);
    let receipt = send.await.unwrap().unwrap();
    assert_eq!(receipt.block_number + 2, chain.height());
    assert_eq!(chain.broadcast_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_bumps_fees_until_mined() {
    let chain = Arc::new(FakeChain::new());
    let mgr = manager(&chain, test_config());

    let send = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.send(&CancellationToken::new(), candidate()).await }
    });

    wait_for_broadcasts(&chain, 2).await;
    chain.mine_latest();
    let receipt = send.await.unwrap().unwrap();

    let broadcasts = chain.broadcasts();
    assert_eq!(broadcasts.len(), 2);
    assert_eq!(receipt.tx_hash, broadcasts[1].hash);
    assert_ne!(broadcasts[0].hash, broadcasts[1].hash);
    assert_eq!(broadcasts[0].nonce, broadcasts[1].nonce);
    assert!(broadcasts[1].tip * 100 >= broadcasts[0].tip * 110);
    assert!(broadcasts[1].fee_cap * 100 >= broadcasts[0].fee_cap * 110);
}

#[tokio::test(start_paused = true)]
async fn test_underpriced_first_broadcast_bumps_immediately() {
    let chain = Arc::new(FakeChain::new());
    chain.set_auto_mine(true);
    chain.reply_with([BroadcastOutcome::Underpriced]);
    let mgr = manager(&chain, test_config());

    let started = Instant::now();
    let receipt = mgr
        .send(&CancellationToken::new(), candidate())
        .await
        .unwrap();

    let broadcasts = chain.broadcasts();
    assert_eq!(broadcasts.len(), 2);
    assert_eq!(receipt.tx_hash, broadcasts[1].hash);
    assert!(broadcasts[1].fee_cap > broadcasts[0].fee_cap);
    // no resubmission tick was needed
    assert!(started.elapsed() < Duration::from_millis(10_000));
}

#[tokio::test(start_paused = true)]
async fn test_nonce_too_low_streak_abandons_after_threshold() {
    let chain = Arc::new(FakeChain::new());
    chain.reply_with(vec![BroadcastOutcome::NonceTooLow; 3]);
    let mgr = manager(&chain, test_config());

    let err = mgr
        .send(&CancellationToken::new(), candidate())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        TxMgrError::Abandoned {
            reason: AbortReason::NonceTooLow { count: 3 }
        }
    );
    assert_eq!(chain.broadcast_count(), 3);

    // the failed send forgot its nonce, so the next one re-reads it
    chain.set_auto_mine(true);
    mgr.send(&CancellationToken::new(), candidate())
        .await
        .unwrap();
    assert_eq!(chain.broadcasts()[3].nonce, 0);
}

#[tokio::test(start_paused = true)]
async fn test_nonce_too_low_for_replacement_of_mined_original() {
    let chain = Arc::new(FakeChain::new());
    let mgr = manager(&chain, test_config());

    let send = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.send(&CancellationToken::new(), candidate()).await }
    });

    wait_for_broadcasts(&chain, 1).await;
    chain.reply_with([BroadcastOutcome::NonceTooLow]);
    wait_for_broadcasts(&chain, 2).await;

    // the original made it in, which is why the replacement was refused
    let original = chain.broadcasts()[0].hash;
    chain.mine(original);

    let receipt = send.await.unwrap().unwrap();
    assert_eq!(receipt.tx_hash, original);
    assert_eq!(chain.broadcast_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reorged_transaction_is_republished() {
    let chain = Arc::new(FakeChain::new());
    chain.set_auto_mine(true);
    let config = TxMgrConfig {
        num_confirmations: 3,
        ..test_config()
    };
    let mgr = manager(&chain, config);

    let send = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.send(&CancellationToken::new(), candidate()).await }
    });

    wait_for_broadcasts(&chain, 1).await;
    // let one poll observe the inclusion, then drop the block
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    chain.reorg_out(chain.broadcasts()[0].hash);

    wait_for_broadcasts(&chain, 2).await;
    chain.advance(2);

    let receipt = send.await.unwrap().unwrap();
    let broadcasts = chain.broadcasts();
    assert_eq!(broadcasts.len(), 2);
    assert_eq!(receipt.tx_hash, broadcasts[1].hash);
}

#[tokio::test(start_paused = true)]
async fn test_not_in_mempool_abandons_after_timeout() {
    let chain = Arc::new(FakeChain::new());
    chain.reply_with(
        std::iter::repeat(BroadcastOutcome::Rejected("connection refused".to_string())).take(16),
    );
    let mgr = manager(&chain, test_config());

    let started = Instant::now();
    let err = mgr
        .send(&CancellationToken::new(), candidate())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        TxMgrError::Abandoned {
            reason: AbortReason::NotInMempool {
                timeout: Duration::from_secs(30)
            }
        }
    );
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(chain.broadcast_count() >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_reverted_transaction_returns_receipt() {
    let chain = Arc::new(FakeChain::new());
    chain.set_auto_mine(true);
    chain.set_reverting(true);
    let mgr = manager(&chain, test_config());

    let receipt = mgr
        .send(&CancellationToken::new(), candidate())
        .await
        .unwrap();
    assert!(!receipt.status);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_returns_promptly() {
    let chain = Arc::new(FakeChain::new());
    let mgr = manager(&chain, test_config());
    let ctx = CancellationToken::new();

    let send = tokio::spawn({
        let mgr = mgr.clone();
        let ctx = ctx.clone();
        async move { mgr.send(&ctx, candidate()).await }
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    let cancelled_at = Instant::now();
    ctx.cancel();

    let err = send.await.unwrap().unwrap_err();
    assert_eq!(err, TxMgrError::Cancelled);
    assert!(cancelled_at.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_send_timeout_bounds_the_whole_send() {
    let chain = Arc::new(FakeChain::new());
    let config = TxMgrConfig {
        tx_send_timeout_ms: 15_000,
        ..test_config()
    };
    let mgr = manager(&chain, config);

    let err = mgr
        .send(&CancellationToken::new(), candidate())
        .await
        .unwrap_err();
    assert_eq!(err, TxMgrError::SendTimeout);
    // initial broadcast plus one bump before the deadline
    assert_eq!(chain.broadcast_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_resubmission() {
    let chain = Arc::new(FakeChain::new());
    let mgr = manager(&chain, test_config());

    let send = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.send(&CancellationToken::new(), candidate()).await }
    });

    wait_for_broadcasts(&chain, 1).await;
    mgr.close();

    let err = send.await.unwrap().unwrap_err();
    assert_eq!(err, TxMgrError::Closed);
    assert_eq!(chain.broadcast_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sends_use_distinct_nonces() {
    let chain = Arc::new(FakeChain::new());
    chain.set_auto_mine(true);
    let mgr = manager(&chain, test_config());
    let ctx = CancellationToken::new();

    let results = futures::future::join_all((0..3).map(|_| mgr.send(&ctx, candidate()))).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let mut nonces: Vec<u64> = chain.broadcasts().iter().map(|b| b.nonce).collect();
    nonces.sort_unstable();
    assert_eq!(nonces, vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_receipt_lookups_do_not_starve_fee_bumps() {
    let chain = Arc::new(FakeChain::new());
    // every lookup outlasts the one second poll interval
    chain.set_receipt_delay(Duration::from_millis(1_500));
    let mgr = manager(&chain, test_config());

    let send = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.send(&CancellationToken::new(), candidate()).await }
    });

    tokio::time::sleep(Duration::from_secs(55)).await;
    // initial broadcast plus a bump every 10s
    assert!(chain.broadcast_count() >= 5);

    let newest = chain.broadcasts().last().unwrap().hash;
    chain.mine(newest);
    let receipt = send.await.unwrap().unwrap();
    assert_eq!(receipt.tx_hash, newest);
}

#[tokio::test(start_paused = true)]
async fn test_transient_rpc_errors_in_wait_loop_are_survived() {
    let chain = Arc::new(FakeChain::new());
    let mgr = manager(&chain, test_config());
    let started = Instant::now();

    let send = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.send(&CancellationToken::new(), candidate()).await }
    });

    wait_for_broadcasts(&chain, 1).await;
    chain.fail_receipts(3);
    chain.fail_tips(1);

    // the first bump fails on the tip lookup and is retried a tick later
    wait_for_broadcasts(&chain, 2).await;
    assert!(started.elapsed() >= Duration::from_secs(20));

    chain.fail_headers(2);
    chain.mine_latest();
    let receipt = send.await.unwrap().unwrap();
    assert_eq!(receipt.tx_hash, chain.broadcasts()[1].hash);
    assert_eq!(chain.broadcast_count(), 2);
}
