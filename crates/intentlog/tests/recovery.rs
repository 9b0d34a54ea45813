//! Crash-recovery scenarios: claim, check, torn tails, replay markers.

mod common;

use std::sync::Arc;

use common::{Harness, Replayer};
use intentlog::{HeaderFlags, Options, Pool as _, WriteState};

#[test]
fn torn_tail_replays_only_the_stable_prefix() {
    // Without cache flushes nothing becomes stable on its own; the test
    // controls exactly which blocks survive the crash.
    let opts = Options {
        nocacheflush: true,
        ..Options::default()
    };
    let h = Harness::new(opts);
    h.prime();

    for (i, object) in (11..=13u64).enumerate() {
        h.write(object, 0, &[i as u8 + 1; 128], WriteState::Copied, true);
        h.log.commit(0);
    }
    // Blocks written so far reach stable storage...
    h.pool.flush_all();
    // ...but the next one stays in the volatile cache.
    h.write(14, 0, &[0xff; 128], WriteState::Copied, true);
    h.log.commit(0);

    let h = h.crash_and_recover();
    assert_eq!(h.replayed(11).as_deref(), Some(&[1; 128][..]));
    assert_eq!(h.replayed(12).as_deref(), Some(&[2; 128][..]));
    assert_eq!(h.replayed(13).as_deref(), Some(&[3; 128][..]));
    // The torn tail is the logical end of the chain.
    assert_eq!(h.replayed(14), None);
}

#[test]
fn claim_records_bounds_and_marks_blocks() {
    let h = Harness::new(Options::default());
    h.prime();
    h.write(1, 0, &[7; 64], WriteState::Copied, true);
    h.log.commit(0);

    let Harness {
        pool,
        log,
        persisted,
        ..
    } = h;
    drop(log);
    pool.crash();

    let header = *persisted.lock().unwrap();
    let h2 = Harness::with_pool(Arc::clone(&pool), header, Options::default());

    h2.log.check_log_chain().expect("chain is intact");

    let txg = pool.tx_assign();
    h2.log.claim(txg).expect("claim");
    pool.tx_commit(txg);

    let zh = h2.log.header();
    assert!(zh.flags.contains(HeaderFlags::REPLAY_NEEDED));
    assert!(zh.flags.contains(HeaderFlags::CLAIM_LR_SEQ_VALID));
    assert!(zh.claim_txg > 0);
    assert!(zh.claim_lr_seq >= 1);
    assert!(pool.claimed_count() > 0);
}

#[test]
fn replay_skips_already_replayed_records() {
    let h = Harness::new(Options::default());
    h.prime();
    // Both land in the same burst: record seqs 1 and 2.
    h.write(21, 0, &[0x21; 64], WriteState::Copied, true);
    h.write(22, 0, &[0x22; 64], WriteState::Copied, true);
    h.log.commit(0);

    let Harness {
        pool,
        log,
        persisted,
        ..
    } = h;
    drop(log);
    pool.crash();

    // Pretend the first record had already been applied before the
    // crash: the persisted marker points past it.
    let mut header = *persisted.lock().unwrap();
    header.replay_seq = 1;

    let h2 = Harness::with_pool(Arc::clone(&pool), header, Options::default());
    let txg = pool.tx_assign();
    h2.log.claim(txg).expect("claim");
    pool.tx_commit(txg);

    let mut replayer = Replayer {
        fs: Arc::clone(&h2.fs),
        pool: Arc::clone(&h2.pool),
        log: h2.log.clone(),
        last_seq: 0,
        fail: 0,
    };
    assert!(h2.log.replay(&mut replayer));

    assert_eq!(h2.replayed(21), None);
    assert_eq!(h2.replayed(22).as_deref(), Some(&[0x22; 64][..]));
}

#[test]
fn replay_retries_a_failing_handler_once() {
    let h = Harness::new(Options::default());
    h.prime();
    h.write(31, 0, &[0x31; 64], WriteState::Copied, true);
    h.log.commit(0);

    let Harness {
        pool,
        log,
        persisted,
        ..
    } = h;
    drop(log);
    pool.crash();

    let header = *persisted.lock().unwrap();
    let h2 = Harness::with_pool(Arc::clone(&pool), header, Options::default());
    let txg = pool.tx_assign();
    h2.log.claim(txg).expect("claim");
    pool.tx_commit(txg);

    let mut replayer = Replayer {
        fs: Arc::clone(&h2.fs),
        pool: Arc::clone(&h2.pool),
        log: h2.log.clone(),
        last_seq: 0,
        // One transient failure; the engine forces a checkpoint sync and
        // retries.
        fail: 1,
    };
    assert!(h2.log.replay(&mut replayer));
    assert_eq!(h2.replayed(31).as_deref(), Some(&[0x31; 64][..]));
}

#[test]
fn checkpointed_import_clears_unclaimed_chain() {
    let h = Harness::new(Options::default());
    h.prime();
    h.write(41, 0, &[0x41; 64], WriteState::Copied, true);
    h.log.commit(0);

    let Harness {
        pool,
        log,
        persisted,
        ..
    } = h;
    drop(log);
    pool.crash();

    // The imported uberblock is a checkpoint and this chain was never
    // claimed: its blocks may alias rewritten data, so they are cleared.
    pool.set_checkpoint_txg(1);

    let header = *persisted.lock().unwrap();
    let h2 = Harness::with_pool(Arc::clone(&pool), header, Options::default());
    let txg = pool.tx_assign();
    h2.log.claim(txg).expect("claim clears");
    pool.tx_commit(txg);

    let zh = h2.log.header();
    assert!(zh.log.is_hole());
    assert!(!zh.flags.contains(HeaderFlags::REPLAY_NEEDED));
    assert_eq!(pool.claimed_count(), 0);

    let mut replayer = Replayer {
        fs: Arc::clone(&h2.fs),
        pool: Arc::clone(&h2.pool),
        log: h2.log.clone(),
        last_seq: 0,
        fail: 0,
    };
    // Nothing to replay.
    assert!(!h2.log.replay(&mut replayer));
    assert_eq!(h2.replayed(41), None);
}

#[test]
fn replay_destroys_the_chain() {
    let h = Harness::new(Options::default());
    h.prime();
    h.write(51, 0, &[0x51; 64], WriteState::Copied, true);
    h.log.commit(0);

    let freed_before = h.pool.freed_count();
    let h = h.crash_and_recover();

    assert_eq!(h.replayed(51).as_deref(), Some(&[0x51; 64][..]));
    // The chain's blocks were freed by the post-replay destroy...
    assert!(h.pool.freed_count() > freed_before);
    // ...and the header no longer points anywhere.
    assert!(h.log.header().log.is_hole());
}
