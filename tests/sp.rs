use std::sync::{Arc, Mutex};

use mpc_engine::channel::SimpleChannel;
use mpc_engine::config::Config;
use mpc_engine::sp::{SpProvider, SpWidth};
use mpc_engine::stats::{Phase, RunTimeStats};

/// Runs one party's presetup + setup and returns its provider.
async fn run_party(
    channel: SimpleChannel,
    my_id: usize,
    parties: usize,
    counts: [usize; 5],
    batch: usize,
) -> SpProvider {
    let config = Config::new(my_id, parties)
        .unwrap()
        .with_sp_batch_size(batch)
        .unwrap();
    let _ = tracing_subscriber::fmt()
        .with_max_level(config.log_filter())
        .try_init();
    let stats = Arc::new(Mutex::new(RunTimeStats::default()));
    let mut sp = SpProvider::new(&config, stats);
    let [n8, n16, n32, n64, n128] = counts;
    sp.request_sps::<u8>(n8);
    sp.request_sps::<u16>(n16);
    sp.request_sps::<u32>(n32);
    sp.request_sps::<u64>(n64);
    sp.request_sps::<u128>(n128);
    sp.pre_setup().unwrap();
    sp.setup(&channel).await.unwrap();
    sp
}

/// Simulates a full session, one task per party.
async fn simulate(parties: usize, counts: [usize; 5], batch: usize) -> Vec<SpProvider> {
    let channels = SimpleChannel::channels(parties);
    let mut handles = Vec::new();
    for (my_id, channel) in channels.into_iter().enumerate() {
        handles.push(tokio::spawn(run_party(
            channel, my_id, parties, counts, batch,
        )));
    }
    let mut providers = Vec::new();
    for handle in handles {
        providers.push(handle.await.unwrap());
    }
    providers
}

/// Checks that for every pair index, the parties' shares sum to `(A, A·A)`
/// modulo `2^W`.
fn check_sums<R: SpWidth>(providers: &[SpProvider], expected_len: usize) {
    for provider in providers {
        let sps = provider.sps::<R>().unwrap();
        assert_eq!(sps.a.len(), expected_len);
        assert_eq!(sps.c.len(), expected_len);
    }
    for i in 0..expected_len {
        let mut a_sum = R::zero();
        let mut c_sum = R::zero();
        for provider in providers {
            let sps = provider.sps::<R>().unwrap();
            a_sum = a_sum.wrapping_add(&sps.a[i]);
            c_sum = c_sum.wrapping_add(&sps.c[i]);
        }
        assert_eq!(c_sum, a_sum.wrapping_mul(&a_sum));
    }
}

#[tokio::test]
async fn two_parties_share_squares_of_random_values() {
    let providers = simulate(2, [0, 0, 4, 0, 0], 10_000).await;
    check_sums::<u32>(&providers, 4);
    // Widths that were never requested stay empty but are accessible.
    check_sums::<u8>(&providers, 0);
    check_sums::<u128>(&providers, 0);
}

#[tokio::test]
async fn three_parties_share_squares_at_mixed_widths() {
    let providers = simulate(3, [1, 0, 2, 0, 1], 10_000).await;
    check_sums::<u8>(&providers, 1);
    check_sums::<u16>(&providers, 0);
    check_sums::<u32>(&providers, 2);
    check_sums::<u64>(&providers, 0);
    check_sums::<u128>(&providers, 1);
}

#[tokio::test]
async fn five_parties_share_squares_of_random_values() {
    let providers = simulate(5, [0, 3, 0, 2, 0], 10_000).await;
    check_sums::<u16>(&providers, 3);
    check_sums::<u64>(&providers, 2);
}

#[tokio::test]
async fn small_batches_split_requests_and_preserve_order() {
    // With a batch bound of 2, five pairs need three OT batches per peer,
    // which only line up if both sides consume their handles in
    // registration order.
    let providers = simulate(2, [5, 0, 0, 3, 0], 2).await;
    check_sums::<u8>(&providers, 5);
    check_sums::<u64>(&providers, 3);
}

#[tokio::test]
async fn completion_wakes_waiting_tasks() {
    let parties = 2;
    let channels = SimpleChannel::channels(parties);
    let mut handles = Vec::new();
    for (my_id, channel) in channels.into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let config = Config::new(my_id, parties).unwrap();
            let stats = Arc::new(Mutex::new(RunTimeStats::default()));
            let mut sp = SpProvider::new(&config, Arc::clone(&stats));
            sp.request_sps::<u32>(1);
            sp.pre_setup().unwrap();
            let mut completion = sp.completion();
            assert!(!completion.is_finished());
            let waiter = tokio::spawn(async move {
                completion.wait().await.unwrap();
                completion.is_finished()
            });
            sp.setup(&channel).await.unwrap();
            assert!(waiter.await.unwrap());
            (sp, stats)
        }));
    }
    for handle in handles {
        let (sp, stats) = handle.await.unwrap();
        assert!(sp.completion().is_finished());
        assert!(sp.sps::<u32>().is_ok());
        let stats = stats.lock().unwrap();
        assert!(stats.duration(Phase::SpPresetup).is_some());
        assert!(stats.duration(Phase::SpSetup).is_some());
    }
}
