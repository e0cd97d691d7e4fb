// Dispatcher property tests
//
// Random workloads must never exceed the configured ceiling, must admit in
// submission order and must settle every operation.
//
// Tasks may begin running in any order once admitted, so FIFO admission is
// checked through its consequence: operation `i` can only start after at
// least `i + 1 - max_concurrent` earlier operations have finished.

use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use booking_session::dispatcher::{DispatcherConfig, RequestDispatcher};
use booking_session::error::DispatchError;

struct Observed {
    peak: usize,
    early_starts: usize,
    results: Vec<Result<usize, DispatchError>>,
}

fn run_workload(max_concurrent: usize, durations: &[u64]) -> Observed {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let dispatcher = RequestDispatcher::new(DispatcherConfig::new(max_concurrent, 2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let early_starts = Arc::new(AtomicUsize::new(0));

        let pending: Vec<_> = durations
            .iter()
            .enumerate()
            .map(|(i, &millis)| {
                let running = running.clone();
                let peak = peak.clone();
                let finished = finished.clone();
                let early_starts = early_starts.clone();
                dispatcher.submit(move || async move {
                    if finished.load(Ordering::SeqCst) + max_concurrent < i + 1 {
                        early_starts.fetch_add(1, Ordering::SeqCst);
                    }
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    finished.fetch_add(1, Ordering::SeqCst);
                    i
                })
            })
            .collect();

        let results = futures::future::join_all(pending).await;
        assert_eq!(dispatcher.queued(), 0);

        Observed {
            peak: peak.load(Ordering::SeqCst),
            early_starts: early_starts.load(Ordering::SeqCst),
            results,
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_ceiling_order_and_completion(
        max_concurrent in 1usize..5,
        durations in prop::collection::vec(0u64..8, 1..16),
    ) {
        let observed = run_workload(max_concurrent, &durations);

        prop_assert!(observed.peak <= max_concurrent);
        prop_assert!(observed.peak >= 1);

        prop_assert_eq!(observed.early_starts, 0);

        let expected: Vec<usize> = (0..durations.len()).collect();
        let values: Vec<usize> = observed
            .results
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        prop_assert_eq!(values, expected);
    }
}
