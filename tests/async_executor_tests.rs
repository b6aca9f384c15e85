#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use TaskBlaster::data_model::WorkItem;
    use TaskBlaster::error::TaskError;
    use TaskBlaster::executor::AsyncExecutor;
    use TaskBlaster::processor::Processor;

    // Async processor that tracks how many calls are in flight.
    fn tracked_sleep(
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> Processor<u64, u64> {
        Processor::from_async(move |ms: u64| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TaskError>(ms)
            }
        })
    }

    #[tokio::test]
    async fn test_admission_gate_caps_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let processor = tracked_sleep(Arc::clone(&in_flight), Arc::clone(&peak));
        let executor = AsyncExecutor::new(5, None).unwrap();

        let results = executor
            .run(WorkItem::sequence(vec![10u64; 40]), &processor, None)
            .await;

        assert_eq!(results.len(), 40);
        assert!(results.iter().all(|r| r.success));
        assert!(peak.load(Ordering::SeqCst) <= 5, "peak was {}", peak.load(Ordering::SeqCst));
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_io_bound_items_overlap() {
        let processor = Processor::from_async(|ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, TaskError>(ms)
        });
        let executor = AsyncExecutor::new(20, None).unwrap();
        let started = Instant::now();
        let results = executor
            .run(WorkItem::sequence(vec![100u64; 20]), &processor, None)
            .await;
        assert_eq!(results.len(), 20);
        // Twenty 100ms waits side by side, not back to back.
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_timeout_fails_only_the_slow_item() {
        let processor = Processor::from_async(|ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, TaskError>(ms)
        });
        let executor = AsyncExecutor::new(4, Some(Duration::from_millis(100))).unwrap();
        let items = vec![
            WorkItem::new(0, 5),
            WorkItem::new(1, 2_000),
            WorkItem::new(2, 5),
        ];
        let started = Instant::now();
        let results = executor.run(items, &processor, None).await;

        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(results.len(), 3);
        let slow = results.iter().find(|r| r.item_id == 1).unwrap();
        assert_eq!(slow.error.as_deref(), Some("timeout"));
        assert_eq!(results.iter().filter(|r| r.success).count(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_resolves_every_item() {
        let processor = Processor::from_async(|ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, TaskError>(ms)
        });
        let executor = AsyncExecutor::new(2, None).unwrap();
        let token = executor.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            token.cancel();
        });

        let mut items = WorkItem::sequence(vec![10u64; 4]);
        items.extend((4..10).map(|id| WorkItem::new(id, 5_000)));
        let started = Instant::now();
        let results = executor.run(items, &processor, None).await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(results.len(), 10);
        let cancelled = results
            .iter()
            .filter(|r| r.error.as_deref() == Some("cancelled"))
            .count();
        assert_eq!(cancelled, 6);
        assert_eq!(results.iter().filter(|r| r.success).count(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_processor_is_bridged() {
        let processor = Processor::blocking(|x: u64| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(x * 2)
        });
        let executor = AsyncExecutor::new(8, None).unwrap();
        let started = Instant::now();
        let results = executor
            .run(WorkItem::sequence(0..16u64), &processor, None)
            .await;

        assert_eq!(results.len(), 16);
        for result in &results {
            assert_eq!(result.value, Some(result.item_id * 2));
        }
        // Blocking calls ran on the blocking pool, eight at a time.
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_blocking_calls_keep_their_slot() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let processor = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            Processor::blocking(move |ms: u64| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(ms));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(ms)
            })
        };
        let executor = AsyncExecutor::new(2, Some(Duration::from_millis(50))).unwrap();
        let results = executor
            .run(WorkItem::sequence(vec![300u64; 6]), &processor, None)
            .await;

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.error.as_deref() == Some("timeout")));
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak was {}", peak);
    }

    #[tokio::test]
    async fn test_errors_and_panics_are_isolated() {
        let processor = Processor::from_async(|x: u64| async move {
            match x {
                3 => Err(TaskError::failed("bad input")),
                5 => panic!("exploded"),
                _ => Ok(x),
            }
        });
        let executor = AsyncExecutor::new(3, None).unwrap();
        let results = executor
            .run(WorkItem::sequence(0..8u64), &processor, None)
            .await;

        assert_eq!(results.len(), 8);
        let by_id = |id: u64| results.iter().find(|r| r.item_id == id).unwrap();
        assert_eq!(by_id(3).error.as_deref(), Some("bad input"));
        assert!(by_id(5).error.as_deref().unwrap().contains("exploded"));
        assert_eq!(results.iter().filter(|r| r.success).count(), 6);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(AsyncExecutor::new(0, None).is_err());
    }
}
