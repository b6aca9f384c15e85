#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use TaskBlaster::batch::{BatchFn, BatchProcessor};
    use TaskBlaster::config::run::{BatchConfig, ExecutorConfig};
    use TaskBlaster::data_model::{ResultSummary, WorkItem};
    use TaskBlaster::error::{ExecutorError, TaskError};
    use TaskBlaster::executor::{Executor, Strategy};
    use TaskBlaster::processor::Processor;

    fn squares() -> BatchFn<i64, i64> {
        BatchFn::PerItem(Processor::blocking(|x: i64| Ok(x * x)))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hundred_items_in_five_ordered_batches() {
        let batcher = BatchProcessor::new(20, 3).unwrap();
        let batches = batcher
            .run(WorkItem::sequence(1..=100i64), &squares())
            .await
            .unwrap();

        assert_eq!(batches.len(), 5);
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.batch_index, i);
            assert_eq!(batch.item_count, 20);
            assert_eq!(batch.results.len(), 20);
        }
        let values: Vec<i64> = batches
            .iter()
            .flat_map(|b| b.results.iter())
            .map(|r| r.value.unwrap())
            .collect();
        assert_eq!(values, (1..=100i64).map(|x| x * x).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_batch_count_rounds_up() {
        for (n, size, expected) in [(0usize, 4usize, 0usize), (7, 3, 3), (9, 3, 3), (1, 50, 1)] {
            let batcher = BatchProcessor::new(size, 2).unwrap();
            let items = WorkItem::sequence((0..n as i64).collect::<Vec<_>>());
            let batches = batcher.run(items, &squares()).await.unwrap();
            assert_eq!(batches.len(), expected, "n={} size={}", n, size);
            let total: usize = batches.iter().map(|b| b.item_count).sum();
            assert_eq!(total, n);
        }
    }

    #[tokio::test]
    async fn test_whole_batch_function() {
        let func: BatchFn<String, usize> = BatchFn::whole(|words: Vec<String>| {
            words.into_iter().map(|w| Ok(w.len())).collect()
        });
        let words = ["a", "bb", "ccc", "dddd", "eeeee"].map(String::from);
        let batcher = BatchProcessor::new(2, 2).unwrap();
        let batches = batcher
            .run(WorkItem::sequence(words), &func)
            .await
            .unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].item_count, 1);
        let lengths: Vec<usize> = batches
            .iter()
            .flat_map(|b| b.results.iter())
            .map(|r| r.value.unwrap())
            .collect();
        assert_eq!(lengths, vec![1, 2, 3, 4, 5]);
        assert!(batches[0].results.iter().all(|r| r.worker_id == "batch-0"));
    }

    #[tokio::test]
    async fn test_failing_batch_does_not_affect_others() {
        let func: BatchFn<i64, i64> = BatchFn::whole(|xs: Vec<i64>| {
            if xs.contains(&7) {
                panic!("seven is cursed");
            }
            if xs.contains(&12) {
                // One outcome short.
                return xs.iter().skip(1).map(|x| Ok(*x)).collect();
            }
            xs.into_iter().map(Ok).collect()
        });
        let batcher = BatchProcessor::new(5, 2).unwrap();
        let batches = batcher
            .run(WorkItem::sequence(0..20i64), &func)
            .await
            .unwrap();

        assert_eq!(batches.len(), 4);
        assert!(batches[0].results.iter().all(|r| r.success));
        assert!(batches[1]
            .results
            .iter()
            .all(|r| r.error.as_deref().unwrap().contains("seven is cursed")));
        assert!(batches[2]
            .results
            .iter()
            .all(|r| r.error.as_deref().unwrap().contains("returned 4 results for 5 items")));
        assert!(batches[3].results.iter().all(|r| r.success));

        let summary = ResultSummary::from_batches(&batches);
        assert_eq!(summary.total, 20);
        assert_eq!(summary.failed, 10);
    }

    #[tokio::test]
    async fn test_item_failures_stay_per_item() {
        let func = BatchFn::PerItem(Processor::blocking(|x: i64| {
            if x == 4 {
                Err(TaskError::failed("four"))
            } else {
                Ok(x)
            }
        }));
        let batcher = BatchProcessor::new(3, 1).unwrap();
        let batches = batcher
            .run(WorkItem::sequence(0..6i64), &func)
            .await
            .unwrap();

        let second = &batches[1];
        let ids: Vec<u64> = second.results.iter().map(|r| r.item_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert!(second.results[0].success);
        assert_eq!(second.results[1].error.as_deref(), Some("four"));
        assert!(second.results[2].success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_batches_are_capped() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let func: BatchFn<u32, u32> = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            BatchFn::whole(move |xs: Vec<u32>| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(40));
                running.fetch_sub(1, Ordering::SeqCst);
                xs.into_iter().map(Ok).collect()
            })
        };
        let batcher = BatchProcessor::from_config(&BatchConfig {
            batch_size: 2,
            max_concurrent_batches: 3,
        })
        .unwrap();
        let batches = batcher
            .run(WorkItem::sequence(0..24u32), &func)
            .await
            .unwrap();

        assert_eq!(batches.len(), 12);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak was {}", peak);
        assert!(peak >= 2, "batches never overlapped");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batches_on_thread_strategy() {
        let batcher = BatchProcessor::new(4, 2)
            .unwrap()
            .with_strategy(Executor::default(), Strategy::Thread { workers: 2 });
        let batches = batcher
            .run(WorkItem::sequence(0..10i64), &squares())
            .await
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert!(batches
            .iter()
            .flat_map(|b| b.results.iter())
            .all(|r| r.worker_id.starts_with("thread-")));
    }

    #[tokio::test]
    async fn test_closure_on_process_strategy_rejected_up_front() {
        let executor = Executor::new(ExecutorConfig::default()).unwrap();
        let batcher = BatchProcessor::new(4, 2)
            .unwrap()
            .with_strategy(executor, Strategy::Process { workers: 2 });
        let err = batcher
            .run(WorkItem::sequence(0..4i64), &squares())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ConfigError(_)));
    }
}
