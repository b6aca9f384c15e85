#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use TaskBlaster::data_model::WorkItem;
    use TaskBlaster::error::{ExecutorError, TaskError};
    use TaskBlaster::pool::WorkerPool;
    use TaskBlaster::processor::Processor;

    fn square() -> Processor<i64, i64> {
        Processor::blocking(|x: i64| Ok(x * x))
    }

    #[test]
    fn test_every_item_gets_one_result() {
        let pool = WorkerPool::start(4, square(), None, None).unwrap();
        pool.submit_all(WorkItem::sequence(0..50));
        let results = pool.shutdown();

        assert_eq!(results.len(), 50);
        let ids: HashSet<u64> = results.iter().map(|r| r.item_id).collect();
        assert_eq!(ids.len(), 50);
        for result in &results {
            assert!(result.success);
            let x = result.item_id as i64;
            assert_eq!(result.value, Some(x * x));
            assert!(result.worker_id.starts_with("thread-"));
        }
    }

    #[test]
    fn test_failures_do_not_stop_workers() {
        let processor = Processor::blocking(|x: i64| {
            if x % 3 == 0 {
                Err(TaskError::failed(format!("{} is divisible by three", x)))
            } else {
                Ok(x)
            }
        });
        let pool = WorkerPool::start(3, processor, None, None).unwrap();
        pool.submit_all(WorkItem::sequence(0..10));
        let results = pool.shutdown();

        assert_eq!(results.len(), 10);
        assert_eq!(results.iter().filter(|r| !r.success).count(), 4);
        for failed in results.iter().filter(|r| !r.success) {
            assert!(failed.value.is_none());
            assert!(failed.error.as_deref().unwrap().contains("divisible"));
        }
    }

    #[test]
    fn test_panics_become_item_failures() {
        let processor = Processor::blocking(|x: i64| {
            if x == 2 {
                panic!("boom on {}", x);
            }
            Ok(x)
        });
        let pool = WorkerPool::start(2, processor, None, None).unwrap();
        pool.submit_all(WorkItem::sequence(0..5));
        let results = pool.shutdown();

        assert_eq!(results.len(), 5);
        let panicked = results.iter().find(|r| r.item_id == 2).unwrap();
        assert!(!panicked.success);
        assert!(panicked.error.as_deref().unwrap().contains("boom on 2"));
    }

    #[test]
    fn test_never_more_than_n_workers_busy() {
        let busy = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let processor = {
            let busy = Arc::clone(&busy);
            let peak = Arc::clone(&peak);
            Processor::blocking(move |x: i64| {
                let now = busy.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                busy.fetch_sub(1, Ordering::SeqCst);
                Ok(x)
            })
        };
        let pool = WorkerPool::start(3, processor, None, None).unwrap();
        pool.submit_all(WorkItem::sequence(0..24));
        let results = pool.shutdown();

        assert_eq!(results.len(), 24);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_late_answers_are_reported_as_timeout() {
        let processor = Processor::blocking(|ms: u64| {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(ms)
        });
        let pool = WorkerPool::start(2, processor, Some(Duration::from_millis(50)), None).unwrap();
        pool.submit(WorkItem::new(0, 5));
        pool.submit(WorkItem::new(1, 200));
        let results = pool.shutdown();

        let fast = results.iter().find(|r| r.item_id == 0).unwrap();
        let slow = results.iter().find(|r| r.item_id == 1).unwrap();
        assert!(fast.success);
        assert!(!slow.success);
        assert_eq!(slow.error.as_deref(), Some("timeout"));
        assert!(slow.value.is_none());
    }

    #[test]
    fn test_cancelled_items_still_have_results() {
        let token = CancellationToken::new();
        token.cancel();
        let pool = WorkerPool::start(2, square(), None, Some(token)).unwrap();
        pool.submit_all(WorkItem::sequence(0..6));
        let results = pool.shutdown();

        assert_eq!(results.len(), 6);
        assert!(results
            .iter()
            .all(|r| r.error.as_deref() == Some("cancelled")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_processor_on_threads() {
        let processor = Processor::from_async(|x: i64| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(x + 1)
        });
        let pool = WorkerPool::start(2, processor, None, None).unwrap();
        pool.submit_all(WorkItem::sequence(0..6));
        let results = tokio::task::spawn_blocking(move || pool.shutdown())
            .await
            .unwrap();
        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.success));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            WorkerPool::start(0, square(), None, None),
            Err(ExecutorError::ConfigError(_))
        ));
    }

    #[test]
    fn test_remote_processor_rejected() {
        let remote: Processor<i64, i64> = Processor::remote("square");
        assert!(matches!(
            WorkerPool::start(2, remote, None, None),
            Err(ExecutorError::ConfigError(_))
        ));
    }

    #[test]
    fn test_running_workers_idle_after_drain() {
        let pool = WorkerPool::start(2, square(), None, None).unwrap();
        pool.submit_all(WorkItem::sequence(0..4));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.running_workers(), 0);
        assert_eq!(pool.shutdown().len(), 4);
    }
}
