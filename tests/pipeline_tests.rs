#[cfg(test)]
mod tests {
    use async_stream::stream;
    use futures::stream as fstream;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio_stream::StreamExt;
    use tokio_util::sync::CancellationToken;
    use TaskBlaster::config::run::PipelineConfig;
    use TaskBlaster::data_model::WorkItem;
    use TaskBlaster::error::{ExecutorError, TaskError};
    use TaskBlaster::pipeline::ProducerConsumerPipeline;
    use TaskBlaster::pool::{ProcessPool, ProcessPoolConfig};
    use TaskBlaster::processor::Processor;

    fn config(consumers: usize, queue_capacity: usize, priority: bool) -> PipelineConfig {
        PipelineConfig {
            consumers,
            queue_capacity,
            priority,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_every_item_processed_in_emission_order() {
        let pipeline = ProducerConsumerPipeline::new(config(3, 4, false)).unwrap();
        let processor = Processor::from_async(|x: u64| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, TaskError>(x * 2)
        });
        let producer = fstream::iter(WorkItem::sequence(0..20u64));
        let output = pipeline.run(producer, &processor).await.unwrap();

        assert_eq!(output.results.len(), 20);
        let ids: Vec<u64> = output.results.iter().map(|r| r.item_id).collect();
        assert_eq!(ids, (0..20).collect::<Vec<u64>>());
        assert!(output.results.iter().all(|r| r.success));
        assert_eq!(output.stats.enqueued, 20);
        assert_eq!(output.stats.dequeued, 20);
        assert!(output.stats.high_water_mark <= 4);
        assert!(output
            .results
            .iter()
            .all(|r| r.worker_id.starts_with("consumer-")));
    }

    #[tokio::test]
    async fn test_priority_queue_serves_urgent_items_first() {
        // Single-threaded runtime: the producer fills the queue before the
        // consumer first runs.
        let pipeline = ProducerConsumerPipeline::new(config(1, 16, true)).unwrap();
        let processor = Processor::blocking(|x: u64| Ok(x));
        let items = vec![
            WorkItem::new(0, 0).with_priority(1),
            WorkItem::new(1, 1).with_priority(9),
            WorkItem::new(2, 2).with_priority(1),
            WorkItem::new(3, 3).with_priority(5),
            WorkItem::new(4, 4).with_priority(9),
        ];
        let output = pipeline
            .run(fstream::iter(items), &processor)
            .await
            .unwrap();

        let ids: Vec<u64> = output.results.iter().map(|r| r.item_id).collect();
        assert_eq!(ids, vec![1, 4, 3, 0, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_consumers_hold_producer_back() {
        let pipeline = ProducerConsumerPipeline::new(config(2, 3, false)).unwrap();
        let processor = Processor::from_async(|x: u64| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, TaskError>(x)
        });
        let started = Instant::now();
        let output = pipeline
            .run(fstream::iter(WorkItem::sequence(0..12u64)), &processor)
            .await
            .unwrap();

        assert_eq!(output.results.len(), 12);
        assert!(output.stats.high_water_mark <= 3);
        assert_eq!(output.stats.capacity, 3);
        // Six rounds of two 20ms items.
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_stream_producer() {
        let producer = stream! {
            for id in 0..10u64 {
                tokio::time::sleep(Duration::from_millis(2)).await;
                yield WorkItem::new(id, format!("line {}", id));
            }
        };
        let pipeline = ProducerConsumerPipeline::new(config(2, 2, false)).unwrap();
        let processor = Processor::blocking(|line: String| Ok(line.len()));
        let output = pipeline.run(producer, &processor).await.unwrap();

        assert_eq!(output.results.len(), 10);
        assert_eq!(output.results[0].value, Some(6));
        assert_eq!(output.results[9].value, Some(6));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failures_and_timeouts_are_per_item() {
        let pipeline = ProducerConsumerPipeline::new(config(2, 4, false))
            .unwrap()
            .with_item_timeout(Some(Duration::from_millis(100)));
        let processor = Processor::from_async(|ms: u64| async move {
            if ms == 0 {
                return Err(TaskError::failed("zero"));
            }
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        });
        let items = vec![
            WorkItem::new(0, 5),
            WorkItem::new(1, 0),
            WorkItem::new(2, 1_000),
            WorkItem::new(3, 5),
        ];
        let output = pipeline
            .run(fstream::iter(items), &processor)
            .await
            .unwrap();

        let by_id = |id: u64| output.results.iter().find(|r| r.item_id == id).unwrap();
        assert!(by_id(0).success);
        assert_eq!(by_id(1).error.as_deref(), Some("zero"));
        assert_eq!(by_id(2).error.as_deref(), Some("timeout"));
        assert!(by_id(3).success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancellation_drains_the_queue() {
        let token = CancellationToken::new();
        let pipeline = ProducerConsumerPipeline::new(config(2, 4, false))
            .unwrap()
            .with_cancellation(token.clone());
        let processor = Processor::from_async(|ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, TaskError>(ms)
        });
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        // An endless producer; only cancellation stops it.
        let producer = fstream::iter(0u64..).map(|id| WorkItem::new(id, 5_000));
        let started = Instant::now();
        let output = pipeline.run(producer, &processor).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(output.results.len() as u64, output.stats.enqueued);
        assert!(!output.results.is_empty());
        assert!(output
            .results
            .iter()
            .all(|r| r.error.as_deref() == Some("cancelled")));
    }

    #[tokio::test]
    async fn test_remote_processor_runs_in_worker_processes() {
        let pool = Arc::new(
            ProcessPool::start(ProcessPoolConfig::new(
                PathBuf::from(env!("CARGO_BIN_EXE_worker")),
                2,
            ))
            .unwrap(),
        );
        let pipeline = ProducerConsumerPipeline::new(config(2, 4, false))
            .unwrap()
            .with_process_pool(Arc::clone(&pool));
        let processor: Processor<i64, i64> = Processor::remote("square");
        let output = pipeline
            .run(fstream::iter(WorkItem::sequence(0..8i64)), &processor)
            .await
            .unwrap();
        pool.shutdown().await;

        assert_eq!(output.results.len(), 8);
        for result in &output.results {
            let x = result.item_id as i64;
            assert_eq!(result.value, Some(x * x));
            assert!(result.worker_id.starts_with("process-"));
        }
    }

    #[tokio::test]
    async fn test_remote_processor_without_pool_rejected() {
        let pipeline = ProducerConsumerPipeline::new(config(1, 1, false)).unwrap();
        let processor: Processor<i64, i64> = Processor::remote("square");
        let err = pipeline
            .run(fstream::iter(WorkItem::sequence(0..2i64)), &processor)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ConfigError(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(ProducerConsumerPipeline::new(config(0, 4, false)).is_err());
        assert!(ProducerConsumerPipeline::new(config(2, 0, false)).is_err());
    }
}
