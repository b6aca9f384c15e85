// Producer-consumer pipeline over a bounded queue

pub mod producer_consumer;
pub mod queue;

pub use producer_consumer::{PipelineOutput, PipelineStats, ProducerConsumerPipeline};
pub use queue::{BoundedQueue, Message};
