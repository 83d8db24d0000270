pub mod breaker;
pub mod dead_letter;
pub mod error_class;
pub mod executor;
pub mod queue;
pub mod traits;
pub mod types;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use dead_letter::{DeadLetterFilter, DeadLetterHandler, DeadLetterRecord};
pub use error_class::ErrorClass;
pub use executor::{ExecutorConfig, ProcessorStats, ReliableProcessor};
pub use queue::{JobQueue, QueueProducer, RedisJobQueue};
pub use traits::JobHandler;
pub use types::{FailureRecord, JobId, JobState, LeasedJob, Priority, QueueJob, QueueStats};
