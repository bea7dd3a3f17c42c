use crate::config::ConsumerDefaults;
use crate::error::QueueError;

/// Per-consumer settings
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Parallel dispatch loops draining the buffer
    pub workers: usize,
    /// Capacity of the inbound buffer
    pub buffer_size: usize,
    /// Acknowledge after a successful callback instead of on delivery
    pub manual_ack: bool,
    /// Overrides the pool's consumer group
    pub group: Option<String>,
}

impl ConsumerOptions {
    pub fn new(workers: usize, buffer_size: usize) -> Self {
        Self {
            workers,
            buffer_size,
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_manual_ack(mut self, manual_ack: bool) -> Self {
        self.manual_ack = manual_ack;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.workers == 0 {
            return Err(QueueError::InvalidOptions(
                "consumer workers must be at least 1".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(QueueError::InvalidOptions(
                "consumer buffer size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerDefaults::default().into()
    }
}

impl From<ConsumerDefaults> for ConsumerOptions {
    fn from(defaults: ConsumerDefaults) -> Self {
        Self {
            workers: defaults.workers,
            buffer_size: defaults.buffer_size,
            manual_ack: defaults.manual_ack,
            group: None,
        }
    }
}
