use std::env;

/// Async bus tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Number of worker tasks draining the queue.
    pub workers: usize,
    /// Bounded queue capacity. Publishers wait when the queue is full.
    pub queue_capacity: usize,
}

impl BusConfig {
    /// Reads `EVENT_BUS_WORKERS` and `EVENT_BUS_QUEUE_CAPACITY`, falling back
    /// to defaults for missing or unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env::var("EVENT_BUS_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.workers),
            queue_capacity: env::var("EVENT_BUS_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.queue_capacity),
        }
        .normalized()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self.normalized()
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self.normalized()
    }

    // Both values must be at least one.
    fn normalized(mut self) -> Self {
        self.workers = self.workers.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}
