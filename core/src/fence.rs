use std::sync::atomic::{AtomicU64, Ordering};

/// CPU side mirror of one GPU completion timeline.
///
/// Each submission signals the `current_value` and then bumps it,
/// so work tagged with `current_value` is complete once the GPU reports
/// that value (or anything after it) as completed.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Fence {
    current: AtomicU64,
    completed: AtomicU64,
    #[derivative(Debug = "ignore")]
    poller: Option<Box<dyn Fn() -> u64 + Send + Sync>>,
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl Fence {
    /// Create new fence. Nothing is submitted yet.
    pub fn new() -> Self {
        Fence {
            current: AtomicU64::new(1),
            completed: AtomicU64::new(0),
            poller: None,
        }
    }

    /// Create new fence that queries completed value from the GPU
    /// whenever the cached value is not enough to answer `is_complete`.
    pub fn with_poller(poller: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Fence {
            poller: Some(Box::new(poller)),
            ..Self::new()
        }
    }

    /// Value that the next submission will signal.
    pub fn current_value(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Mark current value as submitted.
    /// Returns the value that was submitted.
    pub fn advance(&self) -> u64 {
        let submitted = self.current.fetch_add(1, Ordering::AcqRel);
        log::trace!("Fence value {} submitted", submitted);
        submitted
    }

    /// Last value known to be completed by the GPU.
    pub fn last_completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Record value completed by the GPU.
    /// Completed value never moves backwards.
    pub fn signal_completed(&self, value: u64) {
        debug_assert!(
            value < self.current_value(),
            "Value {} can't be completed before it is submitted",
            value
        );
        self.completed.fetch_max(value, Ordering::AcqRel);
    }

    /// Check if GPU finished all work tagged with `value`.
    pub fn is_complete(&self, value: u64) -> bool {
        if value <= self.last_completed_value() {
            return true;
        }

        match &self.poller {
            Some(poller) => {
                // Lost devices may report any value. Nothing past the last submission can complete.
                let submitted = self.current_value() - 1;
                self.completed
                    .fetch_max(poller().min(submitted), Ordering::AcqRel);
                value <= self.last_completed_value()
            }
            None => false,
        }
    }
}
