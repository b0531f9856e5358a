//! Configuration for catch-up runs.

use catchup_types::BatchSize;

/// Tuning for a [`CatchUpInvoker`](crate::CatchUpInvoker).
///
/// # Example
///
/// ```ignore
/// let config = CatchUpConfig::default()
///     .with_batch_size(BatchSize::try_new(500)?);
/// let invoker = CatchUpInvoker::new(progress, source).with_config(config);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CatchUpConfig {
    batch_size: BatchSize,
}

impl CatchUpConfig {
    /// Maximum number of envelopes requested from the stream source per load
    /// (default: 100).
    pub const fn batch_size(&self) -> BatchSize {
        self.batch_size
    }

    /// Replace the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }
}
