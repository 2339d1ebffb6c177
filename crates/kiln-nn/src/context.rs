/// What a layer needs to know about the training step it runs in.
pub trait ExecutionContext {
    /// Mini-batch size used to normalize gradients. In data-parallel
    /// training this is the global batch, aggregated across workers.
    fn effective_mini_batch_size(&self) -> usize;
}

/// Context with a fixed effective mini-batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingContext {
    effective_mini_batch_size: usize,
}

impl TrainingContext {
    pub fn new(effective_mini_batch_size: usize) -> Self {
        TrainingContext {
            effective_mini_batch_size,
        }
    }
}

impl ExecutionContext for TrainingContext {
    fn effective_mini_batch_size(&self) -> usize {
        self.effective_mini_batch_size
    }
}
