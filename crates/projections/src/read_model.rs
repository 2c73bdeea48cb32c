//! Read model trait for query-side views.

/// Query access to a denormalized view.
pub trait ReadModel: Send + Sync {
    /// Returns the name of this read model.
    fn name(&self) -> &'static str;

    /// Returns the number of entries in this read model, or 0 while a writer
    /// holds it.
    fn count(&self) -> usize;
}
