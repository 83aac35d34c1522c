//! Embedder-provided hints about the heap.
//!
//! The optimizer is allowed to keep a cached field value across an opaque
//! residual call only when the embedder has promised that the callee never
//! writes that field. Those promises are collected here, keyed by
//! (shape, field index).

use molten_core::ShapeId;
use rustc_hash::FxHashSet;

/// Heap knowledge the embedder hands to the optimizer.
#[derive(Debug, Default, Clone)]
pub struct GcConfig {
    virtualizable: FxHashSet<(ShapeId, u16)>,
}

impl GcConfig {
    pub fn new() -> Self {
        GcConfig::default()
    }

    /// Promise that no residual call ever writes `field` of `shape`.
    pub fn mark_virtualizable(&mut self, shape: ShapeId, field: u16) {
        self.virtualizable.insert((shape, field));
    }

    /// May a cached read of this field survive an opaque call?
    #[inline]
    pub fn is_virtualizable_field(&self, shape: ShapeId, field: u16) -> bool {
        self.virtualizable.contains(&(shape, field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_is_per_field() {
        let mut cfg = GcConfig::new();
        cfg.mark_virtualizable(ShapeId(0), 1);
        assert!(cfg.is_virtualizable_field(ShapeId(0), 1));
        assert!(!cfg.is_virtualizable_field(ShapeId(0), 0));
        assert!(!cfg.is_virtualizable_field(ShapeId(1), 1));
    }
}
