//! Columnar accumulation of draws for hosts that consume arrow data.

use std::sync::Arc;

use arrow::array::{Array, ArrayBuilder, FixedSizeListBuilder, PrimitiveBuilder};
use arrow::datatypes::Float64Type;

use crate::sampler::{Draw, DrawSink};

/// Draw sink backed by a fixed-size-list builder: one list entry per draw,
/// one float per parameter.
pub struct ArrowDrawSink {
    draws: FixedSizeListBuilder<PrimitiveBuilder<Float64Type>>,
    keep_warmup: bool,
}

impl ArrowDrawSink {
    pub fn new(dim: usize) -> ArrowDrawSink {
        ArrowDrawSink::with_options(dim, false)
    }

    pub fn with_options(dim: usize, keep_warmup: bool) -> ArrowDrawSink {
        let values = PrimitiveBuilder::new();
        ArrowDrawSink {
            draws: FixedSizeListBuilder::new(values, dim as i32),
            keep_warmup,
        }
    }

    /// Finish the accumulated draws into one immutable array.
    pub fn finish(mut self) -> Arc<dyn Array> {
        ArrayBuilder::finish(&mut self.draws)
    }

    /// Snapshot the draws collected so far without consuming the sink.
    pub fn inspect(&self) -> Arc<dyn Array> {
        ArrayBuilder::finish_cloned(&self.draws)
    }
}

impl DrawSink for ArrowDrawSink {
    fn append(&mut self, draw: &Draw) {
        self.draws.values().append_slice(&draw.values);
        self.draws.append(true);
    }

    fn wants_warmup(&self) -> bool {
        self.keep_warmup
    }
}
