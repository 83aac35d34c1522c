//! Common-subexpression table for pure operations.

use super::OptValue;
use crate::jitcode::FuncId;
use crate::trace::ops::Opcode;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// The part of `OpExtra` that distinguishes otherwise-identical pure ops.
/// Only residual pure/elidable calls carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtraKey {
    None,
    Func(FuncId),
}

type Key = (Opcode, SmallVec<[OptValue; 2]>, ExtraKey);

/// Maps (opcode, resolved args, descriptor) to the value that already
/// computes it earlier in the trace.
#[derive(Debug, Default)]
pub struct PureCache {
    map: FxHashMap<Key, OptValue>,
}

impl PureCache {
    pub fn lookup(
        &self,
        opcode: Opcode,
        args: &SmallVec<[OptValue; 2]>,
        extra: ExtraKey,
    ) -> Option<OptValue> {
        self.map.get(&(opcode, args.clone(), extra)).copied()
    }

    pub fn insert(
        &mut self,
        opcode: Opcode,
        args: SmallVec<[OptValue; 2]>,
        extra: ExtraKey,
        result: OptValue,
    ) {
        self.map.insert((opcode, args, extra), result);
    }
}
