//! The deoptimization engine.
//!
//! When a guard of an installed trace fails without an attached bridge, the
//! backend hands back the guard's live values. This module owns the other
//! half of the story: per-token resume tables cloned out of the optimized
//! trace at install time, frame-stack reconstruction from a snapshot, and
//! materialization of allocations the optimizer removed.
//!
//! Materialization is the one place resume data touches the heap: a
//! `ResumeSlot::Virtual` names an object that never existed, and the
//! interpreter cannot resume until it does. Objects are rebuilt memoized,
//! so a virtual referenced from several registers comes back as one object,
//! and reference cycles through virtual fields tie correctly.

use rustc_hash::FxHashMap;

use crate::arena::Arena;
use crate::interp::FrameState;
use crate::jitcode::Program;
use crate::resume::{
    collect_live_boxes, ResumeSlot, Snapshot, VirtualId, VirtualSnapshot,
};
use crate::trace::boxes::BoxId;
use crate::trace::Trace;
use molten_core::{Heap, ObjRef, Value};

/// Resume data of one guard, detached from its trace.
#[derive(Debug, Clone)]
pub struct GuardResume {
    pub snapshot: Snapshot,
    /// The boxes whose runtime values the backend reports on failure, in
    /// the order it reports them.
    pub live: Vec<BoxId>,
}

/// All resume data of one installed trace, in guard emission order. The
/// backend numbers guards the same way, so its failure reports index
/// directly into this table.
#[derive(Debug, Clone)]
pub struct ResumeTable {
    guards: Vec<GuardResume>,
    virtuals: Arena<VirtualSnapshot>,
}

impl ResumeTable {
    pub fn from_trace(trace: &Trace) -> ResumeTable {
        let guards = trace
            .ops
            .iter()
            .filter(|op| op.opcode.is_guard())
            .map(|op| {
                let sid = op.snapshot.expect("validated trace pairs guards with snapshots");
                let snapshot = trace.snapshots[sid].clone();
                let live = collect_live_boxes(&snapshot, &trace.virtuals);
                GuardResume { snapshot, live }
            })
            .collect();
        ResumeTable {
            guards,
            virtuals: trace.virtuals.clone(),
        }
    }

    pub fn guard(&self, index: u32) -> &GuardResume {
        &self.guards[index as usize]
    }

    pub fn guard_count(&self) -> usize {
        self.guards.len()
    }

    /// Whether the guard's resume data names any removed allocation.
    /// Bridges are not traced from such guards: the bridge's entry
    /// arguments could not describe the virtual, so deoptimization
    /// materializes and the interpreter takes over instead.
    pub fn has_virtuals(&self, index: u32) -> bool {
        self.guards[index as usize]
            .snapshot
            .frames
            .iter()
            .flat_map(|f| f.regs.iter())
            .any(|slot| matches!(slot, ResumeSlot::Virtual(_)))
    }

    /// Rebuild the interpreter frame stack for a failed guard, outermost
    /// frame first. `live_values` is the backend's failure report for the
    /// same guard. Removed allocations are materialized on `heap`.
    pub fn rebuild_frames(
        &self,
        index: u32,
        live_values: &[Value],
        program: &Program,
        heap: &mut Heap,
    ) -> Vec<FrameState> {
        let guard = &self.guards[index as usize];
        debug_assert_eq!(guard.live.len(), live_values.len());
        let values: FxHashMap<BoxId, Value> = guard
            .live
            .iter()
            .copied()
            .zip(live_values.iter().copied())
            .collect();
        let mut memo: FxHashMap<VirtualId, ObjRef> = FxHashMap::default();

        guard
            .snapshot
            .frames
            .iter()
            .map(|frame| FrameState {
                func: frame.func,
                pc: frame.pc,
                regs: frame
                    .regs
                    .iter()
                    .map(|&slot| self.slot_value(slot, &values, &mut memo, program, heap))
                    .collect(),
                ret_dst: frame.ret_dst,
            })
            .collect()
    }

    fn slot_value(
        &self,
        slot: ResumeSlot,
        values: &FxHashMap<BoxId, Value>,
        memo: &mut FxHashMap<VirtualId, ObjRef>,
        program: &Program,
        heap: &mut Heap,
    ) -> Value {
        match slot {
            ResumeSlot::Const(v) => v,
            ResumeSlot::Live(b) => *values
                .get(&b)
                .expect("every live box has a reported runtime value"),
            ResumeSlot::Virtual(v) => {
                Value::Ref(self.materialize(v, values, memo, program, heap))
            }
        }
    }

    /// Allocate a removed object and fill its fields. Registered in `memo`
    /// before the fields are resolved so cyclic references find it.
    fn materialize(
        &self,
        id: VirtualId,
        values: &FxHashMap<BoxId, Value>,
        memo: &mut FxHashMap<VirtualId, ObjRef>,
        program: &Program,
        heap: &mut Heap,
    ) -> ObjRef {
        if let Some(&r) = memo.get(&id) {
            return r;
        }
        let virt = &self.virtuals[id];
        let r = heap.allocate_struct(virt.shape, program.shape(virt.shape));
        memo.insert(id, r);
        for field in 0..virt.fields.len() {
            let v = self.slot_value(virt.fields[field], values, memo, program, heap);
            heap.set_field(r, field as u16, v)
                .expect("materialized object matches its shape");
        }
        r
    }
}

/// Failure bookkeeping for one guard of one installed trace. The engine
/// keeps these to decide when a guard is hot enough to bridge and when it
/// has been re-specialized too often.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardProfile {
    pub failures: u32,
    /// Bridges attached to this guard over its lifetime, counting ones
    /// already evicted.
    pub bridges: u32,
    pub generic: bool,
}

// =============================================================================
// Tests
// =============================================================================
