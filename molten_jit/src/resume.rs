//! Resume data: snapshots attached to guards.
//!
//! A snapshot records, for every interpreter-visible register of every frame
//! live at a guard, where its value comes from: a trace-time constant, a
//! live box, or a field of a still-virtual object. Together with the jitcode
//! pc this is sufficient to rebuild interpreter state without re-running the
//! trace, and nothing more is recorded (minimality is a compile-cost
//! concern, not a correctness one).
//!
//! The resume model is re-execution: `pc` names the instruction that was
//! being traced when the guard was emitted, and deoptimization re-executes
//! it concretely. Guards are always emitted before any of that instruction's
//! effects are recorded, which is what makes this legal.

use crate::arena::{Arena, Id};
use crate::jitcode::{FuncId, Reg};
use crate::trace::boxes::BoxId;
use molten_core::{ShapeId, Value};
use smallvec::SmallVec;

pub type SnapshotId = Id<Snapshot>;
pub type VirtualId = Id<VirtualSnapshot>;

/// Where one interpreter-visible value comes from at resume time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResumeSlot {
    /// Fixed at trace time.
    Const(Value),
    /// Read from the named box of the (optimized) trace.
    Live(BoxId),
    /// Reference to an allocation the optimizer removed; materialized by the
    /// resume engine before interpretation continues.
    Virtual(VirtualId),
}

/// One interpreter frame inside a snapshot, innermost last.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSnapshot {
    pub func: FuncId,
    /// Jitcode pc of the instruction to re-execute on resume.
    pub pc: u32,
    /// One slot per register, `0 .. num_regs`.
    pub regs: Vec<ResumeSlot>,
    /// Caller register receiving this frame's return value. `None` for the
    /// outermost frame, whose caller is not part of the snapshot.
    pub ret_dst: Option<Reg>,
}

/// Full resume data of one guard: the frame stack at emission time.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub frames: SmallVec<[FrameSnapshot; 2]>,
}

/// A removed allocation named by resume data: shape plus the slot of every
/// field at the guard. Fields may reference other virtuals.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualSnapshot {
    pub shape: ShapeId,
    pub fields: Vec<ResumeSlot>,
}

/// Collect every live box a snapshot depends on, in first-mention order,
/// following virtual fields. This is the argument list of a bridge traced
/// from the guard.
pub fn collect_live_boxes(
    snapshot: &Snapshot,
    virtuals: &Arena<VirtualSnapshot>,
) -> Vec<BoxId> {
    let mut out = Vec::new();
    let mut seen_virtuals = Vec::new();
    let mut pending: std::collections::VecDeque<ResumeSlot> = std::collections::VecDeque::new();

    for frame in &snapshot.frames {
        pending.extend(frame.regs.iter().copied());
    }
    // Breadth-first over virtual fields; a virtual is expanded once even if
    // several slots reference it.
    while let Some(slot) = pending.pop_front() {
        match slot {
            ResumeSlot::Const(_) => {}
            ResumeSlot::Live(b) => {
                if !out.contains(&b) {
                    out.push(b);
                }
            }
            ResumeSlot::Virtual(v) => {
                if !seen_virtuals.contains(&v) {
                    seen_virtuals.push(v);
                    pending.extend(virtuals[v].fields.iter().copied());
                }
            }
        }
    }
    out
}
