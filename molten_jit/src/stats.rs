//! Engine counters.
//!
//! Aggregated over the life of one `Engine`; cheap enough to maintain
//! unconditionally. Tests assert on these to pin down *how* a program ran,
//! not just what it computed.

/// Why a trace was thrown away instead of compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// Recorded operations exceeded the trace limit.
    TraceTooLong,
    /// The function containing the loop returned mid-trace.
    RootReturned,
    /// The traced execution raised an exception.
    Raised,
    /// Loop closure found reds whose kinds no longer match the entry label.
    KindMismatch,
    /// Inlined calls stacked past the depth cap.
    InlineTooDeep,
}

/// Counters exposed by the engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JitStats {
    pub traces_started: u64,
    pub loops_compiled: u64,
    pub bridges_compiled: u64,
    pub generic_bridges: u64,

    pub aborts_trace_too_long: u64,
    pub aborts_root_returned: u64,
    pub aborts_raised: u64,
    pub aborts_kind_mismatch: u64,
    pub aborts_inline_too_deep: u64,

    /// Operations recorded by the tracer, before optimization.
    pub ops_recorded: u64,
    /// Operations surviving optimization.
    pub ops_after_opt: u64,

    pub enter_compiled: u64,
    pub guard_failures: u64,
    pub blackhole_runs: u64,
    pub tokens_freed: u64,
}

impl JitStats {
    pub fn record_abort(&mut self, reason: AbortReason) {
        match reason {
            AbortReason::TraceTooLong => self.aborts_trace_too_long += 1,
            AbortReason::RootReturned => self.aborts_root_returned += 1,
            AbortReason::Raised => self.aborts_raised += 1,
            AbortReason::KindMismatch => self.aborts_kind_mismatch += 1,
            AbortReason::InlineTooDeep => self.aborts_inline_too_deep += 1,
        }
    }

    /// Total aborted traces, any reason.
    pub fn aborts(&self) -> u64 {
        self.aborts_trace_too_long
            + self.aborts_root_returned
            + self.aborts_raised
            + self.aborts_kind_mismatch
            + self.aborts_inline_too_deep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborts_sum_by_reason() {
        let mut stats = JitStats::default();
        stats.record_abort(AbortReason::Raised);
        stats.record_abort(AbortReason::Raised);
        stats.record_abort(AbortReason::TraceTooLong);
        assert_eq!(stats.aborts(), 3);
        assert_eq!(stats.aborts_raised, 2);
    }
}
