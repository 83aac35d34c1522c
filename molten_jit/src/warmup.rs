//! The warm-up controller.
//!
//! Every arrival at a loop header is funneled through `WarmupState::enter`,
//! which owns one `JitCell` per (site, green tuple) and decides between
//! plain interpretation, starting a trace, and entering compiled code. All
//! counters saturate; an aborted trace halves its cell's counter so a
//! problematic loop backs off instead of re-tracing every `threshold`
//! iterations.

use crate::cache::TokenId;
use crate::jitcode::{FuncId, SiteId};
use crate::opt::OptConfig;
use molten_core::Value;
use rustc_hash::FxHashMap;

/// Engine tunables. The defaults are the production values; tests shrink
/// them to make warm-up observable in a few iterations.
#[derive(Debug, Clone, Copy)]
pub struct JitParams {
    /// Loop header arrivals before a trace is attempted.
    pub threshold: u32,
    /// Calls before a function becomes an inlining candidate.
    pub function_threshold: u32,
    /// Failures of one guard before a bridge is attempted.
    pub trace_eagerness: u32,
    /// Maximum recorded operations per trace.
    pub trace_limit: usize,
    /// Maximum bridges compiled from any single guard.
    pub retrace_limit: u32,
    /// Generations a compiled loop survives without being entered.
    pub loop_longevity: u64,
    /// Whether the tracer follows opaque calls inline.
    pub inlining: bool,
    /// Which optimization passes run on a closed trace.
    pub enabled_opts: OptConfig,
    /// Master switch; off means pure interpretation.
    pub enabled: bool,
}

impl Default for JitParams {
    fn default() -> Self {
        JitParams {
            threshold: 1039,
            function_threshold: 1619,
            trace_eagerness: 200,
            trace_limit: 6000,
            retrace_limit: 5,
            loop_longevity: 1000,
            inlining: true,
            enabled_opts: OptConfig::default(),
            enabled: true,
        }
    }
}

/// What the interpreter should do at a loop header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RunInterpreter,
    StartTracing,
    RunCompiled(TokenId),
}

/// Per-(site, greens) warm-up state.
#[derive(Debug, Default)]
struct JitCell {
    counter: u32,
    token: Option<TokenId>,
    /// Set when this loop has proven hopeless (e.g. its trace failed to
    /// compile); the cell then always answers `RunInterpreter`.
    dont_trace: bool,
}

/// All warm-up bookkeeping of one engine.
#[derive(Debug, Default)]
pub struct WarmupState {
    cells: FxHashMap<(SiteId, Vec<Value>), JitCell>,
    calls: FxHashMap<FuncId, u32>,
}

impl WarmupState {
    pub fn new() -> Self {
        WarmupState::default()
    }

    /// Decide what to do for one loop header arrival. Counts the arrival.
    pub fn enter(&mut self, params: &JitParams, site: SiteId, greens: &[Value]) -> Action {
        let cell = self
            .cells
            .entry((site, greens.to_vec()))
            .or_default();
        if cell.dont_trace {
            return Action::RunInterpreter;
        }
        if let Some(token) = cell.token {
            return Action::RunCompiled(token);
        }
        cell.counter = cell.counter.saturating_add(1);
        // The counter is left standing across `StartTracing`: a successful
        // compile clears it via `set_token`, an abort halves it via
        // `abort_backoff`, so retries come sooner than the cold warm-up did.
        if cell.counter >= params.threshold {
            Action::StartTracing
        } else {
            Action::RunInterpreter
        }
    }

    /// Attach a freshly compiled loop to its cell.
    pub fn set_token(&mut self, site: SiteId, greens: &[Value], token: TokenId) {
        let cell = self.cells.entry((site, greens.to_vec())).or_default();
        cell.token = Some(token);
        cell.counter = 0;
    }

    /// Drop an evicted token; the loop must warm up from scratch.
    pub fn forget_token(&mut self, token: TokenId) {
        for cell in self.cells.values_mut() {
            if cell.token == Some(token) {
                cell.token = None;
                cell.counter = 0;
            }
        }
    }

    /// Back off after an aborted trace: halve the counter, never zero it,
    /// so the site stays warmer than a cold one.
    pub fn abort_backoff(&mut self, site: SiteId, greens: &[Value]) {
        if let Some(cell) = self.cells.get_mut(&(site, greens.to_vec())) {
            cell.counter /= 2;
        }
    }

    /// Give up on a loop permanently.
    pub fn dont_trace(&mut self, site: SiteId, greens: &[Value]) {
        let cell = self.cells.entry((site, greens.to_vec())).or_default();
        cell.dont_trace = true;
        cell.token = None;
    }

    /// Count one interpreted call of `func`.
    pub fn record_call(&mut self, func: FuncId) {
        let n = self.calls.entry(func).or_insert(0);
        *n = n.saturating_add(1);
    }

    /// Has `func` been called often enough to inline?
    pub fn function_is_hot(&self, params: &JitParams, func: FuncId) -> bool {
        self.calls.get(&func).copied().unwrap_or(0) >= params.function_threshold
    }
}

// =============================================================================
// Tests
// =============================================================================
