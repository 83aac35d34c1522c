//! The JIT engine.
//!
//! One `Engine` owns the whole compilation side of a program run: warm-up
//! counters, the tracer, the optimizer configuration, the backend, resume
//! tables and the token cache. The interpreter talks to it through exactly
//! two calls: `loop_header` at every `LoopHeader` instruction and
//! `record_function_call` at every call.
//!
//! `loop_header` returns a `HeaderOutcome` describing who owns execution
//! now. `TookOver` means the engine replaced the top of the interpreter's
//! frame stack (after running compiled code, tracing, or deoptimizing) and
//! the interpreter should simply keep dispatching from the new state.
//!
//! Guard failures flow back here from the backend. A failing guard is
//! profiled; once it has failed `trace_eagerness` times a bridge is traced
//! from its resume data and patched on, up to `retrace_limit` bridges per
//! guard, after which the guard is marked generic and always deoptimizes.
//! Guards whose resume data names a removed allocation are never bridged:
//! the bridge's entry arguments could not describe the missing object, so
//! those guards materialize and fall back to the interpreter.

use rustc_hash::FxHashMap;

use crate::backend::eval::EvalBackend;
use crate::backend::{Backend, Outcome};
use crate::bridge::{GuardProfile, GuardResume, ResumeTable};
use crate::cache::{MemoryManager, TokenId};
use crate::gc::GcConfig;
use crate::interp::{self, BlackholeExit, FrameState};
use crate::jitcode::{FuncId, Program, SiteId};
use crate::opt;
use crate::stats::{AbortReason, JitStats};
use crate::tracer::{TraceEnd, Tracer};
use crate::warmup::{Action, JitParams, WarmupState};
use molten_core::{Heap, Value, VmError};

/// Who owns execution after a loop-header consultation.
#[derive(Debug, PartialEq)]
pub enum HeaderOutcome {
    /// Nothing happened; step past the header and keep interpreting.
    Continue,
    /// The engine executed (compiled code, tracing, or deoptimization) and
    /// replaced the top of the frame stack; dispatch from the new state
    /// without advancing the pc.
    TookOver,
    /// Execution ran to completion inside the engine.
    Finished(Value),
}

pub struct Engine {
    params: JitParams,
    warmup: WarmupState,
    memmgr: MemoryManager,
    backend: Box<dyn Backend>,
    gc: GcConfig,
    /// Per-token resume data, in the backend's guard numbering.
    resume: FxHashMap<TokenId, ResumeTable>,
    profiles: FxHashMap<(TokenId, u32), GuardProfile>,
    /// Root token -> the (site, greens) it was compiled for.
    roots: FxHashMap<TokenId, (SiteId, Vec<Value>)>,
    /// Any token -> its root loop token (identity for roots).
    token_root: FxHashMap<TokenId, TokenId>,
    stats: JitStats,
}

impl Engine {
    pub fn new(params: JitParams) -> Engine {
        Engine::with_backend(params, Box::new(EvalBackend::new()))
    }

    pub fn with_backend(params: JitParams, backend: Box<dyn Backend>) -> Engine {
        Engine {
            memmgr: MemoryManager::new(params.loop_longevity),
            params,
            warmup: WarmupState::new(),
            backend,
            gc: GcConfig::new(),
            resume: FxHashMap::default(),
            profiles: FxHashMap::default(),
            roots: FxHashMap::default(),
            token_root: FxHashMap::default(),
            stats: JitStats::default(),
        }
    }

    pub fn params(&self) -> &JitParams {
        &self.params
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    pub fn gc_config_mut(&mut self) -> &mut GcConfig {
        &mut self.gc
    }

    /// Live compiled artifacts (roots and bridges).
    pub fn live_tokens(&self) -> usize {
        self.memmgr.live_count()
    }

    /// Count one interpreted call toward the inlining threshold.
    pub fn record_function_call(&mut self, func: FuncId) {
        self.warmup.record_call(func);
    }

    /// Consulted by the interpreter at every `LoopHeader`. `frames` is the
    /// full frame stack, top frame's pc sitting on the header.
    pub fn loop_header(
        &mut self,
        program: &Program,
        heap: &mut Heap,
        frames: &mut Vec<FrameState>,
        site: SiteId,
    ) -> Result<HeaderOutcome, VmError> {
        if !self.params.enabled {
            return Ok(HeaderOutcome::Continue);
        }
        if (program.policy.should_unroll_one_iteration)(site) {
            return Ok(HeaderOutcome::Continue);
        }
        let frame = frames.last().expect("a frame reached the header");
        let decl = program.site(site);
        let greens: Vec<Value> = decl.greens.iter().map(|&r| frame.get(r)).collect();

        match self.warmup.enter(&self.params, site, &greens) {
            Action::RunInterpreter => Ok(HeaderOutcome::Continue),
            Action::StartTracing => self.trace_loop(program, heap, frames, site, greens),
            Action::RunCompiled(token) => {
                self.enter_compiled(program, heap, frames, site, token)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Entering compiled code
    // -------------------------------------------------------------------------

    fn enter_compiled(
        &mut self,
        program: &Program,
        heap: &mut Heap,
        frames: &mut Vec<FrameState>,
        site: SiteId,
        token: TokenId,
    ) -> Result<HeaderOutcome, VmError> {
        let frame = frames.last().expect("a frame reached the header");
        let decl = program.site(site);
        let reds: Vec<Value> = decl.reds.iter().map(|&r| frame.get(r)).collect();

        // The trace specialized on the kinds the reds had at record time;
        // a loop whose reds drifted runs interpreted this iteration.
        match self.backend.entry_kinds(token) {
            Some(kinds)
                if kinds.len() == reds.len()
                    && kinds.iter().zip(&reds).all(|(&k, v)| v.kind() == k) => {}
            _ => return Ok(HeaderOutcome::Continue),
        }

        self.memmgr.keep_alive(token);
        self.stats.enter_compiled += 1;
        match self.backend.execute(token, &reds, program, heap) {
            Outcome::Raised(e) => Err(e),
            Outcome::GuardFailed {
                token,
                guard,
                live_values,
            } => self.guard_failed(program, heap, frames, token, guard, live_values),
        }
    }

    // -------------------------------------------------------------------------
    // Tracing and compiling root loops
    // -------------------------------------------------------------------------

    fn trace_loop(
        &mut self,
        program: &Program,
        heap: &mut Heap,
        frames: &mut Vec<FrameState>,
        site: SiteId,
        greens: Vec<Value>,
    ) -> Result<HeaderOutcome, VmError> {
        self.stats.traces_started += 1;
        let frame = frames.last().expect("a frame reached the header");
        let tracer = Tracer::for_loop(
            program,
            &self.params,
            &self.warmup,
            site,
            greens.clone(),
            frame,
        );
        let run = tracer.run(heap);

        match run.end {
            TraceEnd::Closed(trace) => {
                self.install_loop(program, site, &greens, &trace);
                // Tracing executed one full iteration concretely; hand back
                // the machine state at the header it closed on.
                splice(frames, run.frames);
                Ok(HeaderOutcome::TookOver)
            }
            TraceEnd::Aborted(reason) => {
                self.stats.record_abort(reason);
                self.warmup.abort_backoff(site, &greens);
                splice(frames, run.frames);
                Ok(HeaderOutcome::TookOver)
            }
            TraceEnd::RootReturned(v) => {
                self.stats.record_abort(AbortReason::RootReturned);
                self.warmup.abort_backoff(site, &greens);
                deliver(frames, v)
            }
            TraceEnd::Raised(e) => {
                self.stats.record_abort(AbortReason::Raised);
                self.warmup.abort_backoff(site, &greens);
                Err(e)
            }
        }
    }

    fn install_loop(
        &mut self,
        program: &Program,
        site: SiteId,
        greens: &[Value],
        trace: &crate::trace::Trace,
    ) {
        self.stats.ops_recorded += trace.body_len() as u64;
        let optimized = opt::optimize(program, &self.gc, self.params.enabled_opts, trace);
        self.stats.ops_after_opt += optimized.body_len() as u64;

        let token = self.memmgr.new_loop_token(site, greens.to_vec());
        match self.backend.compile_loop(&optimized, token) {
            Ok(()) => {
                self.resume.insert(token, ResumeTable::from_trace(&optimized));
                self.roots.insert(token, (site, greens.to_vec()));
                self.token_root.insert(token, token);
                self.warmup.set_token(site, greens, token);
                self.stats.loops_compiled += 1;
                self.tick_eviction();
            }
            Err(_) => {
                self.memmgr.discard(token);
                self.warmup.dont_trace(site, greens);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Guard failure: bridge or deoptimize
    // -------------------------------------------------------------------------

    fn guard_failed(
        &mut self,
        program: &Program,
        heap: &mut Heap,
        frames: &mut Vec<FrameState>,
        token: TokenId,
        guard: u32,
        live_values: Vec<Value>,
    ) -> Result<HeaderOutcome, VmError> {
        self.stats.guard_failures += 1;
        let table = self
            .resume
            .get(&token)
            .expect("an executing token has resume data");
        let has_virtuals = table.has_virtuals(guard);
        let guard_data = table.guard(guard).clone();

        let (attempt_bridge, exhausted) = {
            let profile = self.profiles.entry((token, guard)).or_default();
            profile.failures += 1;
            let hot = profile.failures >= self.params.trace_eagerness && !profile.generic;
            let bridgeable = profile.bridges < self.params.retrace_limit && !has_virtuals;
            (hot && bridgeable, hot && !bridgeable)
        };

        if exhausted {
            // This guard has been re-specialized enough (or cannot be
            // bridged at all); stop profiling it and let it deoptimize.
            if let Some(profile) = self.profiles.get_mut(&(token, guard)) {
                profile.generic = true;
            }
            self.stats.generic_bridges += 1;
            self.backend.mark_guard_generic(token, guard);
        }

        if attempt_bridge {
            if let Some(outcome) =
                self.trace_bridge(program, heap, frames, token, guard, &guard_data, &live_values)?
            {
                return Ok(outcome);
            }
        }

        // Deoptimize: rebuild the interpreter state the snapshot describes,
        // materializing removed allocations, then run cold to the next
        // header.
        let rebuilt = self
            .resume
            .get(&token)
            .expect("an executing token has resume data")
            .rebuild_frames(guard, &live_values, program, heap);
        splice(frames, rebuilt);
        self.stats.blackhole_runs += 1;
        match interp::run_blackhole(program, heap, frames)? {
            BlackholeExit::AtHeader => Ok(HeaderOutcome::TookOver),
            BlackholeExit::Finished(v) => Ok(HeaderOutcome::Finished(v)),
        }
    }

    /// Trace a bridge from a hot guard. The tracer resumes concretely from
    /// the guard's resume state, so when this returns `Some`, execution has
    /// already moved on and the frame stack reflects it.
    #[allow(clippy::too_many_arguments)]
    fn trace_bridge(
        &mut self,
        program: &Program,
        heap: &mut Heap,
        frames: &mut Vec<FrameState>,
        token: TokenId,
        guard: u32,
        guard_data: &GuardResume,
        live_values: &[Value],
    ) -> Result<Option<HeaderOutcome>, VmError> {
        let root = match self.token_root.get(&token) {
            Some(&root) => root,
            None => return Ok(None),
        };
        let (root_site, root_greens) = match self.roots.get(&root) {
            Some(r) => r.clone(),
            None => return Ok(None),
        };
        let target_kinds = match self.backend.entry_kinds(root) {
            Some(kinds) => kinds,
            None => return Ok(None),
        };

        self.stats.traces_started += 1;
        let tracer = Tracer::for_bridge(
            program,
            &self.params,
            &self.warmup,
            &guard_data.snapshot,
            &guard_data.live,
            live_values,
            root_site,
            root_greens,
            root,
            target_kinds,
        );
        let run = tracer.run(heap);

        match run.end {
            TraceEnd::Closed(trace) => {
                self.stats.ops_recorded += trace.body_len() as u64;
                let optimized =
                    opt::optimize(program, &self.gc, self.params.enabled_opts, &trace);
                self.stats.ops_after_opt += optimized.body_len() as u64;

                let bridge = self.memmgr.new_bridge_token(root);
                match self.backend.compile_bridge(&optimized, bridge) {
                    Ok(()) => {
                        self.resume
                            .insert(bridge, ResumeTable::from_trace(&optimized));
                        self.token_root.insert(bridge, root);
                        self.backend.patch_guard(token, guard, bridge);
                        if let Some(profile) = self.profiles.get_mut(&(token, guard)) {
                            profile.bridges += 1;
                            profile.failures = 0;
                        }
                        self.stats.bridges_compiled += 1;
                        self.tick_eviction();
                    }
                    Err(_) => self.memmgr.discard(bridge),
                }
                splice(frames, run.frames);
                Ok(Some(HeaderOutcome::TookOver))
            }
            TraceEnd::Aborted(reason) => {
                self.stats.record_abort(reason);
                // Eagerness must re-accumulate before the next attempt.
                if let Some(profile) = self.profiles.get_mut(&(token, guard)) {
                    profile.failures /= 2;
                }
                splice(frames, run.frames);
                Ok(Some(HeaderOutcome::TookOver))
            }
            TraceEnd::RootReturned(v) => {
                self.stats.record_abort(AbortReason::RootReturned);
                deliver(frames, v).map(Some)
            }
            TraceEnd::Raised(e) => {
                self.stats.record_abort(AbortReason::Raised);
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Eviction
    // -------------------------------------------------------------------------

    fn tick_eviction(&mut self) {
        for token in self.memmgr.next_generation() {
            self.backend.free(token);
            self.warmup.forget_token(token);
            self.resume.remove(&token);
            self.roots.remove(&token);
            self.token_root.remove(&token);
            self.profiles.retain(|&(t, _), _| t != token);
            self.stats.tokens_freed += 1;
        }
    }
}

/// Replace the frame that entered the engine with the frames execution is
/// in now, preserving where its eventual return value goes.
fn splice(frames: &mut Vec<FrameState>, mut replacement: Vec<FrameState>) {
    let saved = frames.pop().expect("a frame entered the engine");
    if let Some(first) = replacement.first_mut() {
        first.ret_dst = saved.ret_dst;
    }
    frames.extend(replacement);
}

/// The frame that entered the engine returned while inside it; pop it and
/// deliver the value to its caller, or finish the run.
fn deliver(frames: &mut Vec<FrameState>, value: Value) -> Result<HeaderOutcome, VmError> {
    let saved = frames.pop().expect("a frame entered the engine");
    match frames.last_mut() {
        None => Ok(HeaderOutcome::Finished(value)),
        Some(caller) => {
            if let Some(dst) = saved.ret_dst {
                caller.set(dst, value);
            }
            Ok(HeaderOutcome::TookOver)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
