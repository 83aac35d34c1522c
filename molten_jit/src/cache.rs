//! LoopToken bookkeeping and bounded-longevity eviction.
//!
//! A `TokenId` is the opaque handle to one compiled artifact. Root loop
//! tokens are keyed by (call-site, green tuple); bridge tokens hang off the
//! guard they were patched onto and share their parent's lifetime. The
//! memory manager ages tokens by generation: the generation advances once
//! per successful compilation, entering compiled code refreshes the token,
//! and a root that has not been entered for `loop_longevity` generations is
//! evicted together with its bridges.

use crate::jitcode::SiteId;
use molten_core::Value;
use rustc_hash::FxHashMap;

/// Opaque handle to a compiled artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub u32);

/// What a token was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// A closed loop entered from the interpreter.
    RootLoop,
    /// A trace patched onto a failing guard of `parent`.
    Bridge { parent: TokenId },
}

#[derive(Debug)]
struct TokenInfo {
    site: SiteId,
    greens: Vec<Value>,
    kind: TokenKind,
    last_used: u64,
}

/// Owns the (site, greens) → token index and the eviction policy.
#[derive(Debug, Default)]
pub struct MemoryManager {
    next_token: u32,
    alive: FxHashMap<TokenId, TokenInfo>,
    lookup: FxHashMap<(SiteId, Vec<Value>), TokenId>,
    generation: u64,
    loop_longevity: u64,
}

impl MemoryManager {
    pub fn new(loop_longevity: u64) -> Self {
        MemoryManager {
            loop_longevity,
            ..MemoryManager::default()
        }
    }

    /// Register a freshly compiled root loop.
    pub fn new_loop_token(&mut self, site: SiteId, greens: Vec<Value>) -> TokenId {
        let token = self.fresh();
        self.lookup.insert((site, greens.clone()), token);
        self.alive.insert(
            token,
            TokenInfo {
                site,
                greens,
                kind: TokenKind::RootLoop,
                last_used: self.generation,
            },
        );
        token
    }

    /// Register a freshly compiled bridge.
    pub fn new_bridge_token(&mut self, parent: TokenId) -> TokenId {
        let token = self.fresh();
        let (site, greens) = match self.alive.get(&parent) {
            Some(info) => (info.site, info.greens.clone()),
            None => (SiteId(u32::MAX), Vec::new()),
        };
        self.alive.insert(
            token,
            TokenInfo {
                site,
                greens,
                kind: TokenKind::Bridge { parent },
                last_used: self.generation,
            },
        );
        token
    }

    fn fresh(&mut self) -> TokenId {
        let token = TokenId(self.next_token);
        self.next_token += 1;
        token
    }

    /// Find the compiled loop for a green tuple, if any.
    pub fn find(&self, site: SiteId, greens: &[Value]) -> Option<TokenId> {
        self.lookup.get(&(site, greens.to_vec())).copied()
    }

    #[inline]
    pub fn is_alive(&self, token: TokenId) -> bool {
        self.alive.contains_key(&token)
    }

    /// Number of live tokens (roots and bridges).
    pub fn live_count(&self) -> usize {
        self.alive.len()
    }

    /// Refresh a token's age because compiled code was entered through it.
    pub fn keep_alive(&mut self, token: TokenId) {
        let generation = self.generation;
        if let Some(info) = self.alive.get_mut(&token) {
            info.last_used = generation;
            if let TokenKind::Bridge { parent } = info.kind {
                // Running a bridge keeps its parent loop hot too.
                if let Some(parent_info) = self.alive.get_mut(&parent) {
                    parent_info.last_used = generation;
                }
            }
        }
    }

    /// Drop a token that failed to compile or was superseded, without
    /// waiting for it to age out.
    pub fn discard(&mut self, token: TokenId) {
        if let Some(info) = self.alive.remove(&token) {
            if info.kind == TokenKind::RootLoop {
                self.lookup.remove(&(info.site, info.greens));
            }
        }
    }

    /// Advance one generation and return every token that aged out. Called
    /// once per successful compilation, so longevity is measured in "number
    /// of later compiles", as in the original system.
    pub fn next_generation(&mut self) -> Vec<TokenId> {
        self.generation += 1;
        let cutoff = self.generation.saturating_sub(self.loop_longevity);

        let stale_roots: Vec<TokenId> = self
            .alive
            .iter()
            .filter(|(_, info)| info.kind == TokenKind::RootLoop && info.last_used < cutoff)
            .map(|(&t, _)| t)
            .collect();

        let mut evicted = Vec::new();
        for root in stale_roots {
            let info = self.alive.remove(&root).expect("stale root is alive");
            self.lookup.remove(&(info.site, info.greens));
            evicted.push(root);
            // Bridges die with their parent.
            let bridges: Vec<TokenId> = self
                .alive
                .iter()
                .filter(|(_, i)| i.kind == TokenKind::Bridge { parent: root })
                .map(|(&t, _)| t)
                .collect();
            for b in bridges {
                self.alive.remove(&b);
                evicted.push(b);
            }
        }
        evicted
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_green_tuple() {
        let mut mm = MemoryManager::new(10);
        let t = mm.new_loop_token(SiteId(0), vec![Value::Int(3)]);
        assert_eq!(mm.find(SiteId(0), &[Value::Int(3)]), Some(t));
        assert_eq!(mm.find(SiteId(0), &[Value::Int(4)]), None);
        assert_eq!(mm.find(SiteId(1), &[Value::Int(3)]), None);
    }

    #[test]
    fn unused_loops_age_out() {
        let mut mm = MemoryManager::new(2);
        let t = mm.new_loop_token(SiteId(0), vec![]);
        assert!(mm.next_generation().is_empty());
        assert!(mm.next_generation().is_empty());
        // Third generation without a keep_alive: past longevity.
        assert_eq!(mm.next_generation(), vec![t]);
        assert_eq!(mm.find(SiteId(0), &[]), None);
        assert!(!mm.is_alive(t));
    }

    #[test]
    fn keep_alive_resets_age() {
        let mut mm = MemoryManager::new(2);
        let t = mm.new_loop_token(SiteId(0), vec![]);
        for _ in 0..10 {
            mm.keep_alive(t);
            assert!(mm.next_generation().is_empty());
        }
        assert!(mm.is_alive(t));
    }

    #[test]
    fn bridges_die_with_their_parent() {
        let mut mm = MemoryManager::new(1);
        let root = mm.new_loop_token(SiteId(0), vec![]);
        let bridge = mm.new_bridge_token(root);
        mm.next_generation();
        let evicted = mm.next_generation();
        assert!(evicted.contains(&root));
        assert!(evicted.contains(&bridge));
        assert_eq!(mm.live_count(), 0);
    }

    #[test]
    fn running_a_bridge_keeps_the_parent() {
        let mut mm = MemoryManager::new(2);
        let root = mm.new_loop_token(SiteId(0), vec![]);
        let bridge = mm.new_bridge_token(root);
        for _ in 0..6 {
            mm.keep_alive(bridge);
            assert!(mm.next_generation().is_empty());
        }
        assert!(mm.is_alive(root));
    }
}
