// ===============================
// src/selector.rs (target list)
// ===============================
//
// Order of the result:
//   1) retained symbols that have a score, in configured order
//   2) eligible candidates by core_score desc
// Ties keep the order of the score file (stable sort).
//
use ahash::AHashSet as HashSet;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, warn};

use crate::compliance::ComplianceSets;
use crate::domain::ScoredSymbol;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetEntry {
    pub score: ScoredSymbol,
    pub retained: bool,
}

impl TargetEntry {
    pub fn symbol(&self) -> &str { &self.score.symbol }
}

pub fn select(
    n: usize,
    scored: &[ScoredSymbol],
    held: &HashSet<String>,
    sets: &ComplianceSets,
) -> Vec<TargetEntry> {
    let mut out: Vec<TargetEntry> = Vec::with_capacity(n);

    for sym in sets.retention() {
        match scored.iter().find(|s| &s.symbol == sym) {
            Some(s) => out.push(TargetEntry { score: s.clone(), retained: true }),
            None => warn!(symbol = %sym, "retained symbol has no score, left out of targets"),
        }
    }
    if out.len() >= n {
        out.truncate(n);
        return out;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut candidates: Vec<&ScoredSymbol> = Vec::new();
    for s in scored {
        if !seen.insert(s.symbol.as_str()) || sets.is_retained(&s.symbol) {
            continue;
        }
        if s.core_score.is_nan() {
            warn!(symbol = %s.symbol, "NaN core score, skipped");
            continue;
        }
        let is_held = held.contains(&s.symbol);
        let fresh_ok = !sets.is_excluded(&s.symbol) && s.has_positive_fundamentals();
        if fresh_ok || is_held {
            candidates.push(s);
        } else {
            debug!(symbol = %s.symbol, excluded = sets.is_excluded(&s.symbol), "not eligible");
        }
    }

    candidates.sort_by(|a, b| b.core_score.partial_cmp(&a.core_score).unwrap_or(Ordering::Equal));
    let room = n - out.len();
    out.extend(candidates.into_iter().take(room).map(|s| TargetEntry { score: s.clone(), retained: false }));
    out
}

/// Symbols on the target list without a score record. Empty means the list may be acted on.
pub fn missing_scores(targets: &[TargetEntry], score_index: &HashSet<String>) -> Vec<String> {
    targets
        .iter()
        .filter(|t| !score_index.contains(t.symbol()))
        .map(|t| t.symbol().to_string())
        .collect()
}
