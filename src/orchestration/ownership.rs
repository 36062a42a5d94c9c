//! Ownership Registry: which worker may mutate which resources.
//!
//! Claims are sets of path globs. Two claims conflict when some path
//! could match a pattern from each, which is decided structurally on the
//! glob text without touching the filesystem.
//!
//! Supported glob syntax: `*` and `?` within a segment, `**` across
//! segments, and simple `{a,b}` alternatives. Character classes are
//! treated as a single wildcard character, which can over-report a
//! conflict but never miss one.

use crate::error::{Error, Result};
use crate::orchestration::WorkerId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// An active claim held by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnershipClaim {
    pub worker_id: WorkerId,
    pub patterns: Vec<String>,
}

/// Thread-safe registry of active ownership claims.
#[derive(Clone, Default)]
pub struct OwnershipRegistry {
    claims: Arc<Mutex<HashMap<WorkerId, Vec<String>>>>,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim patterns for a worker.
    ///
    /// The patterns are merged into any claim the worker already holds; a
    /// worker never conflicts with itself. Either every pattern is
    /// claimed or none is.
    ///
    /// # Errors
    /// `OwnershipConflict` naming the first holder whose claim intersects.
    pub fn claim(&self, worker_id: WorkerId, patterns: &[String]) -> Result<()> {
        let mut claims = self.claims.lock();
        for requested in patterns {
            for (holder, held) in claims.iter() {
                if *holder == worker_id {
                    continue;
                }
                if let Some(overlapping) = held.iter().find(|p| patterns_overlap(requested, p)) {
                    warn!(
                        worker_id = %worker_id,
                        holder = %holder,
                        requested = %requested,
                        overlapping = %overlapping,
                        "Ownership conflict"
                    );
                    return Err(Error::OwnershipConflict {
                        conflicting_worker_id: *holder,
                        overlapping_pattern: overlapping.clone(),
                        requested_pattern: requested.clone(),
                    });
                }
            }
        }

        if patterns.is_empty() {
            return Ok(());
        }
        let entry = claims.entry(worker_id).or_default();
        for p in patterns {
            if !entry.contains(p) {
                entry.push(p.clone());
            }
        }
        debug!(worker_id = %worker_id, patterns = ?patterns, "Ownership claimed");
        Ok(())
    }

    /// Drop every claim held by a worker. Idempotent.
    pub fn release(&self, worker_id: WorkerId) -> Vec<String> {
        let released = self.claims.lock().remove(&worker_id).unwrap_or_default();
        if !released.is_empty() {
            debug!(worker_id = %worker_id, "Ownership released");
        }
        released
    }

    /// Drop every claim.
    pub fn release_all(&self) {
        self.claims.lock().clear();
    }

    /// Patterns currently held by a worker.
    pub fn patterns_for(&self, worker_id: WorkerId) -> Vec<String> {
        self.claims
            .lock()
            .get(&worker_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of all active claims.
    pub fn claims(&self) -> Vec<OwnershipClaim> {
        self.claims
            .lock()
            .iter()
            .map(|(worker_id, patterns)| OwnershipClaim {
                worker_id: *worker_id,
                patterns: patterns.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.lock().is_empty()
    }
}

impl std::fmt::Debug for OwnershipRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipRegistry")
            .field("claims", &self.claims.lock().len())
            .finish()
    }
}

/// Whether some path could match both globs.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let left = expand_braces(&normalize(a));
    let right = expand_braces(&normalize(b));
    left.iter().any(|l| {
        right.iter().any(|r| {
            let ls: Vec<&str> = l.split('/').collect();
            let rs: Vec<&str> = r.split('/').collect();
            SegmentMatcher::new(&ls, &rs).overlaps(0, 0)
        })
    })
}

fn normalize(pattern: &str) -> String {
    let mut p = pattern.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Expand the first `{a,b}` group, recursively. Nested groups are not
/// supported and are left as literal text.
fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close_rel) = pattern[open..].find('}') else {
        return vec![pattern.to_string()];
    };
    let close = open + close_rel;
    let inner = &pattern[open + 1..close];
    if inner.contains('{') {
        return vec![pattern.to_string()];
    }
    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];
    inner
        .split(',')
        .flat_map(|alt| expand_braces(&format!("{}{}{}", prefix, alt, suffix)))
        .collect()
}

/// Memoized overlap check over path segments, where `**` spans zero or
/// more segments.
struct SegmentMatcher<'a> {
    left: &'a [&'a str],
    right: &'a [&'a str],
    memo: HashMap<(usize, usize), bool>,
}

impl<'a> SegmentMatcher<'a> {
    fn new(left: &'a [&'a str], right: &'a [&'a str]) -> Self {
        Self {
            left,
            right,
            memo: HashMap::new(),
        }
    }

    fn overlaps(&mut self, i: usize, j: usize) -> bool {
        if let Some(&hit) = self.memo.get(&(i, j)) {
            return hit;
        }
        let (l, r) = (self.left, self.right);
        let result = if i == l.len() && j == r.len() {
            true
        } else if i < l.len() && l[i] == "**" {
            self.overlaps(i + 1, j) || (j < r.len() && self.overlaps(i, j + 1))
        } else if j < r.len() && r[j] == "**" {
            self.overlaps(i, j + 1) || (i < l.len() && self.overlaps(i + 1, j))
        } else if i == l.len() || j == r.len() {
            false
        } else {
            segments_intersect(l[i], r[j]) && self.overlaps(i + 1, j + 1)
        };
        self.memo.insert((i, j), result);
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Star,
    AnyChar,
    Lit(char),
}

fn tokenize(segment: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if out.last() != Some(&Token::Star) {
                    out.push(Token::Star);
                }
            }
            '?' => out.push(Token::AnyChar),
            '[' => {
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                }
                out.push(Token::AnyChar);
            }
            other => out.push(Token::Lit(other)),
        }
    }
    out
}

/// Whether two single-segment globs share a matching string.
fn segments_intersect(a: &str, b: &str) -> bool {
    let (ta, tb) = (tokenize(a), tokenize(b));
    let mut memo = vec![vec![None; tb.len() + 1]; ta.len() + 1];
    tokens_intersect(&ta, &tb, 0, 0, &mut memo)
}

fn tokens_intersect(
    a: &[Token],
    b: &[Token],
    i: usize,
    j: usize,
    memo: &mut Vec<Vec<Option<bool>>>,
) -> bool {
    if let Some(hit) = memo[i][j] {
        return hit;
    }
    let result = match (a.get(i), b.get(j)) {
        (None, None) => true,
        (Some(Token::Star), _) => {
            tokens_intersect(a, b, i + 1, j, memo)
                || (j < b.len() && tokens_intersect(a, b, i, j + 1, memo))
        }
        (_, Some(Token::Star)) => {
            tokens_intersect(a, b, i, j + 1, memo)
                || (i < a.len() && tokens_intersect(a, b, i + 1, j, memo))
        }
        (None, Some(_)) | (Some(_), None) => false,
        (Some(x), Some(y)) => {
            let compatible = match (x, y) {
                (Token::Lit(p), Token::Lit(q)) => p == q,
                _ => true,
            };
            compatible && tokens_intersect(a, b, i + 1, j + 1, memo)
        }
    };
    memo[i][j] = Some(result);
    result
}
