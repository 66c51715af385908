//! Edit-distance-tolerant token matching.
//!
//! Last-resort retrieval mode: when no chunk shares an exact term with the
//! query, tokens are compared with a bounded Levenshtein distance so that
//! typos ("surgury", "hospitl") still find their clause.
//!
//! Tolerance per query term is `⌊len / 4⌋`, capped at [`MAX_EDITS`]; terms
//! shorter than four characters must match exactly.

use std::collections::HashSet;

use crate::store::tokenize;

/// Upper bound on edits tolerated for any single term.
pub const MAX_EDITS: usize = 2;

/// Allowed edit distance for a query term.
pub fn tolerance(term: &str) -> usize {
    (term.chars().count() / 4).min(MAX_EDITS)
}

/// Levenshtein distance between `a` and `b`, or `None` if it exceeds `max`.
///
/// Runs the standard two-row DP but bails out as soon as every cell of a
/// row is above `max`.
pub fn bounded_levenshtein(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return None;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
            row_min = row_min.min(curr[j + 1]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let d = prev[b.len()];
    (d <= max).then_some(d)
}

/// Fuzzy relevance of `text` for `terms`.
///
/// Each query term contributes `1 - d / (tol + 1)` for its best-matching
/// token in `text` (1.0 for an exact hit), or nothing if no token is
/// within tolerance. Returns `0.0` when nothing matches.
pub fn fuzzy_score(terms: &[String], text: &str) -> f64 {
    let tokens: HashSet<String> = tokenize(text).into_iter().collect();
    if tokens.is_empty() {
        return 0.0;
    }

    let mut score = 0.0;
    for term in terms {
        let tol = tolerance(term);
        let best = tokens
            .iter()
            .filter_map(|tok| bounded_levenshtein(term, tok, tol))
            .min();
        if let Some(d) = best {
            score += 1.0 - d as f64 / (tol as f64 + 1.0);
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_basic() {
        assert_eq!(bounded_levenshtein("kitten", "sitting", 3), Some(3));
        assert_eq!(bounded_levenshtein("kitten", "sitting", 2), None);
        assert_eq!(bounded_levenshtein("same", "same", 0), Some(0));
        assert_eq!(bounded_levenshtein("", "ab", 2), Some(2));
    }

    #[test]
    fn test_length_gap_short_circuits() {
        assert_eq!(bounded_levenshtein("a", "abcdef", 2), None);
    }

    #[test]
    fn test_tolerance_caps() {
        assert_eq!(tolerance("knee"), 1);
        assert_eq!(tolerance("abc"), 0);
        assert_eq!(tolerance("hospitalization"), 2);
    }

    #[test]
    fn test_fuzzy_score_tolerates_typos() {
        let terms = vec!["surgury".to_string(), "xyz".to_string()];
        let s = fuzzy_score(&terms, "Knee surgery is covered.");
        assert!(s > 0.0 && s < 1.0);
        assert_eq!(fuzzy_score(&terms, "dental care"), 0.0);
    }

    #[test]
    fn test_fuzzy_exact_hit_scores_one() {
        let terms = vec!["covered".to_string()];
        assert!((fuzzy_score(&terms, "is COVERED here") - 1.0).abs() < 1e-9);
    }
}
