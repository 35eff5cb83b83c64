// src/matching/similarity.rs
use strsim::normalized_levenshtein;

/// Case-insensitive normalized Levenshtein ratio in [0, 1].
/// Returns 0.0 when either side is empty after trimming.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    normalized_levenshtein(&a, &b)
}

fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
