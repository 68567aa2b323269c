//! `join` (alias `match`): pair records from two collections by key.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{DataOpError, field_or_null, parse_config, value_key};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Exact,
    Fuzzy,
}

#[derive(Debug, Deserialize)]
struct JoinConfig {
    #[serde(default)]
    left: Option<Vec<Value>>,
    #[serde(default)]
    right: Option<Vec<Value>>,
    #[serde(alias = "leftKey", alias = "key")]
    left_key: String,
    /// Defaults to `left_key`.
    #[serde(default, alias = "rightKey")]
    right_key: Option<String>,
    #[serde(default)]
    mode: MatchMode,
    #[serde(default = "default_threshold", alias = "fuzzyThreshold", alias = "threshold")]
    fuzzy_threshold: f64,
}

fn default_threshold() -> f64 {
    0.8
}

/// `{left, right, left_key, right_key?, mode?, fuzzy_threshold?}` ->
/// `{matched: [{left, right, score}], unmatchedLeft, unmatchedRight, matchCount}`.
///
/// Exact mode pairs every left record with every right record sharing its key.
/// Fuzzy mode pairs each left record with the best-scoring right record not yet
/// taken, if that score reaches the threshold. Null keys never match.
pub fn join(config: &Value) -> Result<Value, DataOpError> {
    let config: JoinConfig = parse_config("join", config)?;
    if !(0.0..=1.0).contains(&config.fuzzy_threshold) {
        return Err(DataOpError::config("join", "fuzzy_threshold must be within 0..=1"));
    }

    let left = config.left.unwrap_or_default();
    let right = config.right.unwrap_or_default();
    let right_key = config.right_key.as_deref().unwrap_or(&config.left_key);

    let key_of = |item: &Value, path: &str| -> Option<String> {
        let v = field_or_null(item, path);
        (!v.is_null()).then(|| value_key(v))
    };
    let right_keys: Vec<Option<String>> = right.iter().map(|r| key_of(r, right_key)).collect();

    let mut matched = Vec::new();
    let mut unmatched_left = Vec::new();
    let mut right_taken = vec![false; right.len()];

    match config.mode {
        MatchMode::Exact => {
            let mut index: HashMap<&str, Vec<usize>> = HashMap::new();
            for (i, key) in right_keys.iter().enumerate() {
                if let Some(key) = key {
                    index.entry(key.as_str()).or_default().push(i);
                }
            }
            for item in &left {
                let hits = key_of(item, &config.left_key).and_then(|k| index.get(k.as_str()));
                match hits {
                    Some(hits) => {
                        for &i in hits {
                            right_taken[i] = true;
                            matched.push(json!({"left": item, "right": right[i], "score": 1.0}));
                        }
                    }
                    None => unmatched_left.push(item.clone()),
                }
            }
        }
        MatchMode::Fuzzy => {
            for item in &left {
                let Some(key) = key_of(item, &config.left_key) else {
                    unmatched_left.push(item.clone());
                    continue;
                };
                let mut best: Option<(usize, f64)> = None;
                for (i, candidate) in right_keys.iter().enumerate() {
                    let Some(candidate) = candidate else { continue };
                    if right_taken[i] {
                        continue;
                    }
                    let score = similarity(&key, candidate);
                    if score >= config.fuzzy_threshold && best.is_none_or(|(_, s)| score > s) {
                        best = Some((i, score));
                    }
                }
                match best {
                    Some((i, score)) => {
                        right_taken[i] = true;
                        matched.push(json!({"left": item, "right": right[i], "score": score}));
                    }
                    None => unmatched_left.push(item.clone()),
                }
            }
        }
    }

    let unmatched_right: Vec<&Value> = right
        .iter()
        .zip(&right_taken)
        .filter(|(_, taken)| !**taken)
        .map(|(item, _)| item)
        .collect();

    Ok(json!({
        "matchCount": matched.len(),
        "matched": matched,
        "unmatchedLeft": unmatched_left,
        "unmatchedRight": unmatched_right,
    }))
}

/// Normalized Levenshtein similarity in `0.0..=1.0`, case-insensitive and
/// ignoring surrounding whitespace.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.trim().to_lowercase().chars().collect();
    let b: Vec<char> = b.trim().to_lowercase().chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
