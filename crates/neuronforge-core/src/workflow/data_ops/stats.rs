//! `statistics`: descriptive stats over a numeric field.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{DataOpError, field_or_null, number, parse_config};

#[derive(Debug, Deserialize)]
struct StatsConfig {
    #[serde(default)]
    items: Option<Vec<Value>>,
    /// Field to read; the items themselves when absent.
    #[serde(default)]
    field: Option<String>,
    #[serde(default = "default_percentiles")]
    percentiles: Vec<f64>,
}

fn default_percentiles() -> Vec<f64> {
    vec![25.0, 50.0, 75.0, 90.0]
}

/// `{items, field?, percentiles?}` ->
/// `{count, sum, mean, median, mode, min, max, stddev, variance, percentiles}`.
///
/// Non-numeric values are ignored. With no numbers every statistic but
/// `count` and `sum` is null.
pub fn statistics(config: &Value) -> Result<Value, DataOpError> {
    let config: StatsConfig = parse_config("statistics", config)?;
    if let Some(bad) = config.percentiles.iter().find(|p| !(0.0..=100.0).contains(*p)) {
        return Err(DataOpError::config("statistics", format!("percentile {bad} out of range")));
    }

    let items = config.items.unwrap_or_default();
    let mut values: Vec<f64> = items
        .iter()
        .map(|item| match config.field.as_deref() {
            Some(path) => field_or_null(item, path),
            None => item,
        })
        .filter_map(Value::as_f64)
        .collect();
    values.sort_by(f64::total_cmp);

    let count = values.len();
    let sum: f64 = values.iter().sum();
    let mut percentiles = Map::new();
    for p in &config.percentiles {
        let value = percentile(&values, *p).map(number).unwrap_or(Value::Null);
        percentiles.insert(percentile_label(*p), value);
    }

    if count == 0 {
        return Ok(json!({
            "count": 0,
            "sum": 0,
            "mean": null,
            "median": null,
            "mode": null,
            "min": null,
            "max": null,
            "stddev": null,
            "variance": null,
            "percentiles": percentiles,
        }));
    }

    let mean = sum / count as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

    Ok(json!({
        "count": count,
        "sum": number(sum),
        "mean": number(mean),
        "median": percentile(&values, 50.0).map(number),
        "mode": mode(&values).map(number),
        "min": number(values[0]),
        "max": number(values[count - 1]),
        "stddev": number(variance.sqrt()),
        "variance": number(variance),
        "percentiles": percentiles,
    }))
}

/// Linear interpolation between closest ranks over sorted values.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

/// Most frequent value; ties go to the smallest.
fn mode(sorted: &[f64]) -> Option<f64> {
    let mut best: Option<(f64, usize)> = None;
    let mut i = 0;
    while i < sorted.len() {
        let run = sorted[i..].iter().take_while(|v| **v == sorted[i]).count();
        if best.is_none_or(|(_, n)| run > n) {
            best = Some((sorted[i], run));
        }
        i += run;
    }
    best.map(|(v, _)| v)
}

fn percentile_label(p: f64) -> String {
    if p.fract() == 0.0 {
        format!("p{}", p as u64)
    } else {
        format!("p{p}")
    }
}
