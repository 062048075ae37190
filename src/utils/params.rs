use std::collections::HashSet;

use serde_json::Number;

use crate::types::Warning;

/// Clamps a sampling parameter into `[min, max]`, recording a warning when
/// the caller's value had to change. Non-finite values are dropped.
pub(crate) fn clamp_param(
    name: &str,
    value: f32,
    min: f32,
    max: f32,
    warnings: &mut Vec<Warning>,
) -> Option<Number> {
    if !value.is_finite() {
        warnings.push(Warning::Compatibility {
            feature: name.to_string(),
            details: format!("{name} is not a finite number and was dropped"),
        });
        return None;
    }

    let bounded = value.clamp(min, max);
    if bounded != value {
        warnings.push(Warning::Clamped {
            parameter: name.to_string(),
            original: value,
            clamped_to: bounded,
        });
    }
    Number::from_f64(f64::from(bounded))
}

/// Trims and de-duplicates stop sequences, keeping first-seen order, and
/// truncates to the provider limit.
pub(crate) fn stop_sequences(
    sequences: &[String],
    limit: usize,
    warnings: &mut Vec<Warning>,
) -> Vec<String> {
    let mut seen = HashSet::<&str>::new();
    let mut out = sequences
        .iter()
        .map(|seq| seq.trim())
        .filter(|seq| !seq.is_empty() && seen.insert(*seq))
        .map(str::to_string)
        .collect::<Vec<_>>();

    if out.len() > limit {
        warnings.push(Warning::Compatibility {
            feature: "stop_sequences".to_string(),
            details: format!(
                "at most {limit} stop sequences are supported; dropped {}",
                out.len() - limit
            ),
        });
        out.truncate(limit);
    }
    out
}
