use std::collections::BTreeMap;

pub const MAX_SCORE: f64 = 100.0;

pub type IaScores = BTreeMap<String, f64>;

pub fn default_assessment_names() -> Vec<String> {
    vec!["IA1".to_string(), "IA2".to_string(), "IA3".to_string()]
}

pub fn score_in_range(score: f64, max_score: f64) -> bool {
    score.is_finite() && (0.0..=max_score).contains(&score)
}

/// 1-decimal rounding used for IA averages on the marks page.
pub fn round_1_decimal(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Mean over the configured assessment names; an assessment without a score
/// counts as 0.
pub fn ia_average(scores: &IaScores, names: &[String]) -> f64 {
    if names.is_empty() {
        return 0.0;
    }
    let sum: f64 = names
        .iter()
        .map(|n| scores.get(n).copied().unwrap_or(0.0))
        .sum();
    round_1_decimal(sum / (names.len() as f64))
}

pub fn normalize_assessment_name(raw: &str) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() || t.len() > 16 {
        return None;
    }
    Some(t.to_ascii_uppercase())
}
