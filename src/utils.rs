//! Utility functions

use once_cell::sync::Lazy;
use regex::Regex;

static CJK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\u{3400}-\u{9FFF}\u{F900}-\u{FAFF}]").expect("static regex"));

/// Whether the text contains a CJK ideograph
pub fn has_cjk(text: &str) -> bool {
    CJK_RE.is_match(text)
}

/// Count whitespace-separated words
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Format seconds as `mm:ss`
pub fn format_time(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "00:00".to_string();
    }
    let total = seconds.floor() as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Format seconds as an LRC tag body `mm:ss.xx`
pub fn format_lrc_time(seconds: f64) -> String {
    let centis = (seconds.max(0.0) * 100.0).round() as u64;
    format!(
        "{:02}:{:02}.{:02}",
        centis / 6000,
        (centis / 100) % 60,
        centis % 100
    )
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
