//! Bilingual LRC transcript parser
//!
//! Lines look like `[mm:ss.xx]English|中文`. A line may carry several
//! concatenated time tags; the first one is the start time. The legacy layout
//! puts the translation on the following row under the identical tag.

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::{LessonMeta, TimedLine, Transcript};
use crate::utils::{format_lrc_time, has_cjk};

static LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^((?:\[\d+:\d+(?:\.\d+)?\])+)(.*)$").expect("static regex"));
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+):(\d+(?:\.\d+)?)\]").expect("static regex"));
static META_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\[(al|ar|ti|by):(.+)\]$").expect("static regex"));

/// Seconds of the first `[mm:ss(.frac)]` tag in `tags`
fn parse_time(tags: &str) -> Option<f64> {
    let caps = TIME_RE.captures(tags)?;
    let min: f64 = caps[1].parse().ok()?;
    let sec: f64 = caps[2].parse().ok()?;
    Some(min * 60.0 + sec)
}

/// Split a body on the first `|` into (primary, translation)
fn split_body(body: &str) -> (String, String) {
    match body.split_once('|') {
        Some((en, rest)) => {
            // Anything after a second separator is discarded
            let cn = rest.split('|').next().unwrap_or_default();
            (en.trim().to_string(), cn.trim().to_string())
        }
        None => (body.trim().to_string(), String::new()),
    }
}

/// Parse transcript text
///
/// Rows without a time tag, and rows whose primary text is empty, are
/// dropped silently.
pub fn parse_transcript(src: &str) -> Transcript {
    let cleaned = src.replace('\r', "");
    let rows: Vec<&str> = cleaned.split('\n').collect();
    let mut meta = LessonMeta::default();
    let mut lines = Vec::with_capacity(rows.len().min(1024));

    let mut i = 0;
    while i < rows.len() {
        let raw = rows[i].trim();
        i += 1;
        if raw.is_empty() {
            continue;
        }
        if let Some(caps) = META_RE.captures(raw) {
            meta.set(&caps[1], &caps[2]);
            continue;
        }
        let Some(caps) = LINE_RE.captures(raw) else {
            continue;
        };
        let tags = &caps[1];
        let Some(start) = parse_time(tags) else {
            continue;
        };
        let body = caps[2].trim();

        let (en, mut cn) = if body.contains('|') {
            split_body(body)
        } else {
            (body.to_string(), String::new())
        };

        if !body.contains('|') && i < rows.len() {
            if let Some(next) = LINE_RE.captures(rows[i].trim()) {
                let next_text = next[2].trim();
                if &next[1] == tags && has_cjk(next_text) {
                    cn = next_text.to_string();
                    i += 1;
                }
            }
        }

        if en.is_empty() {
            tracing::debug!("Dropping transcript row without text at {:.2}s", start);
            continue;
        }
        lines.push(TimedLine::new(start, en, cn));
    }

    // Stable, so rows sharing a timestamp keep document order
    lines.sort_by(|a, b| a.start.total_cmp(&b.start));

    Transcript::new(meta, lines)
}

/// Render a transcript back to single-row bilingual LRC text
pub fn stringify(transcript: &Transcript) -> String {
    let mut out = String::new();
    let meta = &transcript.meta;
    for (key, value) in [
        ("al", &meta.album),
        ("ar", &meta.artist),
        ("ti", &meta.title),
        ("by", &meta.author),
    ] {
        if !value.is_empty() {
            out.push_str(&format!("[{}:{}]\n", key, value));
        }
    }
    for line in &transcript.lines {
        out.push('[');
        out.push_str(&format_lrc_time(line.start));
        out.push(']');
        out.push_str(&line.en);
        if !line.cn.is_empty() {
            out.push('|');
            out.push_str(&line.cn);
        }
        out.push('\n');
    }
    out
}
