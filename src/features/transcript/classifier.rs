//! Intro detection
//!
//! Lesson recordings open with announcements ("Lesson 1 / 第1课", "Listen
//! to the tape then answer...") and often a comprehension question. These
//! helpers find where the actual text begins.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::TimedLine;

static LESSON_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^Lesson\s+\d+$").expect("static regex"));
static LESSON_NUMBER_CN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^第\d+课$").expect("static regex"));
static LISTEN_TAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Listen to the tape").expect("static regex"));

/// Tunable thresholds for intro detection
///
/// The defaults match the timing of the New Concept English recordings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierPolicy {
    /// How many leading lines are examined
    pub scan_limit: usize,
    /// Short bilingual lines starting before this are intro
    pub intro_before: f64,
    /// Short bilingual non-questions starting before this are intro
    pub statement_before: f64,
    /// Character limit for a line to count as "short"
    pub short_chars: usize,
    /// Questions are only skipped within this many leading lines
    pub question_max_index: usize,
    /// Questions are only skipped when starting before this
    pub question_before: f64,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            scan_limit: 10,
            intro_before: 7.0,
            statement_before: 10.0,
            short_chars: 80,
            question_max_index: 6,
            question_before: 20.0,
        }
    }
}

/// Whether a line at `index` is intro material
pub fn should_skip_line(
    line: &TimedLine,
    index: usize,
    skip_questions: bool,
    policy: &ClassifierPolicy,
) -> bool {
    let en = line.en.trim();
    let cn = line.cn.trim();
    if en.is_empty() {
        return true;
    }
    if LESSON_NUMBER_RE.is_match(en) && LESSON_NUMBER_CN_RE.is_match(cn) {
        return true;
    }
    if LISTEN_TAPE_RE.is_match(en) {
        return true;
    }

    if !cn.is_empty()
        && en.chars().count() < policy.short_chars
        && cn.chars().count() < policy.short_chars
    {
        if line.start < policy.intro_before {
            return true;
        }
        if line.start < policy.statement_before && !en.ends_with('?') {
            return true;
        }
    }

    if skip_questions
        && (en.ends_with('?') || cn.ends_with('？'))
        && line.start < policy.question_before
        && index < policy.question_max_index
    {
        return true;
    }

    false
}

/// Index of the first content line
///
/// Returns 0 when the very first line is content, or when every examined
/// line looks like intro.
pub fn find_first_content_index(
    lines: &[TimedLine],
    skip_questions: bool,
    policy: &ClassifierPolicy,
) -> usize {
    let limit = policy.scan_limit.min(lines.len());
    let mut skipped = 0;
    for (i, line) in lines.iter().take(limit).enumerate() {
        if should_skip_line(line, i, skip_questions, policy) {
            skipped += 1;
        } else if skipped > 0 {
            return i;
        } else {
            return 0;
        }
    }
    0
}

/// The two start offsets derived from a transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentOffsets {
    /// First content line, used when "skip intro" is on
    pub first_content: usize,
    /// First content line also skipping leading questions, used by shadow mode
    pub shadow_start: usize,
}

impl ContentOffsets {
    pub fn compute(lines: &[TimedLine], policy: &ClassifierPolicy) -> Self {
        Self {
            first_content: find_first_content_index(lines, false, policy),
            shadow_start: find_first_content_index(lines, true, policy),
        }
    }

    /// Start line for ordinary playback given the skip-intro setting
    pub fn start_index(&self, skip_intro: bool) -> usize {
        if skip_intro { self.first_content } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(start: f64, en: &str, cn: &str) -> TimedLine {
        TimedLine::new(start, en, cn)
    }

    fn lesson() -> Vec<TimedLine> {
        vec![
            line(0.5, "Lesson 1", "第1课"),
            line(2.0, "A private conversation", "私人谈话"),
            line(5.0, "First listen and then answer the question.", "听录音，然后回答问题。"),
            line(8.5, "Why did the writer complain to the people behind him?", "作者为什么向他后面的人抱怨？"),
            line(14.0, "Last week I went to the theatre.", "上星期我去看戏。"),
            line(18.0, "I had a very good seat.", "我的座位很好。"),
        ]
    }

    #[test]
    fn test_skips_lesson_announcement() {
        let policy = ClassifierPolicy::default();
        assert!(should_skip_line(&lesson()[0], 0, false, &policy));
        assert!(should_skip_line(&line(30.0, "Listen to the tape", ""), 0, false, &policy));
        assert!(should_skip_line(&line(30.0, "   ", ""), 0, false, &policy));
    }

    #[test]
    fn test_first_content_keeps_early_question() {
        let policy = ClassifierPolicy::default();
        assert_eq!(find_first_content_index(&lesson(), false, &policy), 3);
    }

    #[test]
    fn test_shadow_start_skips_question() {
        let policy = ClassifierPolicy::default();
        assert_eq!(find_first_content_index(&lesson(), true, &policy), 4);
        let offsets = ContentOffsets::compute(&lesson(), &policy);
        assert_eq!(offsets.first_content, 3);
        assert_eq!(offsets.shadow_start, 4);
        assert_eq!(offsets.start_index(false), 0);
        assert_eq!(offsets.start_index(true), 3);
    }

    #[test]
    fn test_content_first_returns_zero() {
        let policy = ClassifierPolicy::default();
        let lines = vec![line(12.0, "Plain content", ""), line(0.5, "Lesson 2", "第2课")];
        assert_eq!(find_first_content_index(&lines, false, &policy), 0);
    }

    #[test]
    fn test_all_skippable_returns_zero() {
        let policy = ClassifierPolicy::default();
        let lines = vec![line(0.5, "Lesson 3", "第3课"), line(1.0, "Hi", "嗨")];
        assert_eq!(find_first_content_index(&lines, false, &policy), 0);
        assert_eq!(find_first_content_index(&[], false, &policy), 0);
    }

    #[test]
    fn test_idempotent_on_own_slice() {
        let policy = ClassifierPolicy::default();
        let lines = lesson();
        let first = find_first_content_index(&lines, false, &policy);
        assert_eq!(find_first_content_index(&lines[first..], false, &policy), 0);
    }

    #[test]
    fn test_scan_limit_is_configurable() {
        let policy = ClassifierPolicy {
            scan_limit: 2,
            ..ClassifierPolicy::default()
        };
        assert_eq!(find_first_content_index(&lesson(), false, &policy), 0);
    }

    #[test]
    fn test_long_lines_are_not_intro() {
        let policy = ClassifierPolicy::default();
        let long = "x".repeat(90);
        assert!(!should_skip_line(&line(1.0, &long, "中文"), 0, false, &policy));
    }
}
