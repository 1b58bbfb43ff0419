//! Transcript data types

use serde::{Deserialize, Serialize};

/// Document-level directives from the transcript header
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LessonMeta {
    /// `[al:...]` album / book name
    pub album: String,
    /// `[ar:...]` artist / publisher
    pub artist: String,
    /// `[ti:...]` lesson title
    pub title: String,
    /// `[by:...]` transcript author
    pub author: String,
}

impl LessonMeta {
    /// Set a header field by its directive key (case-insensitive)
    pub fn set(&mut self, key: &str, value: &str) {
        let value = value.trim().to_string();
        match key.to_ascii_lowercase().as_str() {
            "al" => self.album = value,
            "ar" => self.artist = value,
            "ti" => self.title = value,
            "by" => self.author = value,
            _ => {}
        }
    }
}

/// One transcript entry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimedLine {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds, `0.0` while unresolved
    pub end: f64,
    /// Target-language sentence
    pub en: String,
    /// Translation, possibly empty
    pub cn: String,
}

impl TimedLine {
    pub fn new(start: f64, en: impl Into<String>, cn: impl Into<String>) -> Self {
        Self {
            start,
            end: 0.0,
            en: en.into(),
            cn: cn.into(),
        }
    }

    /// Whether `end` holds a usable boundary
    pub fn has_end(&self) -> bool {
        self.end > 0.0 && self.end > self.start
    }
}

/// A parsed lesson transcript
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub meta: LessonMeta,
    pub lines: Vec<TimedLine>,
    #[serde(skip)]
    duration_applied: bool,
}

impl Transcript {
    /// Build a transcript and link each line's end to the next line's start
    pub fn new(meta: LessonMeta, mut lines: Vec<TimedLine>) -> Self {
        let starts: Vec<f64> = lines.iter().skip(1).map(|l| l.start).collect();
        for (line, next_start) in lines.iter_mut().zip(starts.iter().copied()) {
            line.end = next_start;
        }
        if let Some(last) = lines.last_mut() {
            last.end = 0.0;
        }
        Self {
            meta,
            lines,
            duration_applied: false,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TimedLine> {
        self.lines.get(index)
    }

    /// Patch the last line's end once the audio duration is known
    ///
    /// Applies on the first call with a usable duration only. Returns true
    /// when the last line's end changed.
    pub fn resolve_duration(&mut self, duration: f64) -> bool {
        if self.duration_applied || !duration.is_finite() || duration <= 0.0 {
            return false;
        }
        self.duration_applied = true;
        let Some(last) = self.lines.last_mut() else {
            return false;
        };
        if last.end <= 0.0 || last.end <= last.start || last.end > duration {
            last.end = duration;
            return true;
        }
        false
    }

    /// Whether the audio duration has been applied to the last line
    pub fn duration_resolved(&self) -> bool {
        self.duration_applied
    }
}
