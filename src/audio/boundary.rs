//! Segment end computation

use super::mode::ReadMode;
use crate::features::transcript::TimedLine;

/// Shortest segment ever produced
pub const MIN_SEGMENT: f64 = 0.2;
/// Pull-in before the next line in single and shadow modes
pub const SINGLE_CUTOFF: f64 = 0.5;
/// Segment length when no later boundary is known yet
pub const UNRESOLVED_SPAN: f64 = 0.5;

/// Play-through end of a line: its end, floored at `MIN_SEGMENT`
pub fn compute_end(line: &TimedLine) -> f64 {
    let floor = line.start.max(0.0) + MIN_SEGMENT;
    if line.has_end() {
        line.end.max(floor)
    } else {
        floor
    }
}

/// Authoritative end of line `index` under `mode`
///
/// Returns 0.0 for an out-of-range index.
pub fn end_for(lines: &[TimedLine], index: usize, mode: ReadMode) -> f64 {
    let Some(line) = lines.get(index) else {
        return 0.0;
    };
    if !mode.uses_cutoff() {
        return compute_end(line);
    }

    let base_end = if line.has_end() {
        line.end
    } else {
        lines.get(index + 1).map(|next| next.start).unwrap_or(0.0)
    };
    if base_end > 0.0 {
        (line.start + MIN_SEGMENT).max(base_end - SINGLE_CUTOFF)
    } else {
        line.start + UNRESOLVED_SPAN
    }
}

/// Index of the line whose `[start, end_for)` range contains `t`
pub fn line_at(lines: &[TimedLine], t: f64, mode: ReadMode) -> Option<usize> {
    lines.iter().enumerate().position(|(i, line)| {
        let end = end_for(lines, i, mode);
        t >= line.start && (end <= 0.0 || t < end)
    })
}
