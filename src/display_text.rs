//! Text helpers for compact now-playing displays.

use crate::playback_state::{TimeMark, TrackPosition};

const ELLIPSIS: char = '…';

/// Formats milliseconds as `m:ss`.
pub fn format_timestamp(ms: u64) -> String {
    TimeMark::from_ms(ms).to_string()
}

/// Formats a position as `m:ss / m:ss`.
pub fn format_position(position: &TrackPosition) -> String {
    format!("{} / {}", position.elapsed_mark(), position.total_mark())
}

/// Shortens `title` to at most `max_chars` characters, ending in an ellipsis.
///
/// Output never exceeds `max_chars`, so applying the transform again returns
/// the same string.
pub fn truncate_title(title: &str, max_chars: usize) -> String {
    if title.chars().count() <= max_chars {
        return title.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let kept: String = title.chars().take(max_chars - 1).collect();
    format!("{}{ELLIPSIS}", kept.trim_end())
}
