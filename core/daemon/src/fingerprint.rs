//! Turn fingerprints used to pair transcript entries with captured turns.
//!
//! This is a heuristic. Two turns whose first 200 normalized characters agree
//! share a fingerprint; the reconciler compares full normalized text to tell
//! them apart.

use turnwatch_protocol::Actor;

pub const FINGERPRINT_TEXT_CHARS: usize = 200;

/// Trims and collapses every whitespace run to a single space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn fingerprint(actor: Actor, text: &str) -> String {
    let normalized = normalize_text(text);
    let truncated: String = normalized.chars().take(FINGERPRINT_TEXT_CHARS).collect();
    let source = format!("{}:{}", actor.as_str(), truncated);
    format!("{:x}", md5::compute(source))
}
