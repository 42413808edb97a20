//! Rendering of retrieved fragments into a prompt-ready block of text.

use crate::types::Fragment;

/// Marker placed before every fragment.
pub const BULLET: &str = "• ";

/// Separator placed between fragments.
pub const SEPARATOR: &str = "\n\n";

/// Concatenates fragment texts into a single context block.
///
/// Each fragment is rendered as a bullet and fragments are separated by a
/// blank line, in the order given.  No fragments yields an empty string; it
/// is left to the system instruction to tell the model what to do when the
/// context is empty.
pub fn format_context(fragments: &[Fragment]) -> String {
    fragments
        .iter()
        .map(|fragment| format!("{BULLET}{}", fragment.text))
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}
