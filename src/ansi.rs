//! ANSI escape code handling
//!
//! Runtimes such as wrangler color their terminal output. When that output is
//! relayed through the host's streams the escape codes are stripped first so the
//! host's own prefixes and colors stay readable.

use regex::Regex;
use std::sync::LazyLock;

/// Regex pattern for ANSI escape sequences.
///
/// Covers:
/// - CSI sequences: ESC [ ... letter (colors, cursor movement, erase line)
/// - OSC sequences: ESC ] ... BEL or ST (hyperlinks, window titles)
/// - Simple two-byte escapes: ESC letter
static ANSI_ESCAPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \x1b\[[0-9;?]*[A-Za-z]               # CSI sequences
        | \x1b\][^\x07\x1b]*(?:\x07|\x1b\\)  # OSC sequences
        | \x1b[A-Za-z]                       # Simple escapes
        ",
    )
    .expect("ANSI regex pattern is valid")
});

/// Strip all ANSI escape sequences from a string.
///
/// ```
/// use funcgate::ansi::strip_ansi_codes;
///
/// assert_eq!(strip_ansi_codes("\x1b[32m✨ Compiled Worker\x1b[0m"), "✨ Compiled Worker");
/// ```
pub fn strip_ansi_codes(input: &str) -> String {
    ANSI_ESCAPE_PATTERN.replace_all(input, "").into_owned()
}
