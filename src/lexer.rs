//! Splitting of an input line into tokens.

/// Token that separates the segments of a pipeline.
pub const PIPE: &str = "|";
/// Trailing token that sends a command line to the background.
pub const BACKGROUND: &str = "&";

/// Splits `line` on ASCII whitespace.
///
/// No quoting is recognised; operators must stand alone (`a | b`, not `a|b`).
/// A blank line yields no tokens.
pub fn split_into_tokens(line: &str) -> Vec<String> {
    line.split_ascii_whitespace().map(str::to_owned).collect()
}

/// Removes a trailing background marker, reporting whether one was present.
pub fn strip_background(tokens: &mut Vec<String>) -> bool {
    if tokens.last().is_some_and(|t| t == BACKGROUND) {
        tokens.pop();
        true
    } else {
        false
    }
}
