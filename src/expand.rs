//! `$NAME` substitution over a token sequence.

use crate::env::VariableStore;
use regex::{Captures, Regex};
use std::sync::OnceLock;

const VARIABLE_PATTERN: &str = r"\$([^$\s]+)";

// A name runs up to the next `$` or whitespace; a lone `$` never matches.
fn variable_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(VARIABLE_PATTERN).ok()).as_ref()
}

/// Expands every `$NAME` in `token` from `vars`.
///
/// Unset names become the empty string. Substituted text is not rescanned.
/// The result is cut to at most `max_len` bytes.
pub fn expand_token(token: &str, vars: &VariableStore, max_len: usize) -> String {
    let Some(pattern) = variable_pattern() else {
        return truncate_on_char_boundary(token.to_owned(), max_len);
    };
    let expanded = pattern.replace_all(token, |caps: &Captures| vars.get(&caps[1]).to_owned());
    truncate_on_char_boundary(expanded.into_owned(), max_len)
}

/// Expands all tokens of a line in place. Runs once per line.
pub fn expand_tokens(tokens: &mut [String], vars: &VariableStore, max_len: usize) {
    for token in tokens.iter_mut() {
        if token.contains('$') {
            *token = expand_token(token, vars, max_len);
        }
    }
}

fn truncate_on_char_boundary(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}
