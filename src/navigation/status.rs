//! Single-line status messages

use std::error::Error as StdError;

use crate::providers::root_cause;

/// Longest message shown untouched
pub const STATUS_MAX_CHARS: usize = 69;
const HEAD_CHARS: usize = 42;
const TAIL_CHARS: usize = 21;
const ELLIPSIS: &str = " ... ";

/// Shorten `message` to fit the status line, keeping its start and end
pub fn truncate_message(message: &str) -> String {
    let chars: Vec<char> = message.chars().collect();
    if chars.len() <= STATUS_MAX_CHARS {
        return message.to_string();
    }
    let head: String = chars[..HEAD_CHARS].iter().collect();
    let tail: String = chars[chars.len() - TAIL_CHARS..].iter().collect();
    format!("{}{}{}", head, ELLIPSIS, tail)
}

/// Root cause of `err`, truncated for display
pub fn status_message(err: &(dyn StdError + 'static)) -> String {
    truncate_message(&root_cause(err).to_string())
}
