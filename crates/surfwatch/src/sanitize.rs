//! Helpers for making untrusted values safe for shell command lines and
//! for keeping tool output out of logs and error columns.
//!
//! Tool arguments come from users and from previous scan results, so every
//! value is quoted before it reaches the command binder.

/// Quotes a value for a POSIX shell using single quotes.
///
/// Values made only of characters that are never special to the shell are
/// returned unchanged so that bound commands stay readable.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/' | ',' | '@' | '='))
    {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Truncates text to at most `max_chars` characters, appending an ellipsis
/// marker when anything was cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Returns the program name of a command line (first whitespace-separated
/// word), for span fields that should not carry bound arguments.
pub fn command_program(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("<empty>")
}
