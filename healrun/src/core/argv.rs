//! Quote-aware splitting of a command line into an argument vector.
//!
//! Follows POSIX shell word rules for quoting only: no expansion, globbing,
//! pipes or redirection. Commands that need those run in shell mode.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgvError {
    #[error("command is empty")]
    Empty,
    #[error("unbalanced {0} quote")]
    UnbalancedQuote(char),
    #[error("trailing backslash")]
    TrailingBackslash,
}

/// Split `command` into words. Single quotes are literal; inside double quotes
/// a backslash only escapes `"`, `\`, `$` and `` ` ``; elsewhere it escapes
/// any character.
pub fn split_command(command: &str) -> Result<Vec<String>, ArgvError> {
    let mut words = Vec::new();
    let mut current = String::new();
    // Distinguishes `''` (an empty word) from no word at all.
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(ArgvError::UnbalancedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(ArgvError::UnbalancedQuote('"')),
                        },
                        Some(c) => current.push(c),
                        None => return Err(ArgvError::UnbalancedQuote('"')),
                    }
                }
            }
            '\\' => {
                in_word = true;
                current.push(chars.next().ok_or(ArgvError::TrailingBackslash)?);
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    if words.is_empty() {
        return Err(ArgvError::Empty);
    }
    Ok(words)
}
