//! Shell-style argument splitting for template task lines.
//!
//! Rules follow POSIX-shell quoting closely enough for template authors:
//!
//! - `'...'` suppresses all escaping until the closing quote.
//! - `"..."` allows `\"` and `\\`; any other backslash sequence is kept literally.
//! - Outside quotes, `\` escapes the next character and whitespace separates tokens.
//!
//! Malformed input never fails. An unterminated quote closes the token with
//! whatever was accumulated, and a trailing backslash is kept as a literal `\`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between tokens.
    Idle,
    /// Inside an unquoted token (or right after a closing quote).
    Token,
    SingleQuote,
    DoubleQuote,
}

/// Split a command line into argument tokens.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut state = State::Idle;
    let mut escaped = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        if escaped {
            escaped = false;
            current.push(c);
            continue;
        }

        match state {
            State::SingleQuote => {
                if c == '\'' {
                    state = State::Token;
                } else {
                    current.push(c);
                }
            }
            State::DoubleQuote => match c {
                '"' => state = State::Token,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => current.push('\\'),
                },
                _ => current.push(c),
            },
            State::Idle | State::Token => match c {
                '\\' => {
                    escaped = true;
                    state = State::Token;
                }
                '\'' => state = State::SingleQuote,
                '"' => state = State::DoubleQuote,
                c if c.is_whitespace() => {
                    if state == State::Token {
                        tokens.push(std::mem::take(&mut current));
                        state = State::Idle;
                    }
                }
                c => {
                    current.push(c);
                    state = State::Token;
                }
            },
        }
    }

    if escaped {
        current.push('\\');
        tokens.push(current);
    } else if state != State::Idle {
        tokens.push(current);
    }

    tokens
}

/// Render a single argument so that [`tokenize`] yields it back unchanged.
///
/// Plain tokens are returned as-is; anything containing whitespace, quotes or
/// backslashes is wrapped in double quotes with `"` and `\` escaped.
pub fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '"' | '\'' | '\\'));
    if plain {
        return arg.to_string();
    }

    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Join arguments into one displayable command line using [`quote`].
pub fn join(args: &[String]) -> String {
    args.iter().map(|a| quote(a)).collect::<Vec<_>>().join(" ")
}
