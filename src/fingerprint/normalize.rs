//! Function body normalization
//!
//! Two stages, applied in order by the extractor:
//!
//! 1. [`strip_comments`] — remove `//` and `/* */` comments while leaving
//!    string and character literals intact. Comment state carries across
//!    lines; a block comment that never closes swallows the rest of the
//!    body.
//! 2. [`normalize`] — drop all whitespace and braces, lowercase the rest.
//!
//! Stage 2 is idempotent, so re-normalizing an already-normalized body is
//! a no-op.

/// Remove C/C++ comments from a function body.
pub fn strip_comments(source: &str) -> String {
    enum State {
        Code,
        LineComment,
        BlockComment,
        DoubleQuoted,
        SingleQuoted,
    }

    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut state = State::Code;

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                }
                '"' => {
                    out.push(c);
                    state = State::DoubleQuoted;
                }
                '\'' => {
                    out.push(c);
                    state = State::SingleQuoted;
                }
                _ => out.push(c),
            },
            State::LineComment => {
                if c == '\n' {
                    out.push('\n');
                    state = State::Code;
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                }
            }
            State::DoubleQuoted => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == '"' {
                    state = State::Code;
                }
            }
            State::SingleQuoted => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == '\'' {
                    state = State::Code;
                }
            }
        }
    }

    out
}

/// Squeeze a comment-free body: remove all whitespace and braces, lowercase.
pub fn normalize(source: &str) -> String {
    source
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '{' && *c != '}')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Full pipeline: comments out, then squeeze.
pub fn normalized_body(raw: &str) -> String {
    normalize(&strip_comments(raw))
}
