//! Tokenizer and structural parser for `WWW-Authenticate` headers
//!
//! Parsing runs in two stages. The tokenizer splits the raw header into
//! literal runs, quoted strings and the two delimiters that matter (`=` and
//! `,`). The structural parser then walks the token stream with a small
//! state machine, resolving the one genuinely ambiguous spot in the grammar:
//! after a comma, a bare name may be either the next parameter key or the
//! start of a whole new challenge scheme.

use std::collections::HashMap;

use super::{ChallengeError, Result};

/// Parameters of one challenge, keyed by parameter name.
pub type ChallengeParams = HashMap<String, String>;

/// All challenges found in one header, keyed by scheme name.
///
/// Duplicate keys are last-write-wins, both for parameters within a scheme
/// and for repeated scheme names.
pub type ChallengeMap = HashMap<String, ChallengeParams>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// A literal run or the contents of a quoted string. Quoting strips the
    /// surrounding quotes, so a quoted `"="` lands here and is never
    /// mistaken for a delimiter.
    Text(String),
    Equals,
    Comma,
}

/// Split a header into tokens.
///
/// Whitespace outside quotes separates literal runs without producing a
/// token. Inside quotes, `\` escapes the next character verbatim; the
/// backslash itself is consumed. A closing quote emits the quoted contents
/// (possibly empty) as one token and forces a token boundary. `=` and `,`
/// always stand alone.
fn tokenize(header: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut pending = String::new();
    let mut chars = header.chars();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        pending.push(escaped);
                    }
                }
                '"' => {
                    quoted = false;
                    tokens.push(Token::Text(std::mem::take(&mut pending)));
                }
                _ => pending.push(c),
            }
            continue;
        }

        match c {
            '"' => {
                flush_pending(&mut tokens, &mut pending);
                quoted = true;
            }
            '=' => {
                flush_pending(&mut tokens, &mut pending);
                tokens.push(Token::Equals);
            }
            ',' => {
                flush_pending(&mut tokens, &mut pending);
                tokens.push(Token::Comma);
            }
            c if c.is_whitespace() => flush_pending(&mut tokens, &mut pending),
            _ => pending.push(c),
        }
    }

    flush_pending(&mut tokens, &mut pending);
    tokens
}

/// Emit the accumulated literal run as a token, unless it is blank.
fn flush_pending(tokens: &mut Vec<Token>, pending: &mut String) {
    if !pending.trim().is_empty() {
        tokens.push(Token::Text(std::mem::take(pending)));
    } else {
        pending.clear();
    }
}

#[derive(Debug)]
enum State {
    Challenge,
    Param,
    Equals(String),
    Value(String),
    Comma,
    ChallengeOrParam,
    EqualsOrParam(String),
}

/// Parse a `WWW-Authenticate`-style header into a challenge map.
///
/// A blank header fails with [`ChallengeError::EmptyInput`]. A header that
/// tokenizes to nothing yields an empty map. Any token sequence the grammar
/// does not accept fails with [`ChallengeError::InvalidHeaderSyntax`].
pub fn parse(header: &str) -> Result<ChallengeMap> {
    if header.trim().is_empty() {
        return Err(ChallengeError::EmptyInput);
    }

    let tokens = tokenize(header);
    if tokens.is_empty() {
        return Ok(ChallengeMap::new());
    }

    let mut result = ChallengeMap::new();
    let mut scheme: Option<String> = None;
    let mut params = ChallengeParams::new();
    let mut state = State::Challenge;

    for token in tokens {
        state = match (state, token) {
            (State::Challenge, Token::Text(name)) => {
                scheme = Some(name);
                State::Param
            }
            (State::Param, Token::Text(key)) => State::Equals(key),
            (State::Equals(key), Token::Equals) => State::Value(key),
            (State::Value(key), Token::Text(value)) => {
                params.insert(key, value);
                State::Comma
            }
            (State::Comma, Token::Comma) => State::ChallengeOrParam,
            (State::ChallengeOrParam, Token::Text(name)) => State::EqualsOrParam(name),
            (State::EqualsOrParam(key), Token::Equals) => State::Value(key),
            (State::EqualsOrParam(next_scheme), Token::Text(key)) => {
                // The ambiguous name was a new scheme after all; the current
                // token is that scheme's first parameter key.
                if let Some(prev) = scheme.replace(next_scheme) {
                    result.insert(prev, std::mem::take(&mut params));
                }
                State::Equals(key)
            }
            _ => return Err(ChallengeError::InvalidHeaderSyntax),
        };
    }

    if let Some(scheme) = scheme {
        result.insert(scheme, params);
    }

    Ok(result)
}
