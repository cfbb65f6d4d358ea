// Copyright (c) 2026 The Trireme developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use quick_error::quick_error;
use regex::Regex;

quick_error! {
    /// Why a path pattern failed to compile.
    #[derive(Debug)]
    pub enum PatternError {
        DuplicateParameter(name: String) {
            display("parameter {{{}}} appears more than once", name)
        }
        EmptyParameterName {
            display("empty parameter name")
        }
        UnclosedBrace {
            display("unclosed {{ in pattern")
        }
        BadRegex(err: regex::Error) {
            from()
            display("invalid parameter regex: {}", err)
        }
    }
}

/// A compiled route pattern.
///
/// The pattern language has four constructs:
///
/// - static segments, matched literally;
/// - `{name}`, matching a non-slash run captured as parameter `name`;
/// - `{name:regex}`, matching the given regex captured as `name`;
/// - `*`, matching any run, slashes included, without capturing.
///
/// Compilation happens once at registration: the source is turned into a
/// regular expression anchored at both ends, plus the ordered list of
/// parameter names. Parameter names must be unique within one pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
    params: Vec<String>,
}

impl Pattern {
    pub fn compile(source: &str) -> Result<Pattern, PatternError> {
        let mut expr = String::with_capacity(source.len() + 16);
        expr.push('^');

        let mut params: Vec<String> = Vec::new();
        let mut literal = String::new();
        let bytes = source.as_bytes();
        let mut i = 0;

        while i < source.len() {
            match bytes[i] {
                b'{' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();

                    // Find the matching closing brace; the parameter regex
                    // may itself contain braces (e.g. `{id:\d{2,4}}`).
                    let mut depth = 1usize;
                    let mut j = i + 1;
                    while j < source.len() {
                        match bytes[j] {
                            b'{' => depth += 1,
                            b'}' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        j += 1;
                    }
                    if depth != 0 {
                        return Err(PatternError::UnclosedBrace);
                    }

                    let inner = &source[i + 1..j];
                    let (name, sub) = match inner.find(':') {
                        Some(colon) => (&inner[..colon], Some(&inner[colon + 1..])),
                        None => (inner, None),
                    };
                    if name.is_empty() {
                        return Err(PatternError::EmptyParameterName);
                    }
                    if params.iter().any(|p| p == name) {
                        return Err(PatternError::DuplicateParameter(name.to_owned()));
                    }

                    // Named groups keep captures stable even when the
                    // parameter regex contains groups of its own.
                    expr.push_str(&format!("(?P<cap{}>", params.len()));
                    expr.push_str(sub.unwrap_or("[^/]+"));
                    expr.push(')');
                    params.push(name.to_owned());

                    i = j + 1;
                }
                b'*' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(".*");
                    i += 1;
                }
                _ => {
                    // Advance one full character, not one byte.
                    let ch = source[i..].chars().next().unwrap_or('\u{fffd}');
                    literal.push(ch);
                    i += ch.len_utf8();
                }
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        Ok(Pattern {
            source: source.to_owned(),
            regex: Regex::new(&expr)?,
            params,
        })
    }

    /// Matches `path` against the whole pattern and returns the captured
    /// parameters, in declaration order.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let captures = self.regex.captures(path)?;
        Some(
            self.params
                .iter()
                .enumerate()
                .map(|(idx, name)| {
                    let value = captures
                        .name(&format!("cap{}", idx))
                        .map(|m| m.as_str().to_owned())
                        .unwrap_or_default();
                    (name.clone(), value)
                })
                .collect(),
        )
    }

    /// The pattern as it was registered.
    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parameter names, in the order they appear in the pattern.
    #[inline]
    pub fn params(&self) -> &[String] {
        &self.params
    }
}

/// Computes a priority from a pattern's shape: static segments score high,
/// parameter and wildcard segments are penalized, longer patterns win ties.
///
/// This is the deprecated alternative to explicit priorities; nothing uses
/// it unless a caller passes its result to route registration.
pub fn heuristic_priority(source: &str) -> i32 {
    let mut score = 0i32;
    for segment in source.split('/').filter(|s| !s.is_empty()) {
        if segment.contains('{') || segment.contains('*') {
            score -= 50;
        } else {
            score += 100;
        }
    }
    score + source.len() as i32
}
