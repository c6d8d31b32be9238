use crate::reference::ArtifactReference;
use crate::{Result, TrustError};
use globset::{GlobBuilder, GlobMatcher};
use std::collections::HashMap;
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

const GLOB_META: &[char] = &['*', '?', '[', ']', '{', '}'];

/// Glob over the location of an artifact.
///
/// A pattern without `/` is matched against the registry host
/// (`*.example.io`); otherwise against `host/repository`
/// (`registry.example.io/team/*`). `*` never crosses a `/`.
#[derive(Debug, Clone)]
pub struct Scope {
    pattern: String,
    matcher: GlobMatcher,
    host_only: bool,
    /// Token sequences of the pattern, one per `{a,b}` alternative.
    alternatives: Vec<Vec<Token>>,
}

impl Scope {
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(TrustError::Config("scope must not be empty".into()));
        }

        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| TrustError::Config(format!("invalid scope '{}': {}", pattern, e)))?
            .compile_matcher();

        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
            host_only: !pattern.contains('/'),
            alternatives: expand(pattern),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, reference: &ArtifactReference) -> bool {
        if self.host_only {
            self.matcher.is_match(&reference.registry)
        } else {
            self.matcher.is_match(reference.scope_target())
        }
    }

    /// Number of literal characters; the more, the more specific the scope.
    /// Repository scopes always rank above host scopes.
    pub fn specificity(&self) -> (bool, usize) {
        let literal = self.pattern.chars().filter(|c| !GLOB_META.contains(c)).count();
        (!self.host_only, literal)
    }

    /// Whether some location is matched by both scopes. A host scope and a
    /// repository scope never overlap since they match different targets.
    ///
    /// Character classes are approximated, so this may report an overlap
    /// that no real location exhibits, but never misses one.
    pub fn overlaps(&self, other: &Scope) -> bool {
        if self.host_only != other.host_only {
            return false;
        }
        self.alternatives.iter().any(|a| {
            other
                .alternatives
                .iter()
                .any(|b| tokens_overlap(a, b, 0, 0, &mut HashMap::new()))
        })
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for Scope {}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

#[derive(Debug, Clone)]
enum Token {
    Literal(char),
    /// `?`
    AnyChar,
    /// `[...]` with inclusive ranges.
    Class { negated: bool, ranges: Vec<(char, char)> },
    /// `*`, stops at `/`.
    Star,
    /// `**`, crosses `/`.
    DeepStar,
}

impl Token {
    fn is_star(&self) -> bool {
        matches!(self, Token::Star | Token::DeepStar)
    }

    fn accepts(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::AnyChar => c != '/',
            Token::Class { negated, ranges } => {
                ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi) != *negated
            }
            Token::Star | Token::DeepStar => true,
        }
    }

    /// Whether the token can match some character other than `/`.
    fn accepts_plain(&self) -> bool {
        match self {
            Token::Literal(c) => *c != '/',
            Token::Class { negated: false, ranges } => {
                ranges.iter().any(|&(lo, hi)| !(lo == '/' && hi == '/'))
            }
            _ => true,
        }
    }

    /// Whether this star can consume whatever the single character token
    /// (or star) `other` stands for.
    fn absorbs(&self, other: &Token) -> bool {
        match self {
            Token::DeepStar => true,
            Token::Star => other.is_star() || other.accepts_plain(),
            _ => false,
        }
    }

    /// Whether two single character tokens share a character.
    fn meets(&self, other: &Token) -> bool {
        match (self, other) {
            (Token::Literal(c), t) | (t, Token::Literal(c)) => t.accepts(*c),
            (Token::AnyChar, t) | (t, Token::AnyChar) => t.accepts_plain(),
            (
                Token::Class { negated: false, ranges: a },
                Token::Class { negated: false, ranges: b },
            ) => a
                .iter()
                .any(|&(lo, hi)| b.iter().any(|&(other_lo, other_hi)| lo <= other_hi && other_lo <= hi)),
            _ => true,
        }
    }
}

/// Tokenize a glob, expanding `{a,b}` alternatives.
fn expand(pattern: &str) -> Vec<Vec<Token>> {
    let mut alternatives = vec![Vec::new()];
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '{' {
            let body: String = chars.by_ref().take_while(|&n| n != '}').collect();
            let branches: Vec<Vec<Token>> = body.split(',').flat_map(expand).collect();
            alternatives = alternatives
                .iter()
                .flat_map(|prefix| {
                    branches
                        .iter()
                        .map(move |branch| [prefix.as_slice(), branch.as_slice()].concat())
                })
                .collect();
            continue;
        }

        let token = match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                Token::DeepStar
            }
            '*' => Token::Star,
            '?' => Token::AnyChar,
            '[' => class(&mut chars),
            '\\' => Token::Literal(chars.next().unwrap_or('\\')),
            c => Token::Literal(c),
        };
        for alternative in &mut alternatives {
            alternative.push(token.clone());
        }
    }

    alternatives
}

/// Parse a character class body; the opening `[` is already consumed.
fn class(chars: &mut Peekable<Chars<'_>>) -> Token {
    let negated = matches!(chars.peek(), Some('!') | Some('^'));
    if negated {
        chars.next();
    }

    let mut ranges = Vec::new();
    let mut first = true;
    while let Some(c) = chars.next() {
        if c == ']' && !first {
            break;
        }
        first = false;

        if chars.peek() == Some(&'-') {
            let mut lookahead = chars.clone();
            lookahead.next();
            if let Some(&hi) = lookahead.peek().filter(|&&hi| hi != ']') {
                chars.next();
                chars.next();
                ranges.push((c, hi));
                continue;
            }
        }
        ranges.push((c, c));
    }

    Token::Class { negated, ranges }
}

/// Whether some string is matched by both token sequences from positions
/// `i` and `j` onwards.
fn tokens_overlap(
    a: &[Token],
    b: &[Token],
    i: usize,
    j: usize,
    memo: &mut HashMap<(usize, usize), bool>,
) -> bool {
    if let Some(&known) = memo.get(&(i, j)) {
        return known;
    }

    let result = match (a.get(i), b.get(j)) {
        (None, None) => true,
        (Some(x), y) if x.is_star() => {
            tokens_overlap(a, b, i + 1, j, memo)
                || y.map_or(false, |y| x.absorbs(y) && tokens_overlap(a, b, i, j + 1, memo))
        }
        (x, Some(y)) if y.is_star() => {
            tokens_overlap(a, b, i, j + 1, memo)
                || x.map_or(false, |x| y.absorbs(x) && tokens_overlap(a, b, i + 1, j, memo))
        }
        (Some(x), Some(y)) => x.meets(y) && tokens_overlap(a, b, i + 1, j + 1, memo),
        _ => false,
    };

    memo.insert((i, j), result);
    result
}
