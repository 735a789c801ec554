//! Extraction of container membership from LDP responses.
//!
//! A container GET returns an RDF document whose `ldp:contains`
//! statements enumerate the member URLs. podfs does not need a full RDF
//! stack for that: this module scans the Turtle body for `ldp:contains`
//! predicates (prefixed or as a full IRI) and collects the object IRIs,
//! skipping string literals so quoted text cannot produce false members.
//! Anything the scanner does not understand is ignored rather than
//! rejected; servers embed plenty of vocabulary we do not care about.

use crate::resource::{percent_decode, ResourceKind};
use tracing::trace;
use url::Url;

const CONTAINS_PREFIXED: &str = "ldp:contains";
const CONTAINS_IRI: &str = "http://www.w3.org/ns/ldp#contains";

/// A member discovered in a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Decoded member name, the path segment under the container.
    pub name: String,
    /// Container if the member URL ends with a slash.
    pub kind: ResourceKind,
}

/// Parses the members of `container_url` out of a Turtle document.
///
/// Member URLs may be absolute or relative; they are resolved against
/// the container URL and reduced to the single path segment below it.
/// Members that do not sit directly under the container are dropped.
pub fn parse_members(container_url: &Url, turtle: &str) -> Vec<Member> {
    let mut members = Vec::new();
    for iri in contains_objects(turtle) {
        let Ok(resolved) = container_url.join(&iri) else {
            trace!(iri, "skipping unresolvable member IRI");
            continue;
        };
        let Some(member) = member_name(container_url, &resolved) else {
            trace!(url = %resolved, "skipping member outside container");
            continue;
        };
        members.push(member);
    }
    members
}

/// Reduces a member URL to its name segment under the container.
fn member_name(container_url: &Url, member_url: &Url) -> Option<Member> {
    let base = container_url.as_str();
    let member = member_url.as_str();
    let rest = member.strip_prefix(base)?;
    if rest.is_empty() {
        return None;
    }
    let (segment, kind) = match rest.strip_suffix('/') {
        Some(stripped) => (stripped, ResourceKind::Container),
        None => (rest, ResourceKind::Resource),
    };
    // A nested path means the statement was not a direct member.
    if segment.is_empty() || segment.contains('/') {
        return None;
    }
    Some(Member {
        name: percent_decode(segment),
        kind,
    })
}

/// Yields every object IRI of an `ldp:contains` statement.
fn contains_objects(turtle: &str) -> Vec<String> {
    let mut objects = Vec::new();
    let mut tokens = Tokenizer::new(turtle);
    let mut previous_was_contains = false;
    while let Some(token) = tokens.next_token() {
        match token {
            Token::Word(w) if w == CONTAINS_PREFIXED => previous_was_contains = true,
            Token::Iri(iri) if previous_was_contains => objects.push(iri),
            Token::Iri(iri) if iri == CONTAINS_IRI => previous_was_contains = true,
            // Commas continue an object list; anything else ends it.
            Token::Punct(',') if previous_was_contains => {}
            _ => previous_was_contains = false,
        }
    }
    objects
}

enum Token {
    Iri(String),
    Word(String),
    Punct(char),
}

/// Minimal Turtle-subset tokenizer: IRIs, bare words, punctuation.
/// String literals and comments are consumed and discarded.
struct Tokenizer<'a> {
    rest: &'a str,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn next_token(&mut self) -> Option<Token> {
        loop {
            self.rest = self.rest.trim_start();
            let mut chars = self.rest.char_indices();
            let (_, first) = chars.next()?;
            match first {
                '<' => {
                    let end = self.rest.find('>')?;
                    let iri = self.rest[1..end].to_string();
                    self.rest = &self.rest[end + 1..];
                    return Some(Token::Iri(iri));
                }
                '"' => {
                    // Skip the literal, honoring backslash escapes.
                    let mut escaped = false;
                    let mut close = None;
                    for (i, c) in self.rest[1..].char_indices() {
                        if escaped {
                            escaped = false;
                        } else if c == '\\' {
                            escaped = true;
                        } else if c == '"' {
                            close = Some(i + 1);
                            break;
                        }
                    }
                    self.rest = &self.rest[close? + 1..];
                }
                '#' => {
                    let end = self.rest.find('\n').unwrap_or(self.rest.len());
                    self.rest = &self.rest[end..];
                }
                ',' | ';' | '.' | '[' | ']' | '(' | ')' => {
                    self.rest = &self.rest[first.len_utf8()..];
                    return Some(Token::Punct(first));
                }
                _ => {
                    let end = self
                        .rest
                        .find(|c: char| {
                            c.is_whitespace() || matches!(c, ',' | ';' | '.' | '<' | '"')
                        })
                        .unwrap_or(self.rest.len());
                    let word = self.rest[..end].to_string();
                    self.rest = &self.rest[end..];
                    return Some(Token::Word(word));
                }
            }
        }
    }
}
