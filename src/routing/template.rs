//! Path templates such as `/item/<id>`.
//!
//! A template is an ordered list of segments. Literal segments must equal the
//! request segment byte-for-byte; parameter segments match any single
//! non-empty segment and bind it as text. There are no converters.

use std::collections::HashMap;
use std::fmt;

use percent_encoding::percent_decode_str;

/// Errors raised while parsing a template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("path template {0:?} must start with '/'")]
    MissingLeadingSlash(String),
    #[error("path template {template:?} has a malformed parameter segment {segment:?}")]
    MalformedParameter { template: String, segment: String },
    #[error("path template {template:?} binds parameter {name:?} twice")]
    DuplicateParameter { template: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Extracted path parameters, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(HashMap<String, String>);

impl Params {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A compiled path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        if !raw.starts_with('/') {
            return Err(TemplateError::MissingLeadingSlash(raw.to_string()));
        }

        let mut segments = Vec::new();
        let mut seen = Vec::new();
        for part in split_path(raw) {
            let opens = part.contains('<');
            let closes = part.contains('>');
            if !opens && !closes {
                segments.push(Segment::Literal(part.to_string()));
                continue;
            }

            let name = part
                .strip_prefix('<')
                .and_then(|p| p.strip_suffix('>'))
                .filter(|n| is_identifier(n))
                .ok_or_else(|| TemplateError::MalformedParameter {
                    template: raw.to_string(),
                    segment: part.to_string(),
                })?;
            if seen.contains(&name) {
                return Err(TemplateError::DuplicateParameter {
                    template: raw.to_string(),
                    name: name.to_string(),
                });
            }
            seen.push(name);
            segments.push(Segment::Param(name.to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Same segment count, same literals, parameters in the same positions.
    /// Parameter names are ignored.
    pub fn same_shape(&self, other: &PathTemplate) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|pair| match pair {
                    (Segment::Literal(a), Segment::Literal(b)) => a == b,
                    (Segment::Param(_), Segment::Param(_)) => true,
                    _ => false,
                })
    }

    /// Structural match against a request path. Returns the bound parameters.
    pub fn matches(&self, path: &str) -> Option<Params> {
        let mut parts = split_path(path);
        let mut bound = Vec::new();

        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    if part.is_empty() {
                        return None;
                    }
                    bound.push((name.clone(), decode_segment(part)));
                }
            }
        }

        // Extra trailing segments are a non-match, never a partial one.
        if parts.next().is_some() {
            return None;
        }
        Some(bound.into_iter().collect())
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// `/` → no segments, `/a/b` → `a`, `b`, `/a/` → `a`, ``.
fn split_path(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let empty = trimmed.is_empty();
    trimmed.split('/').filter(move |_| !empty)
}

fn decode_segment(part: &str) -> String {
    match percent_decode_str(part).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => part.to_string(),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
