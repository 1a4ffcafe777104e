//! Path pattern parsing and matching
//!
//! # Supported patterns
//! - `/api/endpoints` - literal segments only
//! - `/api/endpoints/{ep}` - `{ep}` matches one non-empty segment
//! - `/api/forward/{ep}/*` - `*` matches everything after the prefix
//!
//! # Unsupported patterns (will be rejected)
//! - `api/endpoints` - must start with `/`
//! - `/api/*/x` - wildcard must be the last segment
//! - `/api/{a}/{a}` - duplicate parameter names

use percent_encoding::percent_decode_str;
use thiserror::Error;

/// Errors that can occur when parsing a path pattern
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("Pattern must start with '/': {0}")]
    NotAbsolute(String),

    #[error("Wildcard must be the last segment: {0}")]
    WildcardNotLast(String),

    #[error("Invalid parameter segment '{segment}' in {pattern}")]
    InvalidParameter { pattern: String, segment: String },

    #[error("Duplicate parameter '{name}' in {pattern}")]
    DuplicateParameter { pattern: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

/// Parameters extracted from a matched path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams {
    named: Vec<(String, String)>,
    rest: Option<String>,
    invalid: Option<String>,
}

impl RouteParams {
    /// Percent-decoded value of a named parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        self.named
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Remainder matched by a trailing `*`, kept as it appeared in the path
    pub fn rest(&self) -> Option<&str> {
        self.rest.as_deref()
    }

    /// First named parameter whose percent-decoding is not valid UTF-8.
    ///
    /// Such a parameter keeps its raw form and must not be used as an id.
    pub fn invalid_parameter(&self) -> Option<&str> {
        self.invalid.as_deref()
    }
}

/// A validated path pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    pattern: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Parse and validate a pattern string
    ///
    /// # Examples
    /// ```
    /// use meshhub_router::PathPattern;
    ///
    /// let pattern = PathPattern::parse("/api/endpoints/{ep}").unwrap();
    /// let params = pattern.matches("/api/endpoints/e1").unwrap();
    /// assert_eq!(params.get("ep"), Some("e1"));
    /// assert!(pattern.matches("/api/endpoints").is_none());
    /// ```
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let Some(body) = pattern.strip_prefix('/') else {
            return Err(PatternError::NotAbsolute(pattern.to_string()));
        };

        let raw: Vec<&str> = body.split('/').collect();
        let mut segments = Vec::with_capacity(raw.len());
        let mut names: Vec<&str> = Vec::new();

        for (index, segment) in raw.iter().enumerate() {
            if *segment == "*" {
                if index + 1 != raw.len() {
                    return Err(PatternError::WildcardNotLast(pattern.to_string()));
                }
                segments.push(Segment::Wildcard);
            } else if let Some(inner) = segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
            {
                let valid = !inner.is_empty()
                    && inner
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_');
                if !valid {
                    return Err(PatternError::InvalidParameter {
                        pattern: pattern.to_string(),
                        segment: segment.to_string(),
                    });
                }
                if names.contains(&inner) {
                    return Err(PatternError::DuplicateParameter {
                        pattern: pattern.to_string(),
                        name: inner.to_string(),
                    });
                }
                names.push(inner);
                segments.push(Segment::Param(inner.to_string()));
            } else if segment.contains(['{', '}', '*']) {
                return Err(PatternError::InvalidParameter {
                    pattern: pattern.to_string(),
                    segment: segment.to_string(),
                });
            } else {
                segments.push(Segment::Literal(segment.to_string()));
            }
        }

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
        })
    }

    /// Match a request path (without query string)
    pub fn matches(&self, path: &str) -> Option<RouteParams> {
        let mut remaining = Some(path.strip_prefix('/')?);
        let mut params = RouteParams::default();

        for segment in &self.segments {
            match segment {
                Segment::Wildcard => {
                    params.rest = Some(remaining.unwrap_or_default().to_string());
                    return Some(params);
                }
                Segment::Literal(literal) => {
                    let (current, next) = split_segment(remaining?);
                    if current != literal.as_str() {
                        return None;
                    }
                    remaining = next;
                }
                Segment::Param(name) => {
                    let (current, next) = split_segment(remaining?);
                    if current.is_empty() {
                        return None;
                    }
                    let value = match percent_decode_str(current).decode_utf8() {
                        Ok(value) => value.into_owned(),
                        Err(_) => {
                            params.invalid.get_or_insert_with(|| name.clone());
                            current.to_string()
                        }
                    };
                    params.named.push((name.clone(), value));
                    remaining = next;
                }
            }
        }

        remaining.is_none().then_some(params)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn split_segment(path: &str) -> (&str, Option<&str>) {
    match path.split_once('/') {
        Some((current, next)) => (current, Some(next)),
        None => (path, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        let pattern = PathPattern::parse("/api/endpoints").unwrap();
        assert!(pattern.matches("/api/endpoints").is_some());
        assert!(pattern.matches("/api/endpoints/").is_none());
        assert!(pattern.matches("/api/endpoints/e1").is_none());
        assert!(pattern.matches("/api").is_none());
        assert!(pattern.matches("api/endpoints").is_none());
    }

    #[test]
    fn test_params_are_extracted_and_decoded() {
        let pattern = PathPattern::parse("/api/endpoints/{ep}/services/{proto}/{svc}").unwrap();
        let params = pattern
            .matches("/api/endpoints/e%201/services/tcp/ssh")
            .unwrap();
        assert_eq!(params.get("ep"), Some("e 1"));
        assert_eq!(params.get("proto"), Some("tcp"));
        assert_eq!(params.get("svc"), Some("ssh"));
        assert_eq!(params.get("missing"), None);
        assert_eq!(params.rest(), None);
    }

    #[test]
    fn test_invalid_utf8_parameter_is_flagged() {
        let pattern = PathPattern::parse("/api/services/{proto}/{svc}").unwrap();
        let params = pattern.matches("/api/services/tcp/%FF%FE").unwrap();
        assert_eq!(params.invalid_parameter(), Some("svc"));
        assert_eq!(params.get("svc"), Some("%FF%FE"));

        let params = pattern.matches("/api/services/tcp/caf%C3%A9").unwrap();
        assert_eq!(params.invalid_parameter(), None);
        assert_eq!(params.get("svc"), Some("café"));
    }

    #[test]
    fn test_param_requires_non_empty_segment() {
        let pattern = PathPattern::parse("/api/endpoints/{ep}").unwrap();
        assert!(pattern.matches("/api/endpoints/").is_none());
    }

    #[test]
    fn test_wildcard_remainder() {
        let pattern = PathPattern::parse("/api/forward/{ep}/*").unwrap();

        let params = pattern.matches("/api/forward/e1/log/recent").unwrap();
        assert_eq!(params.get("ep"), Some("e1"));
        assert_eq!(params.rest(), Some("log/recent"));

        let params = pattern.matches("/api/forward/e1/").unwrap();
        assert_eq!(params.rest(), Some(""));

        let params = pattern.matches("/api/forward/e1").unwrap();
        assert_eq!(params.rest(), Some(""));

        // Remainder is not decoded
        let params = pattern.matches("/api/forward/e1/a%2Fb").unwrap();
        assert_eq!(params.rest(), Some("a%2Fb"));

        assert!(pattern.matches("/api/forward").is_none());
    }

    #[test]
    fn test_root_pattern() {
        let pattern = PathPattern::parse("/").unwrap();
        assert!(pattern.matches("/").is_some());
        assert!(pattern.matches("/api").is_none());
    }

    #[test]
    fn test_invalid_patterns() {
        assert_eq!(
            PathPattern::parse("api/x"),
            Err(PatternError::NotAbsolute("api/x".to_string()))
        );
        assert!(matches!(
            PathPattern::parse("/api/*/x"),
            Err(PatternError::WildcardNotLast(_))
        ));
        assert!(matches!(
            PathPattern::parse("/api/{}"),
            Err(PatternError::InvalidParameter { .. })
        ));
        assert!(matches!(
            PathPattern::parse("/api/x{y}"),
            Err(PatternError::InvalidParameter { .. })
        ));
        assert!(matches!(
            PathPattern::parse("/api/{a}/{a}"),
            Err(PatternError::DuplicateParameter { .. })
        ));
    }
}
