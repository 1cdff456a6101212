//! Registered host names.
//!
//! # Design Decisions
//! - Stored lowercase with any trailing dot removed, so `Shop.Local.` and
//!   `shop.local` are the same key
//! - Ports are never part of a domain; `host_from_authority` strips them

use std::fmt;
use std::str::FromStr;

/// Error returned when a string is not a usable domain name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("domain name is empty")]
    Empty,
    #[error("domain name {0:?} contains an invalid character")]
    InvalidCharacter(String),
    #[error("domain name {0:?} has an empty label")]
    EmptyLabel(String),
}

/// A normalized, case-insensitive host name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Domain(String);

impl Domain {
    /// Parse and normalize a domain name.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(DomainError::Empty);
        }

        let normalized = trimmed.to_ascii_lowercase();
        if !normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
        {
            return Err(DomainError::InvalidCharacter(raw.to_string()));
        }
        if normalized.split('.').any(str::is_empty) {
            return Err(DomainError::EmptyLabel(raw.to_string()));
        }

        Ok(Self(normalized))
    }

    /// Extract the domain from a `Host` header value or URI authority.
    ///
    /// Returns `None` for IP literals and anything that does not parse.
    pub fn from_authority(authority: &str) -> Option<Self> {
        let host = host_from_authority(authority);
        if host.parse::<std::net::IpAddr>().is_ok() {
            return None;
        }
        Self::parse(host).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Strip an optional port (and IPv6 brackets) from an authority.
pub fn host_from_authority(authority: &str) -> &str {
    let authority = authority.trim();
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

impl FromStr for Domain {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_trailing_dot() {
        let a = Domain::parse("Shop.Local.").unwrap();
        let b = Domain::parse("shop.local").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "shop.local");
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Domain::parse(""), Err(DomainError::Empty));
        assert_eq!(Domain::parse("."), Err(DomainError::Empty));
        assert!(matches!(Domain::parse("a b"), Err(DomainError::InvalidCharacter(_))));
        assert!(matches!(Domain::parse("a..b"), Err(DomainError::EmptyLabel(_))));
        assert!(matches!(Domain::parse("shop/local"), Err(DomainError::InvalidCharacter(_))));
    }

    #[test]
    fn authority_strips_port() {
        assert_eq!(host_from_authority("shop.local:8080"), "shop.local");
        assert_eq!(host_from_authority("shop.local"), "shop.local");
        assert_eq!(host_from_authority("[::1]:80"), "::1");
        assert_eq!(
            Domain::from_authority("SHOP.local:80"),
            Some(Domain::parse("shop.local").unwrap())
        );
    }

    #[test]
    fn ip_literals_are_not_domains() {
        assert_eq!(Domain::from_authority("127.0.0.1:8080"), None);
        assert_eq!(Domain::from_authority("[::1]:80"), None);
    }
}
