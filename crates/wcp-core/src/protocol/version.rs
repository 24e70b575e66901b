//! Protocol version parsing and compatibility.
//!
//! Versions travel as `"major.minor"` strings.  Negotiation is
//! server-authoritative: the server always answers with its own version, and
//! accepts any client whose major version matches.  A bare major (`"0"`) is
//! read as `major.0`, which is what early clients send.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Version spoken by this implementation.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(0, 1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("empty version string")]
    Empty,
    #[error("invalid version component {component:?} in {input:?}")]
    InvalidComponent { input: String, component: String },
    #[error("too many version components in {0:?}")]
    TooManyComponents(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Two versions interoperate when their major numbers agree.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.is_empty() {
            return Err(VersionError::Empty);
        }

        let mut parts = input.split('.');
        let parse = |component: &str| {
            component
                .parse::<u16>()
                .map_err(|_| VersionError::InvalidComponent {
                    input: input.to_string(),
                    component: component.to_string(),
                })
        };

        // `split` always yields at least one item.
        let major = parse(parts.next().unwrap_or_default())?;
        let minor = match parts.next() {
            Some(component) => parse(component)?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(VersionError::TooManyComponents(input.to_string()));
        }

        Ok(Self { major, minor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_major_minor() {
        let v: ProtocolVersion = "1.4".parse().unwrap();
        assert_eq!(v, ProtocolVersion::new(1, 4));
    }

    #[test]
    fn test_parse_bare_major_defaults_minor_to_zero() {
        let v: ProtocolVersion = "0".parse().unwrap();
        assert_eq!(v, ProtocolVersion::new(0, 0));
    }

    #[test]
    fn test_parse_tolerates_surrounding_whitespace() {
        let v: ProtocolVersion = " 0.1 ".parse().unwrap();
        assert_eq!(v, PROTOCOL_VERSION);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!("".parse::<ProtocolVersion>(), Err(VersionError::Empty));
        assert!(matches!(
            "one.two".parse::<ProtocolVersion>(),
            Err(VersionError::InvalidComponent { .. })
        ));
        assert!(matches!(
            "1.".parse::<ProtocolVersion>(),
            Err(VersionError::InvalidComponent { .. })
        ));
        assert!(matches!(
            "1.2.3".parse::<ProtocolVersion>(),
            Err(VersionError::TooManyComponents(_))
        ));
        assert!(matches!(
            "-1.0".parse::<ProtocolVersion>(),
            Err(VersionError::InvalidComponent { .. })
        ));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let v = ProtocolVersion::new(3, 12);
        assert_eq!(v.to_string().parse::<ProtocolVersion>(), Ok(v));
    }

    #[test]
    fn test_compatibility_depends_on_major_only() {
        let server = ProtocolVersion::new(0, 1);
        assert!(server.is_compatible_with(&ProtocolVersion::new(0, 0)));
        assert!(server.is_compatible_with(&ProtocolVersion::new(0, 9)));
        assert!(!server.is_compatible_with(&ProtocolVersion::new(1, 1)));
    }
}
