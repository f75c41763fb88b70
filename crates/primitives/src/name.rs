//! Validated resource identifiers.
//!
//! Devnets are identified by `(namespace, name)` where both components are
//! DNS-label-like: lowercase alphanumerics and `-`, at most 63 characters,
//! starting and ending with an alphanumeric. Node names are derived from the
//! role and index and therefore always valid, but client-supplied node names
//! are re-validated before any path is built from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::node::NodeRole;

const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidName {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} must be at most {MAX_LABEL_LEN} characters, got {len}")]
    TooLong { field: &'static str, len: usize },

    #[error("{field} contains invalid character {c:?}; allowed are lowercase alphanumerics and '-'")]
    InvalidChar { field: &'static str, c: char },

    #[error("{field} must start and end with an alphanumeric character")]
    BadBoundary { field: &'static str },

    #[error("node name {0:?} is not of the form <role>-<index>")]
    BadNodeName(String),
}

fn validate_label(field: &'static str, s: &str) -> Result<(), InvalidName> {
    if s.is_empty() {
        return Err(InvalidName::Empty { field });
    }
    if s.len() > MAX_LABEL_LEN {
        return Err(InvalidName::TooLong { field, len: s.len() });
    }
    if let Some(c) = s.chars().find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(InvalidName::InvalidChar { field, c });
    }
    // `unwrap` is fine, emptiness is checked above.
    let first = s.chars().next().unwrap();
    let last = s.chars().last().unwrap();
    if first == '-' || last == '-' {
        return Err(InvalidName::BadBoundary { field });
    }
    Ok(())
}

macro_rules! label_newtype {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Result<Self, InvalidName> {
                let s = s.into();
                validate_label($field, &s)?;
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = InvalidName;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidName;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(n: $name) -> String {
                n.0
            }
        }
    };
}

label_newtype! {
    /// A devnet namespace.
    Namespace, "namespace"
}

label_newtype! {
    /// A devnet name, unique within its namespace.
    DevnetName, "name"
}

impl Namespace {
    pub const DEFAULT: &'static str = "default";
}

impl Default for Namespace {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

/// A node name of the form `<role>-<index>`, eg. `validator-0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeName {
    role: NodeRole,
    index: u32,
}

impl NodeName {
    pub fn new(role: NodeRole, index: u32) -> Self {
        Self { role, index }
    }

    /// Parses a client-supplied node name. Anything that is not exactly
    /// `<role>-<index>` is rejected, which also rules out path separators and
    /// traversal sequences before a name ever touches the filesystem.
    pub fn parse(s: &str) -> Result<Self, InvalidName> {
        let (role, index) = s.rsplit_once('-').ok_or_else(|| InvalidName::BadNodeName(s.into()))?;
        let role = NodeRole::from_str(role).map_err(|_| InvalidName::BadNodeName(s.into()))?;
        let index = index.parse().map_err(|_| InvalidName::BadNodeName(s.into()))?;
        Ok(Self { role, index })
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.role, self.index)
    }
}

impl TryFrom<String> for NodeName {
    type Error = InvalidName;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<NodeName> for String {
    fn from(n: NodeName) -> String {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn valid_labels() {
        assert!(Namespace::new("default").is_ok());
        assert!(DevnetName::new("d1").is_ok());
        assert!(DevnetName::new("my-devnet-42").is_ok());
    }

    #[test]
    fn invalid_labels() {
        assert_matches!(Namespace::new(""), Err(InvalidName::Empty { .. }));
        assert_matches!(DevnetName::new("Has-Upper"), Err(InvalidName::InvalidChar { .. }));
        assert_matches!(DevnetName::new("-leading"), Err(InvalidName::BadBoundary { .. }));
        assert_matches!(DevnetName::new("trailing-"), Err(InvalidName::BadBoundary { .. }));
        assert_matches!(DevnetName::new("a".repeat(64)), Err(InvalidName::TooLong { .. }));
        assert_matches!(DevnetName::new("no/slash"), Err(InvalidName::InvalidChar { .. }));
    }

    #[test]
    fn node_name_round_trip() {
        let name = NodeName::new(NodeRole::Validator, 0);
        assert_eq!(name.to_string(), "validator-0");
        assert_eq!(NodeName::parse("validator-0").unwrap(), name);

        let name = NodeName::parse("fullnode-2").unwrap();
        assert_eq!(name.role(), NodeRole::Fullnode);
        assert_eq!(name.index(), 2);
    }

    #[test]
    fn node_name_rejects_traversal() {
        assert!(NodeName::parse("../../etc/passwd").is_err());
        assert!(NodeName::parse("validator-0/..").is_err());
        assert!(NodeName::parse("validator-0\\x").is_err());
        assert!(NodeName::parse("validator").is_err());
        assert!(NodeName::parse("sentry-0").is_err());
    }
}
