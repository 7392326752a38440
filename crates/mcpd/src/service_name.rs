use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use serde::Serialize;

/// A validated service name. Doubles as the namespacing prefix for external
/// tool names, so the character set matters: underscores are allowed (the
/// router resolves the ambiguity with longest-prefix matching).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceName(Box<str>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceNameError {
    #[error("service name must not be empty")]
    Empty,
    #[error("invalid service name: {0} (allowed: [A-Za-z0-9_-]+)")]
    Invalid(String),
}

impl ServiceName {
    pub fn parse(name: impl AsRef<str>) -> Result<Self, ServiceNameError> {
        let name = name.as_ref().trim();
        if name.is_empty() {
            return Err(ServiceNameError::Empty);
        }
        if !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
        {
            return Err(ServiceNameError::Invalid(name.to_string()));
        }
        Ok(Self(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ServiceName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for ServiceName {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl Serialize for ServiceName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl TryFrom<&str> for ServiceName {
    type Error = ServiceNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ServiceName> for String {
    fn from(value: ServiceName) -> Self {
        value.0.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_underscores_and_dashes() {
        assert!(ServiceName::parse("a_b-c2").is_ok());
    }

    #[test]
    fn rejects_empty_and_punctuation() {
        assert_eq!(ServiceName::parse("  "), Err(ServiceNameError::Empty));
        assert!(matches!(
            ServiceName::parse("a.b"),
            Err(ServiceNameError::Invalid(_))
        ));
    }
}
