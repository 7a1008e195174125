//! XMPP addresses (`node@domain/resource`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InvalidParameterError;

/// A parsed XMPP address. Node and domain are case-folded so that bare
/// addresses can be used as map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn parse(input: &str) -> Result<Self, InvalidParameterError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(InvalidParameterError::new("empty address"));
        }

        // The resource may itself contain '@' or '/', so split it off first.
        let (bare, resource) = match input.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (input, None),
        };
        let (node, domain) = match bare.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, bare),
        };

        if domain.is_empty() {
            return Err(InvalidParameterError::new(format!("address without domain: {input}")));
        }
        if node.is_some_and(str::is_empty) {
            return Err(InvalidParameterError::new(format!("empty local part: {input}")));
        }
        if resource.is_some_and(str::is_empty) {
            return Err(InvalidParameterError::new(format!("empty resource: {input}")));
        }

        Ok(Self {
            node: node.map(str::to_lowercase),
            domain: domain.to_lowercase(),
            resource: resource.map(str::to_string),
        })
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// `node@domain` without the resource.
    pub fn bare(&self) -> String {
        match &self.node {
            Some(node) => format!("{}@{}", node, self.domain),
            None => self.domain.clone(),
        }
    }

    /// Full address including the resource when there is one.
    pub fn full(&self) -> String {
        match &self.resource {
            Some(resource) => format!("{}/{}", self.bare(), resource),
            None => self.bare(),
        }
    }

    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: impl Into<String>) -> Jid {
        let resource = resource.into();
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: (!resource.is_empty()).then_some(resource),
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full())
    }
}

impl FromStr for Jid {
    type Err = InvalidParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s)
    }
}

impl TryFrom<String> for Jid {
    type Error = InvalidParameterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Jid::parse(&value)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_jid() {
        let jid = Jid::parse("Alice@Example.COM/Laptop").unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), Some("Laptop"));
        assert_eq!(jid.bare(), "alice@example.com");
        assert_eq!(jid.full(), "alice@example.com/Laptop");
    }

    #[test]
    fn test_parse_domain_only() {
        let jid = Jid::parse("conference.example.com").unwrap();
        assert!(jid.node().is_none());
        assert!(jid.is_bare());
        assert_eq!(jid.bare(), "conference.example.com");
    }

    #[test]
    fn test_resource_may_contain_separators() {
        let jid = Jid::parse("room@muc.example.com/nick/with@chars").unwrap();
        assert_eq!(jid.bare(), "room@muc.example.com");
        assert_eq!(jid.resource(), Some("nick/with@chars"));
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        assert!(Jid::parse("").is_err());
        assert!(Jid::parse("@example.com").is_err());
        assert!(Jid::parse("alice@").is_err());
        assert!(Jid::parse("alice@example.com/").is_err());
    }

    #[test]
    fn test_with_resource_empty_gives_bare() {
        let jid = Jid::parse("alice@example.com/a").unwrap();
        assert!(jid.with_resource("").is_bare());
        assert_eq!(jid.with_resource("b").full(), "alice@example.com/b");
    }

    #[test]
    fn test_serde_as_string() {
        let jid = Jid::parse("bob@example.com/phone").unwrap();
        let json = serde_json::to_string(&jid).unwrap();
        assert_eq!(json, "\"bob@example.com/phone\"");
        let back: Jid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, jid);
    }
}
