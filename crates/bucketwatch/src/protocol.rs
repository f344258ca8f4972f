//! Delivery transports a handler can use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Transport of a handler endpoint, named as the topic broker names it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Queue, endpoint is the queue ARN
    Sqs,
    /// Function, endpoint is the function ARN
    Lambda,
    /// Plain HTTP webhook
    Http,
    /// HTTPS webhook
    Https,
}

impl Protocol {
    /// All known protocols.
    pub const ALL: [Protocol; 4] = [
        Protocol::Sqs,
        Protocol::Lambda,
        Protocol::Http,
        Protocol::Https,
    ];

    /// Wire name of the protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Sqs => "sqs",
            Protocol::Lambda => "lambda",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    /// Checks that `endpoint` is addressable by this transport.
    pub fn validate_endpoint(&self, endpoint: &str) -> Result<()> {
        let ok = match self {
            Protocol::Sqs => is_service_arn(endpoint, "sqs"),
            Protocol::Lambda => is_service_arn(endpoint, "lambda"),
            Protocol::Http => has_host(endpoint, "http://"),
            Protocol::Https => has_host(endpoint, "https://"),
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidRequest(format!(
                "endpoint {:?} is not a valid {} endpoint",
                endpoint,
                self.as_str()
            )))
        }
    }
}

fn is_service_arn(endpoint: &str, service: &str) -> bool {
    // arn:<partition>:<service>:<region>:<account>:<resource>
    let parts: Vec<&str> = endpoint.splitn(6, ':').collect();
    parts.len() == 6 && parts[0] == "arn" && parts[2] == service && !parts[5].is_empty()
}

fn has_host(endpoint: &str, scheme: &str) -> bool {
    endpoint
        .strip_prefix(scheme)
        .map(|rest| !rest.is_empty() && !rest.starts_with('/'))
        .unwrap_or(false)
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Protocol::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::UnsupportedProtocol(s.to_string()))
    }
}

/// The set of protocols this deployment accepts.
#[derive(Clone, Debug)]
pub struct ProtocolRegistry {
    enabled: BTreeSet<Protocol>,
}

impl ProtocolRegistry {
    /// Registry accepting exactly `protocols`.
    pub fn new(protocols: impl IntoIterator<Item = Protocol>) -> Self {
        Self {
            enabled: protocols.into_iter().collect(),
        }
    }

    /// Returns true if the protocol is enabled.
    pub fn is_enabled(&self, protocol: Protocol) -> bool {
        self.enabled.contains(&protocol)
    }

    /// Parses a protocol name and validates the endpoint for it.
    pub fn resolve(&self, name: &str, endpoint: &str) -> Result<Protocol> {
        let protocol: Protocol = name.parse()?;
        if !self.is_enabled(protocol) {
            return Err(EngineError::UnsupportedProtocol(name.to_string()));
        }
        protocol.validate_endpoint(endpoint)?;
        Ok(protocol)
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new(Protocol::ALL)
    }
}
