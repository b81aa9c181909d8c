//! Edges (subscription orders) between stages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Network address of a published key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub interface: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(interface: impl Into<String>, port: u16) -> Self {
        Self {
            interface: interface.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.interface, self.port)
    }
}

/// How chunks travel along an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// In-process bounded channel.
    Local,
    /// Through the board's network transport, at this endpoint.
    Network(Endpoint),
}

impl Transport {
    pub fn is_local(&self) -> bool {
        matches!(self, Transport::Local)
    }
}

/// A declared data dependency: `source.source_key` feeds `destination.destination_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub source_key: String,
    pub destination: String,
    pub destination_key: String,
    pub transport: Transport,
}

impl fmt::Display for EdgeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source, self.source_key, self.destination, self.destination_key
        )?;
        if let Transport::Network(endpoint) = &self.transport {
            write!(f, " via {}", endpoint)?;
        }
        Ok(())
    }
}

/// Handle to an edge declared on a board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeHandle {
    pub(crate) index: usize,
    spec: EdgeSpec,
}

impl EdgeHandle {
    pub(crate) fn new(index: usize, spec: EdgeSpec) -> Self {
        Self { index, spec }
    }

    pub fn spec(&self) -> &EdgeSpec {
        &self.spec
    }
}

/// Inbound edge whose publisher lives outside this board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NetworkInput {
    pub endpoint: Endpoint,
    pub sender_key: String,
    pub destination: String,
    pub destination_key: String,
}

/// Outbound key published to a network endpoint for other boards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NetworkOutput {
    pub source: String,
    pub source_key: String,
    pub endpoint: Endpoint,
}
