//! Error types shared across the controller.

use std::io;

use thiserror::Error;

use crate::mac::MacAddr;
use crate::topology::NodeId;

/// Failure to parse an address or identifier from its text form.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Not a colon (or dash) separated 6-byte MAC address.
    #[error("invalid MAC address {0:?}")]
    Mac(String),
    /// Not a hexadecimal datapath id of at most 16 digits.
    #[error("invalid datapath id {0:?}")]
    Dpid(String),
    /// Neither a datapath id nor a MAC address.
    #[error("invalid node identifier {0:?}")]
    Node(String),
}

/// Errors raised by topology queries and path management.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Both endpoints exist, but no edge sequence connects them.
    #[error("no path between {src} and {dst}")]
    NoPath { src: NodeId, dst: NodeId },
    /// The node is absent from the graph.
    #[error("{0} is not in the topology")]
    UnknownNode(NodeId),
    /// No path is cached for the directional pair.
    #[error("no path installed from {src} to {dst}")]
    NotInstalled { src: MacAddr, dst: MacAddr },
    /// The host has no attachment edge to a switch.
    #[error("{0} is not attached to any switch")]
    NotAttached(MacAddr),
    /// An operation needed a switch, but none is connected.
    #[error("no switch is connected")]
    NoSwitches,
}

/// Malformed Ethernet frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("frame truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("malformed {0} payload")]
    Malformed(&'static str),
}

/// OpenFlow codec and session errors.
#[derive(Debug, Error)]
pub enum OfpError {
    #[error("unsupported OpenFlow version {0:#04x}")]
    Version(u8),
    #[error("unknown OpenFlow message type {0}")]
    UnknownType(u8),
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),
    #[error("invalid message length {0}")]
    Length(usize),
    #[error("session closed before the features reply")]
    Handshake,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failure to emit a message towards a switch.
#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("switch {0} is disconnected")]
    Disconnected(crate::mac::Dpid),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of the live-migration collaborator.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("no host name configured for hypervisor {0}")]
    UnknownHost(crate::mac::Dpid),
    #[error("no domain name configured for VM {0}")]
    UnknownVm(MacAddr),
    #[error("could not run the migration tool: {0}")]
    Spawn(#[from] io::Error),
    #[error("migration tool failed with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
