//! OCPP message catalogs
//!
//! - `types`: data types shared by both versions
//! - `v16`: OCPP 1.6 operations and catalog
//! - `v21`: OCPP 2.1 operations and catalog

#[macro_use]
mod macros;

pub mod types;
pub mod v16;
pub mod v21;

use std::fmt;
use std::str::FromStr;

use nn_core::Catalog;
use serde::{Deserialize, Serialize};

pub use types::*;

/// OCPP protocol version spoken on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcppVersion {
    #[serde(rename = "1.6")]
    V16,
    #[serde(rename = "2.1")]
    V21,
}

impl OcppVersion {
    /// WebSocket subprotocol negotiated during the handshake
    pub fn subprotocol(&self) -> &'static str {
        match self {
            OcppVersion::V16 => "ocpp1.6",
            OcppVersion::V21 => "ocpp2.1",
        }
    }

    pub fn from_subprotocol(protocol: &str) -> Option<Self> {
        match protocol.trim() {
            "ocpp1.6" => Some(OcppVersion::V16),
            "ocpp2.1" => Some(OcppVersion::V21),
            _ => None,
        }
    }

    /// Catalog of the operations this version supports
    pub fn catalog(&self) -> Catalog {
        match self {
            OcppVersion::V16 => v16::catalog(),
            OcppVersion::V21 => v21::catalog(),
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcppVersion::V16 => write!(f, "1.6"),
            OcppVersion::V21 => write!(f, "2.1"),
        }
    }
}

impl FromStr for OcppVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().trim_start_matches("ocpp") {
            "1.6" | "16" => Ok(OcppVersion::V16),
            "2.1" | "21" => Ok(OcppVersion::V21),
            other => Err(format!("unsupported OCPP version: {}", other)),
        }
    }
}
