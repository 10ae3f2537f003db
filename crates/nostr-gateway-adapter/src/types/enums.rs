/*
[INPUT]:  Identity and wallet protocol vocabularies and serde requirements
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - shared enumerations
[UPDATE]: When a new backend variant or wallet direction is added
*/

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::http::GatewayError;

/// Which backend produced the identity's signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMethod {
    Extension,
    RemoteSigner,
    LocalKey,
    ReadOnly,
}

impl SigningMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningMethod::Extension => "extension",
            SigningMethod::RemoteSigner => "remote_signer",
            SigningMethod::LocalKey => "local_key",
            SigningMethod::ReadOnly => "read_only",
        }
    }

    pub fn can_sign(&self) -> bool {
        !matches!(self, SigningMethod::ReadOnly)
    }
}

impl fmt::Display for SigningMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(GatewayError::InvalidResponse(format!(
                "unknown history direction: {other}"
            ))),
        }
    }
}

/// Where the handshake runs, which decides how the connection request is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientContext {
    Mobile,
    Desktop,
}

/// Role of an `e` tag inside a spending history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenMarker {
    Created,
    Destroyed,
    Redeemed,
}

impl TokenMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenMarker::Created => "created",
            TokenMarker::Destroyed => "destroyed",
            TokenMarker::Redeemed => "redeemed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(TokenMarker::Created),
            "destroyed" => Some(TokenMarker::Destroyed),
            "redeemed" => Some(TokenMarker::Redeemed),
            _ => None,
        }
    }
}
