//! NAT engine redirect encoding.
//!
//! The endpoint stores a redirect as one comma-separated string:
//! `name,protocol,hostIp,hostPort,guestIp,guestPort`, where the protocol is
//! its ordinal (`0` = UDP, `1` = TCP).  Empty IP fields mean "any".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const FIELD_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NatProtocol {
    Udp,
    Tcp,
}

impl NatProtocol {
    pub fn ordinal(self) -> u8 {
        match self {
            Self::Udp => 0,
            Self::Tcp => 1,
        }
    }

    fn parse(field: &str) -> Option<Self> {
        match field.trim() {
            "0" => Some(Self::Udp),
            "1" => Some(Self::Tcp),
            s if s.eq_ignore_ascii_case("udp") => Some(Self::Udp),
            s if s.eq_ignore_ascii_case("tcp") => Some(Self::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for NatProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("UDP"),
            Self::Tcp => f.write_str("TCP"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RedirectDecodeError {
    #[error("expected {FIELD_COUNT} fields, found {0}")]
    FieldCount(usize),

    #[error("redirect name is empty")]
    EmptyName,

    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("{field} '{value}' is not a port number")]
    InvalidPort { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatRedirect {
    pub name: String,
    pub protocol: NatProtocol,
    pub host_ip: String,
    pub host_port: u16,
    pub guest_ip: String,
    pub guest_port: u16,
}

impl NatRedirect {
    pub fn encode(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.name,
            self.protocol.ordinal(),
            self.host_ip,
            self.host_port,
            self.guest_ip,
            self.guest_port
        )
    }

    pub fn decode(raw: &str) -> Result<Self, RedirectDecodeError> {
        let fields: Vec<&str> = raw.split(',').collect();
        if fields.len() != FIELD_COUNT {
            return Err(RedirectDecodeError::FieldCount(fields.len()));
        }

        let name = fields[0].trim();
        if name.is_empty() {
            return Err(RedirectDecodeError::EmptyName);
        }
        let protocol = NatProtocol::parse(fields[1])
            .ok_or_else(|| RedirectDecodeError::UnknownProtocol(fields[1].to_string()))?;

        Ok(Self {
            name: name.to_string(),
            protocol,
            host_ip: fields[2].trim().to_string(),
            host_port: parse_port("host port", fields[3])?,
            guest_ip: fields[4].trim().to_string(),
            guest_port: parse_port("guest port", fields[5])?,
        })
    }
}

fn parse_port(field: &'static str, value: &str) -> Result<u16, RedirectDecodeError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| RedirectDecodeError::InvalidPort {
            field,
            value: value.to_string(),
        })
}

impl fmt::Display for NatRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for NatRedirect {
    type Err = RedirectDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
