//! Low-latency flow classification rules
//!
//! Operators install a small set of tuple filters; the first packet of every
//! flow is checked against them once and the verdict is cached on the flow
//! record. Matching flows skip parking entirely.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use steer_common::{FlowKey, SteerError, SteerResult};

fn addr_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()) as u128,
        IpAddr::V6(v6) => u128::from_be_bytes(v6.octets()),
    }
}

/// One classification rule; `None` fields are wildcards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Source address to match
    pub src_addr: Option<IpAddr>,
    /// Destination address to match
    pub dst_addr: Option<IpAddr>,
    /// Source port to match
    pub src_port: Option<u16>,
    /// Destination port to match
    pub dst_port: Option<u16>,
    /// IP protocol to match
    pub protocol: Option<u8>,
}

impl FilterRule {
    /// Rule matching a destination port on any protocol
    pub fn dst_port(port: u16) -> Self {
        Self {
            src_addr: None,
            dst_addr: None,
            src_port: None,
            dst_port: Some(port),
            protocol: None,
        }
    }

    /// Whether this rule matches the flow tuple
    pub fn matches(&self, key: &FlowKey) -> bool {
        if let Some(addr) = self.src_addr {
            if addr_bits(addr) != key.src_ip {
                return false;
            }
        }
        if let Some(addr) = self.dst_addr {
            if addr_bits(addr) != key.dst_ip {
                return false;
            }
        }
        if let Some(port) = self.src_port {
            if port != key.src_port {
                return false;
            }
        }
        if let Some(port) = self.dst_port {
            if port != key.dst_port {
                return false;
            }
        }
        if let Some(proto) = self.protocol {
            if proto != key.protocol {
                return false;
            }
        }
        true
    }
}

/// The installed rule set, capped in size
pub struct FilterSet {
    rules: Vec<FilterRule>,
    cap: usize,
}

impl FilterSet {
    /// Create an empty set holding at most `cap` rules
    pub fn new(cap: usize) -> Self {
        Self {
            rules: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Number of installed rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are installed
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Install a rule; identical duplicates are rejected
    pub fn install(&mut self, rule: FilterRule) -> SteerResult<()> {
        if self.rules.iter().any(|r| r == &rule) {
            return Err(SteerError::DuplicateFilter);
        }
        if self.rules.len() >= self.cap {
            return Err(SteerError::FilterLimit);
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Remove a previously installed rule
    pub fn remove(&mut self, rule: &FilterRule) -> SteerResult<()> {
        match self.rules.iter().position(|r| r == rule) {
            Some(pos) => {
                self.rules.remove(pos);
                Ok(())
            }
            None => Err(SteerError::FilterNotFound),
        }
    }

    /// Whether any rule matches the flow tuple
    pub fn matches(&self, key: &FlowKey) -> bool {
        self.rules.iter().any(|r| r.matches(key))
    }
}
