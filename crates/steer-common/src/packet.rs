//! Packet references handed across the steering boundary
//!
//! The engine never parses headers; the embedder's flow key extractor runs
//! first and stamps each packet with its hash and tuple summary.

use bytes::Bytes;

use crate::flow::FlowKey;

/// A received packet, stamped by the flow key extractor
#[derive(Debug, Clone)]
pub struct Packet {
    /// Flow hash stamped by the key extractor
    pub flow_hash: u64,
    /// Transport tuple summary
    pub key: FlowKey,
    /// Wire length in bytes
    pub len: u32,
    /// Payload reference (zero-copy)
    pub payload: Bytes,
}

impl Packet {
    /// Build a packet from a key, hashing it with the default extractor
    pub fn from_key(key: FlowKey, payload: Bytes) -> Self {
        Self {
            flow_hash: key.hash(),
            key,
            len: payload.len() as u32,
            payload,
        }
    }

    /// Build a packet with an explicit pre-computed hash
    pub fn with_hash(flow_hash: u64, key: FlowKey, payload: Bytes) -> Self {
        Self {
            flow_hash,
            key,
            len: payload.len() as u32,
            payload,
        }
    }
}

/// Out-of-band marker from a lower layer indicating a receive window boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// A receive burst is starting; `seq` orders windows
    WindowStart {
        /// Window sequence number
        seq: u32,
    },
    /// The receive burst completed; parked packets should be flushed
    WindowEnd {
        /// Window sequence number
        seq: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::PROTO_UDP;
    use std::net::Ipv4Addr;

    #[test]
    fn test_packet_from_key() {
        let key = FlowKey::from_v4(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            4000,
            5000,
            PROTO_UDP,
        );
        let pkt = Packet::from_key(key, Bytes::from_static(&[0u8; 64]));
        assert_eq!(pkt.flow_hash, key.hash());
        assert_eq!(pkt.len, 64);
    }
}
