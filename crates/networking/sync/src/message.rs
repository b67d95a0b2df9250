//! Typed messages exchanged with peers. Requests carry a random id the
//! responding peer must mirror; the wire encoding and framing are the
//! transport's responsibility, the engine only sees these values.

use bytes::Bytes;
use ember_common::types::{BlockBody, BlockHeader, Receipt};
use ethereum_types::H256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(H256),
    Number(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockHeaders {
    pub id: u64,
    pub start: HashOrNumber,
    pub limit: u64,
    pub skip: u64,
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeaders {
    pub id: u64,
    pub headers: Vec<BlockHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockBodies {
    pub id: u64,
    pub hashes: Vec<H256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBodies {
    pub id: u64,
    pub bodies: Vec<BlockBody>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetReceipts {
    pub id: u64,
    pub hashes: Vec<H256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipts {
    pub id: u64,
    pub receipts: Vec<Vec<Receipt>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetNodeData {
    pub id: u64,
    pub hashes: Vec<H256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub id: u64,
    pub nodes: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    GetBlockHeaders(GetBlockHeaders),
    BlockHeaders(BlockHeaders),
    GetBlockBodies(GetBlockBodies),
    BlockBodies(BlockBodies),
    GetReceipts(GetReceipts),
    Receipts(Receipts),
    GetNodeData(GetNodeData),
    NodeData(NodeData),
}

impl Message {
    /// The eth protocol message code.
    pub fn code(&self) -> u8 {
        match self {
            Message::GetBlockHeaders(_) => 0x03,
            Message::BlockHeaders(_) => 0x04,
            Message::GetBlockBodies(_) => 0x05,
            Message::BlockBodies(_) => 0x06,
            Message::GetNodeData(_) => 0x0d,
            Message::NodeData(_) => 0x0e,
            Message::GetReceipts(_) => 0x0f,
            Message::Receipts(_) => 0x10,
        }
    }

    /// The request id this message carries or mirrors.
    pub fn request_id(&self) -> u64 {
        match self {
            Message::GetBlockHeaders(m) => m.id,
            Message::BlockHeaders(m) => m.id,
            Message::GetBlockBodies(m) => m.id,
            Message::BlockBodies(m) => m.id,
            Message::GetReceipts(m) => m.id,
            Message::Receipts(m) => m.id,
            Message::GetNodeData(m) => m.id,
            Message::NodeData(m) => m.id,
        }
    }

    /// The code of the response that answers this request.
    pub fn expected_response_code(&self) -> Option<u8> {
        match self {
            Message::GetBlockHeaders(_) => Some(0x04),
            Message::GetBlockBodies(_) => Some(0x06),
            Message::GetNodeData(_) => Some(0x0e),
            Message::GetReceipts(_) => Some(0x10),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_response_codes_pair_up() {
        let request = Message::GetBlockHeaders(GetBlockHeaders {
            id: 7,
            start: HashOrNumber::Number(1),
            limit: 10,
            skip: 0,
            reverse: false,
        });
        let response = Message::BlockHeaders(BlockHeaders { id: 7, headers: vec![] });
        assert_eq!(request.expected_response_code(), Some(response.code()));
        assert_eq!(request.request_id(), response.request_id());
        assert_eq!(response.expected_response_code(), None);
    }
}
