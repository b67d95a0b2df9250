use ethereum_types::{Bloom, H64, H160, H256, U256};
use keccak_hash::keccak;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

pub type BlockNumber = u64;
pub type BlockHash = H256;

/// An Ethereum block header. Content-addressed: two headers are the same
/// block iff their [`BlockHeader::hash`] matches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub ommers_hash: H256,
    pub beneficiary: H160,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: BlockNumber,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: H256,
    pub nonce: H64,
}

impl BlockHeader {
    /// Keccak hash of the RLP encoding, the block's identity.
    pub fn hash(&self) -> BlockHash {
        keccak(rlp::encode(self))
    }
}

impl Encodable for BlockHeader {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(15);
        s.append(&self.parent_hash);
        s.append(&self.ommers_hash);
        s.append(&self.beneficiary);
        s.append(&self.state_root);
        s.append(&self.transactions_root);
        s.append(&self.receipts_root);
        s.append(&self.logs_bloom);
        s.append(&self.difficulty);
        s.append(&self.number);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        s.append(&self.timestamp);
        s.append(&self.extra_data);
        s.append(&self.mix_hash);
        s.append(&self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(BlockHeader {
            parent_hash: rlp.val_at(0)?,
            ommers_hash: rlp.val_at(1)?,
            beneficiary: rlp.val_at(2)?,
            state_root: rlp.val_at(3)?,
            transactions_root: rlp.val_at(4)?,
            receipts_root: rlp.val_at(5)?,
            logs_bloom: rlp.val_at(6)?,
            difficulty: rlp.val_at(7)?,
            number: rlp.val_at(8)?,
            gas_limit: rlp.val_at(9)?,
            gas_used: rlp.val_at(10)?,
            timestamp: rlp.val_at(11)?,
            extra_data: rlp.val_at(12)?,
            mix_hash: rlp.val_at(13)?,
            nonce: rlp.val_at(14)?,
        })
    }
}

/// A legacy signed transaction. `to` is `None` for contract creation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub to: Option<H160>,
    pub value: U256,
    pub payload: Vec<u8>,
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

impl Encodable for Transaction {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(9);
        s.append(&self.nonce);
        s.append(&self.gas_price);
        s.append(&self.gas_limit);
        match self.to {
            Some(ref address) => s.append(address),
            None => s.append_empty_data(),
        };
        s.append(&self.value);
        s.append(&self.payload);
        s.append(&self.v);
        s.append(&self.r);
        s.append(&self.s);
    }
}

impl Decodable for Transaction {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let to_item = rlp.at(3)?;
        let to = if to_item.is_empty() {
            None
        } else {
            Some(to_item.as_val()?)
        };
        Ok(Transaction {
            nonce: rlp.val_at(0)?,
            gas_price: rlp.val_at(1)?,
            gas_limit: rlp.val_at(2)?,
            to,
            value: rlp.val_at(4)?,
            payload: rlp.val_at(5)?,
            v: rlp.val_at(6)?,
            r: rlp.val_at(7)?,
            s: rlp.val_at(8)?,
        })
    }
}

/// Transactions plus uncle headers. Both lists are committed to by the
/// enclosing header (transactions root and ommers hash).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockBody {
    pub transactions: Vec<Transaction>,
    pub ommers: Vec<BlockHeader>,
}

impl Encodable for BlockBody {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append_list(&self.transactions);
        s.append_list(&self.ommers);
    }
}

impl Decodable for BlockBody {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(BlockBody {
            transactions: rlp.list_at(0)?,
            ommers: rlp.list_at(1)?,
        })
    }
}

/// Pre-Byzantium receipts commit to an intermediate state root,
/// post-Byzantium ones to a success flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    StateRoot(H256),
    Status(bool),
}

impl Default for ReceiptOutcome {
    fn default() -> Self {
        ReceiptOutcome::Status(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Log {
    pub address: H160,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
}

impl Encodable for Log {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.address);
        s.append_list(&self.topics);
        s.append(&self.data);
    }
}

impl Decodable for Log {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Log {
            address: rlp.val_at(0)?,
            topics: rlp.list_at(1)?,
            data: rlp.val_at(2)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Receipt {
    pub outcome: ReceiptOutcome,
    pub cumulative_gas_used: u64,
    pub logs_bloom: Bloom,
    pub logs: Vec<Log>,
}

impl Encodable for Receipt {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        match self.outcome {
            ReceiptOutcome::StateRoot(ref root) => s.append(root),
            ReceiptOutcome::Status(success) => s.append(&(success as u8)),
        };
        s.append(&self.cumulative_gas_used);
        s.append(&self.logs_bloom);
        s.append_list(&self.logs);
    }
}

impl Decodable for Receipt {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let outcome_item = rlp.at(0)?;
        let outcome = if outcome_item.data()?.len() == 32 {
            ReceiptOutcome::StateRoot(outcome_item.as_val()?)
        } else {
            ReceiptOutcome::Status(outcome_item.as_val::<u8>()? == 1)
        };
        Ok(Receipt {
            outcome,
            cumulative_gas_used: rlp.val_at(1)?,
            logs_bloom: rlp.val_at(2)?,
            logs: rlp.list_at(3)?,
        })
    }
}

/// The fork-choice scalar: checkpoint number first, accumulated difficulty
/// second. Monotonic along any canonical chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ChainWeight {
    pub last_checkpoint_number: u64,
    pub total_difficulty: U256,
}

impl ChainWeight {
    pub fn zero() -> Self {
        Self::default()
    }

    /// The weight of a chain extended by `header`.
    pub fn increase(&self, header: &BlockHeader) -> Self {
        ChainWeight {
            last_checkpoint_number: self.last_checkpoint_number,
            total_difficulty: self.total_difficulty + header.difficulty,
        }
    }
}

impl Encodable for ChainWeight {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.last_checkpoint_number);
        s.append(&self.total_difficulty);
    }
}

impl Decodable for ChainWeight {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(ChainWeight {
            last_checkpoint_number: rlp.val_at(0)?,
            total_difficulty: rlp.val_at(1)?,
        })
    }
}
