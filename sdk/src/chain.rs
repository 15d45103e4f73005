//! The per-pair integrity chain.
//!
//! When enabled, every message of a pair is wrapped in a block before
//! encryption. Each block names its predecessor's commitment and commits to
//! the Merkle root over the hashes of the whole chain up to and including
//! itself, so the receiving side detects any tampered, dropped or reordered
//! block as soon as its rebuilt root disagrees.
//!
//! Both ends seed their chain with the same fixed genesis block, which makes
//! the very first data block verifiable.

use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};

use crate::Error;

/// Timestamp every chain's genesis block carries.
pub const GENESIS_TIMESTAMP: u64 = 1111111111;

const GENESIS_DATA: &[u8] = b"Genesis block";

/// One block of a pair's chain.
///
/// The commitment is excluded from the block hash so the Merkle root over
/// all hashes can be computed first and stored in the block afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: u64,
    pub timestamp: u64,
    pub data: Vec<u8>,
    pub prev_commitment: Vec<u8>,
    pub commitment: Vec<u8>,
}

impl Block {
    /// SHA-256 over the data, the previous commitment and the decimal forms
    /// of id and timestamp.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        hasher.update(&self.prev_commitment);
        hasher.update(self.id.to_string().as_bytes());
        hasher.update(self.timestamp.to_string().as_bytes());
        hasher.finalize().into()
    }

    /// Encode the block into `bytes`, replacing any previous contents.
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.reserve(
            16 + 4 * 3 + self.data.len() + self.prev_commitment.len() + self.commitment.len(),
        );
        bytes.put_u64(self.id);
        bytes.put_u64(self.timestamp);
        bytes.put_u32(self.data.len() as u32);
        bytes.extend_from_slice(&self.data);
        bytes.put_u32(self.prev_commitment.len() as u32);
        bytes.extend_from_slice(&self.prev_commitment);
        bytes.put_u32(self.commitment.len() as u32);
        bytes.extend_from_slice(&self.commitment);
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut bytes = BytesMut::new();
        self.encode(&mut bytes);
        bytes.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = bytes;
        if buf.remaining() < 16 + 4 {
            return Err(Error::InvalidInput);
        }

        let id = buf.get_u64();
        let timestamp = buf.get_u64();

        let mut section = |buf: &mut &[u8]| -> Result<Vec<u8>, Error> {
            let size = buf.get_u32() as usize;
            if buf.remaining() < size {
                return Err(Error::InvalidInput);
            }

            let body = buf[..size].to_vec();
            buf.advance(size);
            Ok(body)
        };

        let data = section(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(Error::InvalidInput);
        }
        let prev_commitment = section(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(Error::InvalidInput);
        }
        let commitment = section(&mut buf)?;

        Ok(Self {
            id,
            timestamp,
            data,
            prev_commitment,
            commitment,
        })
    }
}

/// Append-only chain of one pair, genesis included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    blocks: Vec<Block>,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain {
    pub fn new() -> Self {
        let mut genesis = Block {
            id: 0,
            timestamp: GENESIS_TIMESTAMP,
            data: GENESIS_DATA.to_vec(),
            prev_commitment: Vec::new(),
            commitment: Vec::new(),
        };
        genesis.commitment = genesis.hash().to_vec();

        Self {
            blocks: vec![genesis],
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The commitment of the newest block.
    pub fn root(&self) -> &[u8] {
        &self.blocks.last().expect("chain has genesis").commitment
    }

    /// Append a freshly authored block carrying `data` and return it.
    pub fn append(&mut self, data: &[u8], timestamp: u64) -> &Block {
        let previous = self.blocks.last().expect("chain has genesis");
        let mut block = Block {
            id: previous.id + 1,
            timestamp,
            data: data.to_vec(),
            prev_commitment: previous.commitment.clone(),
            commitment: Vec::new(),
        };

        let mut hashes: Vec<[u8; 32]> = self.blocks.iter().map(Block::hash).collect();
        hashes.push(block.hash());
        block.commitment = merkle_root(&hashes).to_vec();

        self.blocks.push(block);
        self.blocks.last().expect("just pushed")
    }

    /// Verify a received block against the rebuilt root, then append it.
    ///
    /// On a root mismatch the block is discarded and the chain does not
    /// advance, so a later retransmission of the honest block still fits.
    pub fn verify_append(&mut self, block: Block) -> Result<&Block, Error> {
        let mut hashes: Vec<[u8; 32]> = self.blocks.iter().map(Block::hash).collect();
        hashes.push(block.hash());

        if merkle_root(&hashes).as_slice() != block.commitment.as_slice() {
            return Err(Error::IntegrityFailure);
        }

        self.blocks.push(block);
        Ok(self.blocks.last().expect("just pushed"))
    }
}

/// Root of the Merkle tree over the given block hashes.
///
/// A single hash is its own root. Larger sets are halved recursively, with
/// the last hash duplicated whenever a set of odd size must split, and each
/// parent is the SHA-256 of its children's concatenation.
pub fn merkle_root(hashes: &[[u8; 32]]) -> [u8; 32] {
    if hashes.len() == 1 {
        return hashes[0];
    }

    node(hashes)
}

fn node(nodes: &[[u8; 32]]) -> [u8; 32] {
    if nodes.len() == 2 {
        return parent(&nodes[0], &nodes[1]);
    }

    let padded;
    let nodes = if nodes.len() % 2 == 1 {
        let mut grown = nodes.to_vec();
        grown.push(*nodes.last().expect("non-empty half"));
        padded = grown;
        &padded[..]
    } else {
        nodes
    };

    let middle = nodes.len() / 2;
    parent(&node(&nodes[..middle]), &node(&nodes[middle..]))
}

fn parent(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_identical_on_both_ends() {
        let ours = Chain::new();
        let theirs = Chain::new();

        assert_eq!(ours.len(), 1);
        assert_eq!(ours.root(), theirs.root());
        assert_eq!(ours.blocks()[0].id, 0);
        assert_eq!(ours.blocks()[0].timestamp, GENESIS_TIMESTAMP);
    }

    #[test]
    fn appended_blocks_chain_and_commit() {
        let mut chain = Chain::new();

        for (index, data) in [&b"a"[..], b"b", b"c"].into_iter().enumerate() {
            let previous_root = chain.root().to_vec();
            let block = chain.append(data, 1700000000 + index as u64);

            assert_eq!(block.id, index as u64 + 1);
            assert_eq!(block.prev_commitment, previous_root);
        }

        assert_eq!(chain.len(), 4);

        // The stored commitment is exactly the root rebuilt from scratch.
        let hashes: Vec<[u8; 32]> = chain.blocks().iter().map(Block::hash).collect();
        assert_eq!(merkle_root(&hashes).as_slice(), chain.root());
    }

    #[test]
    fn receiver_verifies_a_mirrored_chain() {
        let mut sender = Chain::new();
        let mut receiver = Chain::new();

        for data in [&b"a"[..], b"b", b"c"] {
            let encoded = sender.append(data, 1700000000).encode_to_vec();
            let block = Block::decode(&encoded).unwrap();
            let accepted = receiver.verify_append(block).unwrap();

            assert_eq!(accepted.data, data);
        }

        assert_eq!(receiver.len(), 4);
        assert_eq!(receiver.root(), sender.root());
    }

    #[test]
    fn tampered_data_is_rejected() {
        let mut sender = Chain::new();
        let mut receiver = Chain::new();

        let mut block = sender.append(b"payload", 1700000000).clone();
        block.data[0] ^= 1;

        assert!(matches!(
            receiver.verify_append(block),
            Err(Error::IntegrityFailure)
        ));
        assert_eq!(receiver.len(), 1);
    }

    #[test]
    fn wrong_commitment_is_rejected() {
        let mut sender = Chain::new();
        let mut receiver = Chain::new();

        let mut block = sender.append(b"payload", 1700000000).clone();
        block.commitment[0] ^= 1;

        assert!(receiver.verify_append(block).is_err());
    }

    #[test]
    fn block_encoding_round_trips() {
        let mut chain = Chain::new();
        let block = chain.append(b"some payload", 1700000000).clone();

        let decoded = Block::decode(&block.encode_to_vec()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn decode_rejects_truncated_blocks() {
        let mut chain = Chain::new();
        let encoded = chain.append(b"some payload", 1700000000).encode_to_vec();

        assert!(Block::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Block::decode(&encoded[..8]).is_err());
    }
}
