//! EIP-4844 blob containers
//!
//! Blobs travel with their KZG commitments and proofs, which callers compute.
//! This module only packs data into blobs and derives the versioned hashes that
//! go into the transaction body.

use ethers::types::H256;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{TxMgrError, TxMgrResult};

pub const BYTES_PER_FIELD_ELEMENT: usize = 32;
pub const FIELD_ELEMENTS_PER_BLOB: usize = 4096;
pub const BLOB_SIZE: usize = BYTES_PER_FIELD_ELEMENT * FIELD_ELEMENTS_PER_BLOB;
/// Blob gas consumed by one blob
pub const GAS_PER_BLOB: u64 = 1 << 17;
pub const MAX_BLOBS_PER_TX: usize = 6;

pub const KZG_COMMITMENT_SIZE: usize = 48;
pub const KZG_PROOF_SIZE: usize = 48;

const VERSIONED_HASH_VERSION_KZG: u8 = 0x01;
const ENCODING_VERSION: u8 = 0;

/// Usable bytes per field element; the top byte stays zero to remain below the modulus
const BYTES_PER_ELEMENT_PAYLOAD: usize = BYTES_PER_FIELD_ELEMENT - 1;

/// Largest payload `Blob::from_data` accepts. Element 0 carries the header.
pub const MAX_BLOB_DATA_SIZE: usize = (FIELD_ELEMENTS_PER_BLOB - 1) * BYTES_PER_ELEMENT_PAYLOAD;

pub type KzgCommitment = [u8; KZG_COMMITMENT_SIZE];
pub type KzgProof = [u8; KZG_PROOF_SIZE];

/// A single blob. Always exactly `BLOB_SIZE` bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Blob(Box<[u8]>);

impl Blob {
    /// Wrap raw blob bytes
    pub fn from_bytes(bytes: Vec<u8>) -> TxMgrResult<Self> {
        if bytes.len() != BLOB_SIZE {
            return Err(TxMgrError::InvalidCandidate(format!(
                "blob must be {} bytes, got {}",
                BLOB_SIZE,
                bytes.len()
            )));
        }
        Ok(Self(bytes.into_boxed_slice()))
    }

    /// Pack arbitrary data into a blob.
    ///
    /// Layout: field element 0 is `[0, version, len_hi, len_mid, len_lo, 0...]`,
    /// every following element is `[0, 31 data bytes]`.
    pub fn from_data(data: &[u8]) -> TxMgrResult<Self> {
        if data.len() > MAX_BLOB_DATA_SIZE {
            return Err(TxMgrError::InvalidCandidate(format!(
                "blob data too large: {} bytes, max {}",
                data.len(),
                MAX_BLOB_DATA_SIZE
            )));
        }

        let mut bytes = vec![0u8; BLOB_SIZE];
        let len = data.len() as u32;
        bytes[1] = ENCODING_VERSION;
        bytes[2..5].copy_from_slice(&len.to_be_bytes()[1..]);

        for (i, chunk) in data.chunks(BYTES_PER_ELEMENT_PAYLOAD).enumerate() {
            let start = (i + 1) * BYTES_PER_FIELD_ELEMENT + 1;
            bytes[start..start + chunk.len()].copy_from_slice(chunk);
        }

        Ok(Self(bytes.into_boxed_slice()))
    }

    /// Inverse of `from_data`
    pub fn to_data(&self) -> TxMgrResult<Vec<u8>> {
        let invalid = |msg: String| Err(TxMgrError::InvalidCandidate(msg));

        if self.0[1] != ENCODING_VERSION {
            return invalid(format!("unknown blob encoding version {}", self.0[1]));
        }
        let len = u32::from_be_bytes([0, self.0[2], self.0[3], self.0[4]]) as usize;
        if len > MAX_BLOB_DATA_SIZE {
            return invalid(format!("blob length prefix {} out of range", len));
        }

        let mut data = Vec::with_capacity(len);
        let mut element = 1;
        while data.len() < len {
            let start = element * BYTES_PER_FIELD_ELEMENT;
            if self.0[start] != 0 {
                return invalid(format!("field element {} has a non-zero high byte", element));
            }
            let take = (len - data.len()).min(BYTES_PER_ELEMENT_PAYLOAD);
            data.extend_from_slice(&self.0[start + 1..start + 1 + take]);
            element += 1;
        }
        Ok(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob(0x{}..)", hex::encode(&self.0[..8]))
    }
}

/// Blobs with their commitments and proofs, index-aligned
#[derive(Clone, PartialEq, Eq)]
pub struct BlobSidecar {
    blobs: Vec<Blob>,
    commitments: Vec<KzgCommitment>,
    proofs: Vec<KzgProof>,
}

impl BlobSidecar {
    pub fn new(
        blobs: Vec<Blob>,
        commitments: Vec<KzgCommitment>,
        proofs: Vec<KzgProof>,
    ) -> TxMgrResult<Self> {
        if blobs.is_empty() || blobs.len() > MAX_BLOBS_PER_TX {
            return Err(TxMgrError::InvalidCandidate(format!(
                "blob transactions carry 1 to {} blobs, got {}",
                MAX_BLOBS_PER_TX,
                blobs.len()
            )));
        }
        if commitments.len() != blobs.len() || proofs.len() != blobs.len() {
            return Err(TxMgrError::InvalidCandidate(format!(
                "sidecar length mismatch: {} blobs, {} commitments, {} proofs",
                blobs.len(),
                commitments.len(),
                proofs.len()
            )));
        }
        Ok(Self {
            blobs,
            commitments,
            proofs,
        })
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }

    pub fn commitments(&self) -> &[KzgCommitment] {
        &self.commitments
    }

    pub fn proofs(&self) -> &[KzgProof] {
        &self.proofs
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Total blob gas this sidecar consumes
    pub fn blob_gas(&self) -> u64 {
        GAS_PER_BLOB * self.blobs.len() as u64
    }

    /// Versioned hashes in blob order
    pub fn versioned_hashes(&self) -> Vec<H256> {
        self.commitments.iter().map(kzg_to_versioned_hash).collect()
    }
}

impl fmt::Debug for BlobSidecar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobSidecar")
            .field("blobs", &self.blobs.len())
            .field(
                "commitments",
                &self
                    .commitments
                    .iter()
                    .map(|c| format!("0x{}..", hex::encode(&c[..4])))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// `0x01 ‖ sha256(commitment)[1..]`
pub fn kzg_to_versioned_hash(commitment: &KzgCommitment) -> H256 {
    let mut hash: [u8; 32] = Sha256::digest(commitment).into();
    hash[0] = VERSIONED_HASH_VERSION_KZG;
    H256::from(hash)
}
