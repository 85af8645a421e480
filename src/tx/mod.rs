//! Transaction submission: crafting, signing, fee bumping and admission

pub mod blob;
mod candidate;
mod gas;
mod manager;
mod nonce;
mod queue;
mod send_state;
mod signer;

pub use blob::{Blob, BlobSidecar};
pub use candidate::TxCandidate;
pub use gas::{
    calc_blob_base_fee, calc_gas_fee_cap, calc_threshold_value, update_fees, FeePolicy, FeeSet,
    GasPriceCaps,
};
pub use manager::TxManager;
pub use nonce::{NonceManager, NonceSlot};
pub use queue::{Admission, InFlightObserver, Queue, TxResult};
pub use send_state::SendState;
pub use signer::{SignedTx, SignerError, TxSigner, UnsignedTx, WalletSigner};
