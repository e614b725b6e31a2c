//! Durable duel records, player balances and wager escrow.
//!
//! Everything financial goes through a single storage transaction so that a
//! failure part way leaves every account in its pre-operation state.

pub mod error;
pub mod escrow;
pub mod service;
pub mod storage;
pub mod types;


pub use error::LedgerError;
pub use escrow::{EscrowReceipt, WagerEscrow};
pub use service::DuelLedger;
pub use storage::{InMemoryLedgerStorage, LedgerStorage, LedgerStorageTxn, SeaOrmLedgerStorage};
pub use types::*;
