pub mod asset;
pub mod config;
pub mod deal;
pub mod effect;
pub mod error;
pub mod ledger;
pub mod machine;
pub mod outbox;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod utils;

pub use config::EscrowConfig;
pub use error::EscrowError;
pub use service::{EscrowService, Invocation, Receipt, TokenTransfer};
