//! Client side of the mefs settlement contracts.
//!
//! Every mutating call goes through [`Ledger`], which pins a nonce per
//! logical transaction, escalates gas on failed sends and confirms exactly
//! one landing. On top of it sit the directory (indexer, resolver, mapper)
//! used to find each participant's contracts, and one client per contract
//! family.

pub mod artifacts;
pub mod bindings;
pub mod chain;
pub mod channel;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod merkle;
pub mod proofs;
pub mod roles;
pub mod root;
pub mod tx;
pub mod upkeeping;

pub use artifacts::ContractArtifacts;
pub use channel::PaymentChannels;
pub use directory::DirectoryResolver;
pub use error::ContractError;
pub use ledger::with_deadline;
pub use ledger::Ledger;
pub use roles::Role;
pub use roles::RoleRegistry;
pub use root::MerkleRoots;
pub use tx::GasPolicy;
pub use tx::TxSigner;
pub use upkeeping::OrderTerms;
pub use upkeeping::UpkeepingOrders;
