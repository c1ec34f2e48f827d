//! Account module
//!
//! Ledger account model and the account-number directory seam.

pub mod directory;
pub mod models;

pub use directory::{AccountDirectory, InMemoryAccountDirectory};
pub use models::Account;
