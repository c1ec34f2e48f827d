//! Core types used throughout the system
//!
//! These are fundamental types used by all modules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Account ID - globally unique, immutable after assignment.
///
/// # Usage:
/// - Primary key for ledger accounts
/// - Lock-ordering key for multi-account ledger mutations
pub type AccountId = u64;

/// Account role
///
/// Only `User` is subject to the daily transfer count policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    User,
    Merchant,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Merchant => "Merchant",
            Role::Admin => "Admin",
        }
    }

    /// Whether the daily transfer count policy applies to this role
    #[inline]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Role::User)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "merchant" => Ok(Role::Merchant),
            "admin" => Ok(Role::Admin),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}
