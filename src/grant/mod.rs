//! Grant Ledger
//!
//! アクセスグラントの発行・期限切れ・取り消し・使用状況の管理

mod ledger;
mod types;

pub use ledger::{GrantLedger, ResourceSlot};
pub use types::{AccessGrant, GrantId, LockType, ResourceKey};
