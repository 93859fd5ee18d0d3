//! Inbox error taxonomy.

use thiserror::Error;

use flowforge_core::ItemId;

use crate::item::ItemStatus;

pub type InboxResult<T> = Result<T, InboxError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InboxError {
    #[error("inbox item not found: {0}")]
    NotFound(ItemId),

    #[error("illegal transition: {from:?} -> {to:?}")]
    IllegalTransition { from: ItemStatus, to: ItemStatus },

    #[error("storage error: {0}")]
    Storage(String),
}

impl InboxError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}
