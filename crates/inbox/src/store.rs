//! Inbox item storage.

use std::collections::HashMap;
use std::sync::RwLock;

use flowforge_core::{ItemId, OrgId};

use crate::error::{InboxError, InboxResult};
use crate::item::{InboxItem, ItemStatus};

pub trait InboxStore: Send + Sync {
    fn insert(&self, item: InboxItem) -> InboxResult<()>;

    fn get(&self, item_id: ItemId) -> InboxResult<Option<InboxItem>>;

    fn save(&self, item: &InboxItem) -> InboxResult<()>;

    /// Unarchived items for an org, optionally filtered by status, ordered
    /// by priority score descending.
    fn list(&self, org_id: OrgId, status: Option<ItemStatus>) -> InboxResult<Vec<InboxItem>>;

    /// Every unarchived item the sweep should look at (open or ready),
    /// across all orgs.
    fn awaiting(&self) -> InboxResult<Vec<InboxItem>>;
}

impl<T: InboxStore + ?Sized> InboxStore for std::sync::Arc<T> {
    fn insert(&self, item: InboxItem) -> InboxResult<()> {
        (**self).insert(item)
    }

    fn get(&self, item_id: ItemId) -> InboxResult<Option<InboxItem>> {
        (**self).get(item_id)
    }

    fn save(&self, item: &InboxItem) -> InboxResult<()> {
        (**self).save(item)
    }

    fn list(&self, org_id: OrgId, status: Option<ItemStatus>) -> InboxResult<Vec<InboxItem>> {
        (**self).list(org_id, status)
    }

    fn awaiting(&self) -> InboxResult<Vec<InboxItem>> {
        (**self).awaiting()
    }
}

/// In-memory inbox store.
#[derive(Debug, Default)]
pub struct InMemoryInboxStore {
    items: RwLock<HashMap<ItemId, InboxItem>>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InboxStore for InMemoryInboxStore {
    fn insert(&self, item: InboxItem) -> InboxResult<()> {
        let mut items = self
            .items
            .write()
            .map_err(|e| InboxError::storage(e.to_string()))?;
        items.insert(item.id, item);
        Ok(())
    }

    fn get(&self, item_id: ItemId) -> InboxResult<Option<InboxItem>> {
        Ok(self
            .items
            .read()
            .map_err(|e| InboxError::storage(e.to_string()))?
            .get(&item_id)
            .cloned())
    }

    fn save(&self, item: &InboxItem) -> InboxResult<()> {
        let mut items = self
            .items
            .write()
            .map_err(|e| InboxError::storage(e.to_string()))?;
        if !items.contains_key(&item.id) {
            return Err(InboxError::NotFound(item.id));
        }
        items.insert(item.id, item.clone());
        Ok(())
    }

    fn list(&self, org_id: OrgId, status: Option<ItemStatus>) -> InboxResult<Vec<InboxItem>> {
        let items = self
            .items
            .read()
            .map_err(|e| InboxError::storage(e.to_string()))?;
        let mut out: Vec<InboxItem> = items
            .values()
            .filter(|i| {
                !i.archived
                    && i.org_id == org_id
                    && status.map_or(true, |wanted| i.status == wanted)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.priority_score
                .cmp(&a.priority_score)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(out)
    }

    fn awaiting(&self) -> InboxResult<Vec<InboxItem>> {
        Ok(self
            .items
            .read()
            .map_err(|e| InboxError::storage(e.to_string()))?
            .values()
            .filter(|i| !i.archived && i.status.is_awaiting())
            .cloned()
            .collect())
    }
}
