//! Distributed lock manager (C4): the five-level advisory lock
//! (NONE < SHARED < RESERVED < PENDING < EXCLUSIVE) implemented over a
//! single `(LK, path)` item via conditional updates, per spec §4.4.

use std::cell::Cell;
use std::collections::HashMap;

use sqlite_vfs::LockKind;
use tracing::{debug, warn};

use crate::error::Error;
use crate::key::LOCK_PK;
use crate::store::{n, Condition, KvStore, Update};

fn level_number(lock: LockKind) -> i64 {
    match lock {
        LockKind::None => 0,
        LockKind::Shared => 1,
        LockKind::Reserved => 2,
        LockKind::Pending => 3,
        LockKind::Exclusive => 4,
    }
}

/// Owns the advisory lock state for one open file handle against one
/// `(LK, path)` item. `attained` is the only state this handle keeps in
/// memory; the lock record in the table is the sole durable state and may
/// be observed by other handles/processes at any time.
pub struct LockManager<S> {
    store: S,
    path: String,
    client_id: String,
    attained: Cell<LockKind>,
}

impl<S: KvStore> LockManager<S> {
    pub fn new(store: S, path: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            client_id: client_id.into(),
            attained: Cell::new(LockKind::None),
        }
    }

    pub fn current_lock(&self) -> LockKind {
        self.attained.get()
    }

    /// `xCheckReservedLock`: true iff the shared lock item's level is at
    /// least `RESERVED`.
    pub async fn check_reserved(&self) -> Result<bool, Error> {
        let item = self.store.get_item(LOCK_PK, &self.path).await?;
        let level = item
            .and_then(|i| i.get("level").and_then(|v| v.as_n().ok().cloned()))
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(level >= level_number(LockKind::Reserved))
    }

    /// `xLock(target)`. Preconditions (enforced by the calling engine, not
    /// re-checked here): `target` is one of SHARED/RESERVED/EXCLUSIVE and
    /// `target > attained`.
    pub async fn lock(&self, target: LockKind) -> Result<(), Error> {
        if target == self.attained.get() {
            return Ok(());
        }

        if target == LockKind::Shared {
            return self.acquire_shared().await;
        }

        // RESERVED or EXCLUSIVE: first claim PENDING if we don't already
        // hold at least that, then attempt the final upgrade.
        if level_number(self.attained.get()) < level_number(LockKind::Pending) {
            self.acquire_pending().await?;
        }
        self.upgrade_from_pending(target).await
    }

    async fn acquire_shared(&self) -> Result<(), Error> {
        let mut values = HashMap::new();
        values.insert(":initial".to_string(), n(0));
        values.insert(":increment".to_string(), n(1));
        values.insert(":reserved".to_string(), n(level_number(LockKind::Reserved)));

        let mut names = HashMap::new();
        names.insert("#cnt".to_string(), "count".to_string());

        let update = Update {
            expression: "SET #cnt = if_not_exists(#cnt, :initial) + :increment".to_string(),
            names,
            values: values.clone(),
            condition: Some(Condition {
                expression: "attribute_not_exists(level) OR level = :reserved".to_string(),
                names: HashMap::new(),
                values,
            }),
        };

        match self.store.update_item(LOCK_PK, &self.path, update).await? {
            crate::error::Conditional::Ok(_) => {
                self.attained.set(LockKind::Shared);
                debug!(path = %self.path, "acquired SHARED");
                Ok(())
            }
            crate::error::Conditional::ConditionFailed => {
                warn!(path = %self.path, "SHARED denied, lock is RESERVED or higher");
                Err(Error::Busy)
            }
        }
    }

    async fn acquire_pending(&self) -> Result<(), Error> {
        let mut values = HashMap::new();
        values.insert(":level".to_string(), n(level_number(LockKind::Pending)));
        values.insert(":owner".to_string(), AttributeValueOwner(self.client_id.clone()).into());

        let mut names = HashMap::new();
        names.insert("#lvl".to_string(), "level".to_string());
        names.insert("#own".to_string(), "owner".to_string());

        let update = Update {
            expression: "SET #lvl = :level, #own = :owner".to_string(),
            names,
            values: values.clone(),
            condition: Some(Condition {
                expression: "attribute_not_exists(owner) OR owner = :owner".to_string(),
                names: HashMap::new(),
                values: {
                    let mut v = HashMap::new();
                    v.insert(":owner".to_string(), AttributeValueOwner(self.client_id.clone()).into());
                    v
                },
            }),
        };

        match self.store.update_item(LOCK_PK, &self.path, update).await? {
            crate::error::Conditional::Ok(_) => {
                self.attained.set(LockKind::Pending);
                debug!(path = %self.path, "acquired PENDING");
                Ok(())
            }
            crate::error::Conditional::ConditionFailed => {
                warn!(path = %self.path, "PENDING denied, another writer claim exists");
                Err(Error::Busy)
            }
        }
    }

    async fn upgrade_from_pending(&self, target: LockKind) -> Result<(), Error> {
        let mut values = HashMap::new();
        values.insert(":level".to_string(), n(level_number(target)));
        values.insert(":owner".to_string(), AttributeValueOwner(self.client_id.clone()).into());

        let mut names = HashMap::new();
        names.insert("#lvl".to_string(), "level".to_string());
        names.insert("#own".to_string(), "owner".to_string());

        let mut cond_values = HashMap::new();
        cond_values.insert(":owner".to_string(), AttributeValueOwner(self.client_id.clone()).into());

        let condition = if target == LockKind::Reserved {
            Condition {
                expression: "owner = :owner".to_string(),
                names: HashMap::new(),
                values: cond_values,
            }
        } else {
            cond_values.insert(":one".to_string(), n(1));
            let mut cond_names = HashMap::new();
            cond_names.insert("#cnt".to_string(), "count".to_string());
            Condition {
                expression: "owner = :owner AND #cnt = :one".to_string(),
                names: cond_names,
                values: cond_values,
            }
        };

        let update = Update {
            expression: "SET #lvl = :level, #own = :owner".to_string(),
            names,
            values,
            condition: Some(condition),
        };

        match self.store.update_item(LOCK_PK, &self.path, update).await? {
            crate::error::Conditional::Ok(_) => {
                self.attained.set(target);
                debug!(path = %self.path, ?target, "upgraded from PENDING");
                Ok(())
            }
            crate::error::Conditional::ConditionFailed => {
                warn!(path = %self.path, ?target, "upgrade denied, leaving handle PENDING");
                Err(Error::Busy)
            }
        }
    }

    /// `xUnlock(target)`: monotone downgrade to `target`.
    pub async fn unlock(&self, target: LockKind) -> Result<(), Error> {
        let attained = self.attained.get();
        if target == attained {
            return Ok(());
        }

        if level_number(target) >= level_number(LockKind::Reserved) {
            // writer -> RESERVED: reset the shared item, resetting `count`
            // to 1 regardless of the actual reader count (see DESIGN.md).
            let mut item = crate::store::Item::new();
            item.insert("key".into(), aws_sdk_dynamodb::types::AttributeValue::S(LOCK_PK.into()));
            item.insert(
                "range".into(),
                aws_sdk_dynamodb::types::AttributeValue::S(self.path.clone()),
            );
            item.insert("level".into(), n(level_number(target)));
            item.insert("owner".into(), AttributeValueOwner(self.client_id.clone()).into());
            item.insert("count".into(), n(1));

            let mut values = HashMap::new();
            values.insert(":owner".to_string(), AttributeValueOwner(self.client_id.clone()).into());
            let condition = Condition {
                expression: "owner = :owner".to_string(),
                names: HashMap::new(),
                values,
            };
            self.store
                .put_item(item, Some(condition))
                .await?
                .into_result()?;
            self.attained.set(target);
            return Ok(());
        }

        if target == LockKind::Shared {
            let mut names = HashMap::new();
            names.insert("#lvl".to_string(), "level".to_string());
            names.insert("#own".to_string(), "owner".to_string());
            let mut values = HashMap::new();
            values.insert(":owner".to_string(), AttributeValueOwner(self.client_id.clone()).into());
            let update = Update {
                expression: "REMOVE #lvl, #own".to_string(),
                names,
                values: HashMap::new(),
                condition: Some(Condition {
                    expression: "owner = :owner".to_string(),
                    names: HashMap::new(),
                    values,
                }),
            };
            self.store
                .update_item(LOCK_PK, &self.path, update)
                .await?
                .into_result()?;
            self.attained.set(target);
            return Ok(());
        }

        debug_assert_eq!(target, LockKind::None);
        if level_number(attained) > level_number(LockKind::Shared) {
            let mut names = HashMap::new();
            names.insert("#cnt".to_string(), "count".to_string());
            names.insert("#lvl".to_string(), "level".to_string());
            names.insert("#own".to_string(), "owner".to_string());
            let mut values = HashMap::new();
            values.insert(":increment".to_string(), n(1));
            let owner_values = {
                let mut v = HashMap::new();
                v.insert(":owner".to_string(), AttributeValueOwner(self.client_id.clone()).into());
                v
            };
            let update = Update {
                expression: "SET #cnt = #cnt - :increment REMOVE #lvl, #own".to_string(),
                names,
                values,
                condition: Some(Condition {
                    expression: "owner = :owner".to_string(),
                    names: HashMap::new(),
                    values: owner_values,
                }),
            };
            self.store
                .update_item(LOCK_PK, &self.path, update)
                .await?
                .into_result()?;
        } else {
            let decrement = if level_number(attained) > 0 { 1 } else { 0 };
            let mut names = HashMap::new();
            names.insert("#cnt".to_string(), "count".to_string());
            let mut values = HashMap::new();
            values.insert(":increment".to_string(), n(decrement));
            let update = Update {
                expression: "SET #cnt = #cnt - :increment".to_string(),
                names,
                values,
                condition: None,
            };
            self.store
                .update_item(LOCK_PK, &self.path, update)
                .await?
                .into_result()?;
        }
        self.attained.set(LockKind::None);
        Ok(())
    }
}

/// Thin newtype so `.into()` reads naturally above; owner is always stored
/// as a DynamoDB string attribute.
struct AttributeValueOwner(String);

impl From<AttributeValueOwner> for aws_sdk_dynamodb::types::AttributeValue {
    fn from(v: AttributeValueOwner) -> Self {
        aws_sdk_dynamodb::types::AttributeValue::S(v.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::MemoryKvStore;
    use std::sync::Arc;

    fn manager(store: Arc<MemoryKvStore>, client_id: &str) -> LockManager<Arc<MemoryKvStore>> {
        LockManager::new(store, "f", client_id)
    }

    #[tokio::test]
    async fn shared_locks_coexist() {
        let store = Arc::new(MemoryKvStore::new());
        let a = manager(store.clone(), "a");
        let b = manager(store.clone(), "b");
        a.lock(LockKind::Shared).await.unwrap();
        b.lock(LockKind::Shared).await.unwrap();
        assert_eq!(a.current_lock(), LockKind::Shared);
        assert_eq!(b.current_lock(), LockKind::Shared);
    }

    #[tokio::test]
    async fn two_exclusive_claims_one_wins() {
        let store = Arc::new(MemoryKvStore::new());
        let a = manager(store.clone(), "a");
        let b = manager(store.clone(), "b");
        a.lock(LockKind::Shared).await.unwrap();
        b.lock(LockKind::Shared).await.unwrap();

        a.lock(LockKind::Reserved).await.unwrap();
        // b cannot become the writer while a holds RESERVED.
        let b_upgrade = b.lock(LockKind::Reserved).await;
        assert!(matches!(b_upgrade, Err(Error::Busy)));
    }

    #[tokio::test]
    async fn exclusive_waits_for_readers_to_drain() {
        let store = Arc::new(MemoryKvStore::new());
        let a = manager(store.clone(), "a");
        let b = manager(store.clone(), "b");
        a.lock(LockKind::Shared).await.unwrap();
        b.lock(LockKind::Shared).await.unwrap();
        a.lock(LockKind::Reserved).await.unwrap();

        // a cannot go EXCLUSIVE while b still holds SHARED (count = 2).
        let result = a.lock(LockKind::Exclusive).await;
        assert!(matches!(result, Err(Error::Busy)));
        assert_eq!(a.current_lock(), LockKind::Pending);

        b.unlock(LockKind::None).await.unwrap();
        a.lock(LockKind::Exclusive).await.unwrap();
        assert_eq!(a.current_lock(), LockKind::Exclusive);
    }

    #[tokio::test]
    async fn check_reserved_reflects_writer_claim() {
        let store = Arc::new(MemoryKvStore::new());
        let a = manager(store.clone(), "a");
        let b = manager(store.clone(), "b");
        assert!(!b.check_reserved().await.unwrap());
        a.lock(LockKind::Shared).await.unwrap();
        a.lock(LockKind::Reserved).await.unwrap();
        assert!(b.check_reserved().await.unwrap());
    }

    #[tokio::test]
    async fn unlock_to_none_drains_count() {
        let store = Arc::new(MemoryKvStore::new());
        let a = manager(store.clone(), "a");
        a.lock(LockKind::Shared).await.unwrap();
        a.unlock(LockKind::None).await.unwrap();
        assert_eq!(a.current_lock(), LockKind::None);

        // a fresh SHARED acquisition should succeed since count drained.
        let b = manager(store.clone(), "b");
        b.lock(LockKind::Shared).await.unwrap();
    }
}
