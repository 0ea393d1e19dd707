//! Block store (C2): fixed-size chunks of a file, stored as individual
//! items in a DynamoDB-shaped composite-key table, plus the running file
//! size counter.
//!
//! The table itself is accessed through the [`KvStore`] trait rather than
//! directly through `aws_sdk_dynamodb::Client`, per the spec's framing of
//! the KV store as "an operation set... we specify request shapes but not
//! transport". [`DynamoDbStore`] is the concrete adapter for the real SDK;
//! tests exercise [`BlockStore`] against an in-memory double.

use std::collections::HashMap;
use std::future::Future;

use aws_sdk_dynamodb::types::AttributeValue;
use tracing::debug;

use crate::error::{Conditional, Error};
use crate::key::{block_pk, block_sk, parse_block_sk, ACCESS_PK, FSIZE_PK};

pub type Item = HashMap<String, AttributeValue>;

/// One page of a paginated `Query`.
#[derive(Debug, Default)]
pub struct QueryPage {
    pub items: Vec<Item>,
    pub last_evaluated_key: Option<Item>,
}

/// The DynamoDB-shaped operation set the VFS core is built against.
///
/// `K` is always the `"key"` attribute (partition key), `R` the `"range"`
/// attribute (sort key); both are strings.
pub trait KvStore: Send + Sync {
    /// Strongly consistent point read.
    fn get_item(
        &self,
        pk: &str,
        sk: &str,
    ) -> impl Future<Output = Result<Option<Item>, Error>> + Send;

    /// `PutItem` with `ReturnValues=ALL_OLD`, optionally conditional.
    fn put_item(
        &self,
        item: Item,
        condition: Option<Condition>,
    ) -> impl Future<Output = Result<Conditional<Option<Item>>, Error>> + Send;

    /// `UpdateItem` with an update expression and optional condition,
    /// returning the item's attributes as they are after the update
    /// (`ReturnValues=ALL_NEW`, except where a caller only needs to know
    /// that the call succeeded).
    fn update_item(
        &self,
        pk: &str,
        sk: &str,
        update: Update,
    ) -> impl Future<Output = Result<Conditional<Item>, Error>> + Send;

    /// `DeleteItem` with `ReturnValues=ALL_OLD`.
    fn delete_item(
        &self,
        pk: &str,
        sk: &str,
    ) -> impl Future<Output = Result<Option<Item>, Error>> + Send;

    /// Strongly consistent `Query` on partition `pk`, one page at a time.
    fn query(
        &self,
        pk: &str,
        exclusive_start_key: Option<Item>,
    ) -> impl Future<Output = Result<QueryPage, Error>> + Send;
}

/// A `ConditionExpression`, already rendered with its placeholder names and
/// values (`#cnt`/`:val`-style), as the SDK request builders expect.
#[derive(Debug, Default, Clone)]
pub struct Condition {
    pub expression: String,
    pub names: HashMap<String, String>,
    pub values: HashMap<String, AttributeValue>,
}

/// An `UpdateExpression`, already rendered, plus its optional condition.
#[derive(Debug, Default, Clone)]
pub struct Update {
    pub expression: String,
    pub names: HashMap<String, String>,
    pub values: HashMap<String, AttributeValue>,
    pub condition: Option<Condition>,
}

pub(crate) fn n(v: i64) -> AttributeValue {
    AttributeValue::N(v.to_string())
}

pub(crate) fn get_n(item: &Item, attr: &str) -> Result<i64, Error> {
    match item.get(attr) {
        Some(AttributeValue::N(s)) => s
            .parse()
            .map_err(|_| Error::invalid_item(format!("attribute {attr} is not a valid number"))),
        Some(_) => Err(Error::invalid_item(format!("attribute {attr} is not N"))),
        None => Err(Error::invalid_item(format!("missing attribute {attr}"))),
    }
}

pub(crate) fn get_b(item: &Item, attr: &str) -> Result<Vec<u8>, Error> {
    match item.get(attr) {
        Some(AttributeValue::B(blob)) => Ok(blob.clone().into_inner()),
        Some(_) => Err(Error::invalid_item(format!("attribute {attr} is not B"))),
        None => Ok(Vec::new()),
    }
}

pub(crate) fn get_s(item: &Item, attr: &str) -> Result<String, Error> {
    match item.get(attr) {
        Some(AttributeValue::S(s)) => Ok(s.clone()),
        Some(_) => Err(Error::invalid_item(format!("attribute {attr} is not S"))),
        None => Err(Error::invalid_item(format!("missing attribute {attr}"))),
    }
}

/// Operations over the block-item and size-counter kinds of the table
/// (spec §4.2). One `BlockStore` is shared by every file handle opened
/// against the same table.
#[derive(Clone)]
pub struct BlockStore<S> {
    store: S,
}

impl<S: KvStore> BlockStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    /// `get_block(P, N) -> bytes`. Empty if the block does not exist.
    pub async fn get_block(&self, path: &str, block: u64) -> Result<Vec<u8>, Error> {
        let pk = block_pk(path);
        let sk = block_sk(block);
        match self.store.get_item(&pk, &sk).await? {
            Some(item) => get_b(&item, "data"),
            None => Ok(Vec::new()),
        }
    }

    /// `put_block(P, N, bytes) -> Δsize`.
    pub async fn put_block(&self, path: &str, block: u64, data: &[u8]) -> Result<i64, Error> {
        let size = data.len() as i64;
        let mut item = Item::new();
        item.insert("key".into(), AttributeValue::S(block_pk(path)));
        item.insert("range".into(), AttributeValue::S(block_sk(block)));
        item.insert("data".into(), AttributeValue::B(data.to_vec().into()));
        item.insert("size".into(), n(size));

        let old = self.store.put_item(item, None).await?.into_result()?;
        let old_size = match old {
            Some(old) => get_n(&old, "size").unwrap_or(0),
            None => 0,
        };
        let delta = size - old_size;
        debug!(path, block, delta, "put_block");
        Ok(delta)
    }

    /// `delete_block(P, N) -> Δsize`.
    pub async fn delete_block(&self, path: &str, block: u64) -> Result<i64, Error> {
        let pk = block_pk(path);
        let sk = block_sk(block);
        let old = self.store.delete_item(&pk, &sk).await?;
        let delta = match old {
            Some(old) => -get_n(&old, "size")?,
            None => 0,
        };
        debug!(path, block, delta, "delete_block");
        Ok(delta)
    }

    /// `ADD size Δ` on `(FSIZE, P)`, creating the item if absent.
    pub async fn update_total(&self, path: &str, delta: i64) -> Result<(), Error> {
        if delta == 0 {
            return Ok(());
        }
        let mut values = HashMap::new();
        values.insert(":dsize".to_string(), n(delta));
        let update = Update {
            expression: "ADD size :dsize".to_string(),
            names: HashMap::new(),
            values,
            condition: None,
        };
        self.store
            .update_item(FSIZE_PK, path, update)
            .await?
            .into_result()?;
        debug!(path, delta, "update_total");
        Ok(())
    }

    /// `get_total(P) -> int`. 0 if absent.
    pub async fn get_total(&self, path: &str) -> Result<i64, Error> {
        match self.store.get_item(FSIZE_PK, path).await? {
            Some(item) => get_n(&item, "size"),
            None => Ok(0),
        }
    }

    /// Unconditionally set `FSIZE/P.size` to an absolute value, as
    /// `deserialize_iter` does once it has consumed its whole source
    /// (as opposed to `update_total`'s signed-delta `ADD`, used by
    /// writes and truncates against a file already in use).
    pub async fn set_total(&self, path: &str, total: i64) -> Result<(), Error> {
        let mut item = Item::new();
        item.insert("key".into(), AttributeValue::S(FSIZE_PK.into()));
        item.insert("range".into(), AttributeValue::S(path.into()));
        item.insert("size".into(), n(total));
        self.store.put_item(item, None).await?.into_result()?;
        Ok(())
    }

    /// Raw access to the underlying store's paginated `Query`, for
    /// callers (the serializer) that need to stream pages lazily rather
    /// than collecting the whole file as [`Self::blocks_in_order`] does.
    pub async fn query_blocks_page(
        &self,
        path: &str,
        exclusive_start_key: Option<Item>,
    ) -> Result<QueryPage, Error> {
        self.store.query(&block_pk(path), exclusive_start_key).await
    }

    /// Mark `path` as existing (idempotent, unconditional `PutItem`).
    pub async fn mark_access(&self, path: &str) -> Result<(), Error> {
        let mut item = Item::new();
        item.insert("key".into(), AttributeValue::S(ACCESS_PK.into()));
        item.insert("range".into(), AttributeValue::S(path.into()));
        self.store.put_item(item, None).await?.into_result()?;
        Ok(())
    }

    /// `xAccess` existence check: is there an `ACCESS/path` marker?
    pub async fn access_exists(&self, path: &str) -> Result<bool, Error> {
        Ok(self.store.get_item(ACCESS_PK, path).await?.is_some())
    }

    pub async fn delete_access(&self, path: &str) -> Result<(), Error> {
        self.store.delete_item(ACCESS_PK, path).await?;
        Ok(())
    }

    /// Query all blocks for `path` in ascending block order, across as
    /// many pages as the underlying store returns, yielding `(block#,
    /// size, data)` triples.
    pub async fn blocks_in_order(&self, path: &str) -> Result<Vec<(u64, i64, Vec<u8>)>, Error> {
        let pk = block_pk(path);
        let mut out = Vec::new();
        let mut start = None;
        loop {
            let page = self.store.query(&pk, start.take()).await?;
            for item in page.items {
                let block = item
                    .get("range")
                    .and_then(|v| v.as_s().ok())
                    .and_then(|s| parse_block_sk(s))
                    .ok_or_else(|| Error::invalid_item("block item missing range key"))?;
                let size = get_n(&item, "size")?;
                let data = get_b(&item, "data")?;
                out.push((block, size, data));
            }
            match page.last_evaluated_key {
                Some(lek) => start = Some(lek),
                None => break,
            }
        }
        out.sort_by_key(|(block, _, _)| *block);
        Ok(out)
    }
}

impl<T: KvStore + ?Sized> KvStore for std::sync::Arc<T> {
    async fn get_item(&self, pk: &str, sk: &str) -> Result<Option<Item>, Error> {
        (**self).get_item(pk, sk).await
    }

    async fn put_item(
        &self,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<Conditional<Option<Item>>, Error> {
        (**self).put_item(item, condition).await
    }

    async fn update_item(
        &self,
        pk: &str,
        sk: &str,
        update: Update,
    ) -> Result<Conditional<Item>, Error> {
        (**self).update_item(pk, sk, update).await
    }

    async fn delete_item(&self, pk: &str, sk: &str) -> Result<Option<Item>, Error> {
        (**self).delete_item(pk, sk).await
    }

    async fn query(&self, pk: &str, exclusive_start_key: Option<Item>) -> Result<QueryPage, Error> {
        (**self).query(pk, exclusive_start_key).await
    }
}

/// Concrete [`KvStore`] adapter over the real `aws-sdk-dynamodb` client.
#[derive(Clone)]
pub struct DynamoDbStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoDbStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

fn is_condition_failed(err: &aws_sdk_dynamodb::Error) -> bool {
    matches!(
        err,
        aws_sdk_dynamodb::Error::ConditionalCheckFailedException(_)
            | aws_sdk_dynamodb::Error::TransactionConflictException(_)
    )
}

impl KvStore for DynamoDbStore {
    async fn get_item(&self, pk: &str, sk: &str) -> Result<Option<Item>, Error> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("key", AttributeValue::S(pk.to_string()))
            .key("range", AttributeValue::S(sk.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| Error::sdk(e.into_service_error()))?;
        Ok(out.item)
    }

    async fn put_item(
        &self,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<Conditional<Option<Item>>, Error> {
        let mut req = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(item))
            .return_values(aws_sdk_dynamodb::types::ReturnValue::AllOld);

        if let Some(cond) = condition {
            req = req.condition_expression(cond.expression);
            for (k, v) in cond.names {
                req = req.expression_attribute_names(k, v);
            }
            for (k, v) in cond.values {
                req = req.expression_attribute_values(k, v);
            }
        }

        match req.send().await {
            Ok(out) => Ok(Conditional::Ok(out.attributes)),
            Err(e) => {
                let ddb_err: aws_sdk_dynamodb::Error = e.into_service_error().into();
                if is_condition_failed(&ddb_err) {
                    Ok(Conditional::ConditionFailed)
                } else {
                    Err(Error::sdk(ddb_err))
                }
            }
        }
    }

    async fn update_item(
        &self,
        pk: &str,
        sk: &str,
        update: Update,
    ) -> Result<Conditional<Item>, Error> {
        let mut req = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("key", AttributeValue::S(pk.to_string()))
            .key("range", AttributeValue::S(sk.to_string()))
            .update_expression(update.expression)
            .return_values(aws_sdk_dynamodb::types::ReturnValue::AllNew);

        for (k, v) in update.names {
            req = req.expression_attribute_names(k, v);
        }
        for (k, v) in update.values {
            req = req.expression_attribute_values(k, v);
        }
        if let Some(cond) = update.condition {
            req = req.condition_expression(cond.expression);
            for (k, v) in cond.names {
                req = req.expression_attribute_names(k, v);
            }
            for (k, v) in cond.values {
                req = req.expression_attribute_values(k, v);
            }
        }

        match req.send().await {
            Ok(out) => Ok(Conditional::Ok(out.attributes.unwrap_or_default())),
            Err(e) => {
                let ddb_err: aws_sdk_dynamodb::Error = e.into_service_error().into();
                if is_condition_failed(&ddb_err) {
                    Ok(Conditional::ConditionFailed)
                } else {
                    Err(Error::sdk(ddb_err))
                }
            }
        }
    }

    async fn delete_item(&self, pk: &str, sk: &str) -> Result<Option<Item>, Error> {
        let out = self
            .client
            .delete_item()
            .table_name(&self.table)
            .key("key", AttributeValue::S(pk.to_string()))
            .key("range", AttributeValue::S(sk.to_string()))
            .return_values(aws_sdk_dynamodb::types::ReturnValue::AllOld)
            .send()
            .await
            .map_err(|e| Error::sdk(e.into_service_error()))?;
        Ok(out.attributes)
    }

    async fn query(&self, pk: &str, exclusive_start_key: Option<Item>) -> Result<QueryPage, Error> {
        let mut values = HashMap::new();
        values.insert(":pk".to_string(), AttributeValue::S(pk.to_string()));

        let mut req = self
            .client
            .query()
            .table_name(&self.table)
            .key_condition_expression("#k = :pk")
            .expression_attribute_names("#k", "key")
            .set_expression_attribute_values(Some(values))
            .consistent_read(true);

        if let Some(lek) = exclusive_start_key {
            req = req.set_exclusive_start_key(Some(lek));
        }

        let out = req
            .send()
            .await
            .map_err(|e| Error::sdk(e.into_service_error()))?;
        Ok(QueryPage {
            items: out.items.unwrap_or_default(),
            last_evaluated_key: out.last_evaluated_key,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory double for [`KvStore`], used to unit test the pure
    /// protocol logic in [`BlockStore`], the lock manager, and the file
    /// handle without a live DynamoDB-compatible endpoint.
    #[derive(Default)]
    pub struct MemoryKvStore {
        items: Mutex<HashMap<(String, String), Item>>,
    }

    impl MemoryKvStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    fn eval_condition(items: &HashMap<(String, String), Item>, pk: &str, sk: &str, cond: &Condition) -> bool {
        let current = items.get(&(pk.to_string(), sk.to_string()));
        // Supports exactly the small set of condition shapes this crate emits.
        if cond.expression.contains("attribute_not_exists(level) OR level = :reserved") {
            let level_missing = current.map(|i| !i.contains_key("level")).unwrap_or(true);
            let level_reserved = current
                .and_then(|i| i.get("level"))
                .and_then(|v| v.as_n().ok())
                .map(|n| Some(n.as_str()) == cond.values.get(":reserved").and_then(|v| v.as_n().ok()).map(|s| s.as_str()))
                .unwrap_or(false);
            level_missing || level_reserved
        } else if cond.expression.contains("attribute_not_exists(owner) OR owner = :owner") {
            let owner_missing = current.map(|i| !i.contains_key("owner")).unwrap_or(true);
            let owner_match = current
                .and_then(|i| i.get("owner"))
                .and_then(|v| v.as_s().ok())
                .map(|o| Some(o.as_str()) == cond.values.get(":owner").and_then(|v| v.as_s().ok()).map(|s| s.as_str()))
                .unwrap_or(false);
            owner_missing || owner_match
        } else if cond.expression == "owner = :owner" {
            current
                .and_then(|i| i.get("owner"))
                .and_then(|v| v.as_s().ok())
                .map(|o| Some(o.as_str()) == cond.values.get(":owner").and_then(|v| v.as_s().ok()).map(|s| s.as_str()))
                .unwrap_or(false)
        } else if cond.expression == "owner = :owner AND #cnt = :one" {
            let owner_ok = current
                .and_then(|i| i.get("owner"))
                .and_then(|v| v.as_s().ok())
                .map(|o| Some(o.as_str()) == cond.values.get(":owner").and_then(|v| v.as_s().ok()).map(|s| s.as_str()))
                .unwrap_or(false);
            let count_ok = current
                .and_then(|i| i.get("count"))
                .and_then(|v| v.as_n().ok())
                .map(|c| Some(c.as_str()) == cond.values.get(":one").and_then(|v| v.as_n().ok()).map(|s| s.as_str()))
                .unwrap_or(false);
            owner_ok && count_ok
        } else {
            true
        }
    }

    impl KvStore for MemoryKvStore {
        async fn get_item(&self, pk: &str, sk: &str) -> Result<Option<Item>, Error> {
            Ok(self
                .items
                .lock()
                .unwrap()
                .get(&(pk.to_string(), sk.to_string()))
                .cloned())
        }

        async fn put_item(
            &self,
            item: Item,
            condition: Option<Condition>,
        ) -> Result<Conditional<Option<Item>>, Error> {
            let pk = get_s(&item, "key")?;
            let sk = get_s(&item, "range")?;
            let mut items = self.items.lock().unwrap();
            if let Some(cond) = &condition {
                if !eval_condition(&items, &pk, &sk, cond) {
                    return Ok(Conditional::ConditionFailed);
                }
            }
            let old = items.insert((pk, sk), item);
            Ok(Conditional::Ok(old))
        }

        async fn update_item(
            &self,
            pk: &str,
            sk: &str,
            update: Update,
        ) -> Result<Conditional<Item>, Error> {
            let mut items = self.items.lock().unwrap();
            if let Some(cond) = &update.condition {
                if !eval_condition(&items, pk, sk, cond) {
                    return Ok(Conditional::ConditionFailed);
                }
            }
            let key = (pk.to_string(), sk.to_string());
            let mut item = items.get(&key).cloned().unwrap_or_else(|| {
                let mut base = Item::new();
                base.insert("key".into(), AttributeValue::S(pk.to_string()));
                base.insert("range".into(), AttributeValue::S(sk.to_string()));
                base
            });
            apply_update(&mut item, &update);
            items.insert(key, item.clone());
            Ok(Conditional::Ok(item))
        }

        async fn delete_item(&self, pk: &str, sk: &str) -> Result<Option<Item>, Error> {
            Ok(self
                .items
                .lock()
                .unwrap()
                .remove(&(pk.to_string(), sk.to_string())))
        }

        async fn query(&self, pk: &str, _exclusive_start_key: Option<Item>) -> Result<QueryPage, Error> {
            let items = self.items.lock().unwrap();
            let mut matches: Vec<Item> = items
                .iter()
                .filter(|((ipk, _), _)| ipk == pk)
                .map(|(_, v)| v.clone())
                .collect();
            matches.sort_by(|a, b| {
                a.get("range")
                    .and_then(|v| v.as_s().ok())
                    .cmp(&b.get("range").and_then(|v| v.as_s().ok()))
            });
            Ok(QueryPage {
                items: matches,
                last_evaluated_key: None,
            })
        }
    }

    /// Interprets this crate's small fixed set of `UpdateExpression`s
    /// (`ADD`, `SET ... REMOVE ...`, `SET count = if_not_exists(...) + :x`)
    /// against an in-memory item. Good enough for the handful of shapes
    /// `store.rs`/`lock.rs` emit; not a general expression evaluator.
    fn apply_update(item: &mut Item, update: &Update) {
        let expr = update.expression.as_str();
        if expr == "ADD size :dsize" {
            let delta = update
                .values
                .get(":dsize")
                .and_then(|v| v.as_n().ok())
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            let current = get_n(item, "size").unwrap_or(0);
            item.insert("size".into(), n(current + delta));
        } else if expr.starts_with("SET #cnt = if_not_exists(#cnt, :initial) + :increment") {
            let current = get_n(item, "count").unwrap_or(0);
            item.insert("count".into(), n(current + 1));
        } else if expr.starts_with("SET #lvl = :level, #own = :owner") {
            if let Some(level) = update.values.get(":level") {
                item.insert("level".into(), level.clone());
            }
            if let Some(owner) = update.values.get(":owner") {
                item.insert("owner".into(), owner.clone());
            }
        } else if expr == "REMOVE #lvl, #own" {
            item.remove("level");
            item.remove("owner");
        } else if expr == "SET #cnt = #cnt - :increment REMOVE #lvl, #own" {
            let current = get_n(item, "count").unwrap_or(0);
            item.insert("count".into(), n(current - 1));
            item.remove("level");
            item.remove("owner");
        } else if expr == "SET #cnt = #cnt - :increment" {
            let current = get_n(item, "count").unwrap_or(0);
            let delta = update
                .values
                .get(":increment")
                .and_then(|v| v.as_n().ok())
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            item.insert("count".into(), n(current - delta));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MemoryKvStore;
    use super::*;

    #[tokio::test]
    async fn put_then_get_block_round_trips() {
        let store = BlockStore::new(MemoryKvStore::new());
        let delta = store.put_block("f", 0, b"hello").await.unwrap();
        assert_eq!(delta, 5);
        let data = store.get_block("f", 0).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn missing_block_reads_as_empty() {
        let store = BlockStore::new(MemoryKvStore::new());
        let data = store.get_block("f", 3).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn put_block_delta_accounts_for_overwrite() {
        let store = BlockStore::new(MemoryKvStore::new());
        store.put_block("f", 0, b"hello").await.unwrap();
        let delta = store.put_block("f", 0, b"hi").await.unwrap();
        assert_eq!(delta, -3);
    }

    #[tokio::test]
    async fn delete_block_returns_negative_delta() {
        let store = BlockStore::new(MemoryKvStore::new());
        store.put_block("f", 0, b"hello").await.unwrap();
        let delta = store.delete_block("f", 0).await.unwrap();
        assert_eq!(delta, -5);
        assert!(store.get_block("f", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_total_accumulates() {
        let store = BlockStore::new(MemoryKvStore::new());
        store.update_total("f", 10).await.unwrap();
        store.update_total("f", -3).await.unwrap();
        assert_eq!(store.get_total("f").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn blocks_in_order_sorted_by_block_number() {
        let store = BlockStore::new(MemoryKvStore::new());
        store.put_block("f", 2, b"c").await.unwrap();
        store.put_block("f", 0, b"a").await.unwrap();
        store.put_block("f", 1, b"b").await.unwrap();
        let blocks = store.blocks_in_order("f").await.unwrap();
        let nums: Vec<u64> = blocks.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(nums, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn access_marker_lifecycle() {
        let store = BlockStore::new(MemoryKvStore::new());
        assert!(!store.access_exists("f").await.unwrap());
        store.mark_access("f").await.unwrap();
        assert!(store.access_exists("f").await.unwrap());
        store.delete_access("f").await.unwrap();
        assert!(!store.access_exists("f").await.unwrap());
    }
}
