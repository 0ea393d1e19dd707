//! Serializer (C6): streams a whole file between block items and a
//! contiguous byte sequence, per spec §4.6.
//!
//! Both directions are expressed as small async pull-based cursors rather
//! than a `Stream` impl — a single reader drives each one chunk at a time,
//! the same "lazy, finite, non-restartable sequence" the design note
//! describes, just without the extra machinery a fully generic `Stream`
//! would need for a shape this narrow.

use std::future::Future;

use tracing::{debug, info};

use crate::error::Error;
use crate::store::{get_b, BlockStore, Item, KvStore};

/// Largest file SQLite's own format will address: `2^32 - 2` pages of
/// `65536` bytes, the ceiling `read(n=-1)` is bounded by.
pub const MAX_DB_FILE_SIZE: u64 = 4_294_967_294 * 65536;

/// A source of byte chunks pulled one at a time, in order, until exhausted.
/// Implemented by [`SerializeIter`] itself (so one table's file can be
/// piped into another path, or another table, without buffering the whole
/// file) and by anything else that can hand back chunks on demand.
pub trait ByteSource: Send {
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, Error>> + Send;
}

/// Lazily yields the block bytes of `path` in ascending block order,
/// fetching query pages from the store only as the consumer exhausts the
/// previous one. Never yields an empty chunk: the engine reads treat an
/// empty result as EOF.
pub struct SerializeIter<S> {
    store: BlockStore<S>,
    path: String,
    page: std::collections::VecDeque<Item>,
    start: Option<Item>,
    exhausted: bool,
}

impl<S: KvStore> SerializeIter<S> {
    pub fn new(store: BlockStore<S>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            page: std::collections::VecDeque::new(),
            start: None,
            exhausted: false,
        }
    }

    async fn fetch_next_page(&mut self) -> Result<(), Error> {
        let page = self
            .store
            .query_blocks_page(&self.path, self.start.take())
            .await?;
        self.exhausted = page.last_evaluated_key.is_none();
        self.start = page.last_evaluated_key;
        self.page = page.items.into();
        Ok(())
    }
}

impl<S: KvStore> ByteSource for SerializeIter<S> {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            if let Some(item) = self.page.pop_front() {
                let data = get_b(&item, "data")?;
                if data.is_empty() {
                    continue;
                }
                return Ok(Some(data));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fetch_next_page().await?;
        }
    }
}

/// `serialize_iter(P)`: the lazy, finite, non-restartable block-byte
/// sequence for `path`, honoring the store's own Query pagination.
pub fn serialize_iter<S: KvStore>(store: &BlockStore<S>, path: &str) -> SerializeIter<S>
where
    S: Clone,
{
    SerializeIter::new(store.clone(), path)
}

/// `serialize_fileobj(P)`: a byte-stream reader over [`SerializeIter`]
/// supporting `read(n)` with an arbitrary carry buffer, so callers can
/// request any chunk size independent of block boundaries.
pub struct SerializeReader<B> {
    source: B,
    carry: Vec<u8>,
    offset: usize,
}

impl<B: ByteSource> SerializeReader<B> {
    pub fn new(source: B) -> Self {
        Self {
            source,
            carry: Vec::new(),
            offset: 0,
        }
    }

    /// `read(n)`; pass `None` for `n = -1` ("all", bounded by
    /// [`MAX_DB_FILE_SIZE`]).
    pub async fn read(&mut self, n: Option<u64>) -> Result<Vec<u8>, Error> {
        let mut want = n.unwrap_or(MAX_DB_FILE_SIZE);
        let mut out = Vec::new();
        while want > 0 {
            if self.offset == self.carry.len() {
                match self.source.next_chunk().await? {
                    Some(chunk) => {
                        self.carry = chunk;
                        self.offset = 0;
                    }
                    None => break,
                }
            }
            let available = (self.carry.len() - self.offset) as u64;
            let take = want.min(available) as usize;
            out.extend_from_slice(&self.carry[self.offset..self.offset + take]);
            self.offset += take;
            want -= take as u64;
        }
        Ok(out)
    }
}

/// `deserialize_iter(P, byte_source)`: reads `source` to exhaustion,
/// repacks it into `block_size`-sized chunks, writes each as a block item
/// with incrementing sort keys, then writes `FSIZE/P.size` as the total
/// bytes consumed. Overwrites any existing blocks at `path` starting from
/// block 0 — restoring into a path that already holds more blocks than
/// the new content needs leaves the tail blocks behind; callers that care
/// should `xDelete` first.
pub async fn deserialize_iter<S: KvStore>(
    store: &BlockStore<S>,
    path: &str,
    block_size: u64,
    mut source: impl ByteSource,
) -> Result<u64, Error> {
    let block_size = block_size as usize;
    let mut carry: Vec<u8> = Vec::new();
    let mut block_no: u64 = 0;
    let mut total: u64 = 0;

    loop {
        while carry.len() < block_size {
            match source.next_chunk().await? {
                Some(chunk) => carry.extend_from_slice(&chunk),
                None => break,
            }
        }
        if carry.is_empty() {
            break;
        }
        let take = carry.len().min(block_size);
        let block_bytes: Vec<u8> = carry.drain(..take).collect();
        let written = block_bytes.len();
        store.put_block(path, block_no, &block_bytes).await?;
        total += written as u64;
        debug!(path, block = block_no, bytes = written, "deserialize_iter: wrote block");
        block_no += 1;
        if written < block_size {
            // `carry` drained down to exactly what the source had left.
            break;
        }
    }

    store.set_total(path, total as i64).await?;
    info!(path, blocks = block_no, bytes = total, "deserialize_iter: complete");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::MemoryKvStore;

    /// A fixed sequence of pre-chunked byte buffers, for feeding
    /// `deserialize_iter` without going through a `SerializeIter`.
    struct StaticByteSource {
        chunks: std::collections::VecDeque<Vec<u8>>,
    }

    impl StaticByteSource {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
            }
        }
    }

    impl ByteSource for StaticByteSource {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
            Ok(self.chunks.pop_front())
        }
    }

    #[tokio::test]
    async fn serialize_iter_yields_blocks_in_order() {
        let store = BlockStore::new(MemoryKvStore::new());
        store.put_block("f", 0, b"aaaa").await.unwrap();
        store.put_block("f", 2, b"cccc").await.unwrap();
        store.put_block("f", 1, b"bbbb").await.unwrap();

        let mut it = serialize_iter(&store, "f");
        assert_eq!(it.next_chunk().await.unwrap(), Some(b"aaaa".to_vec()));
        assert_eq!(it.next_chunk().await.unwrap(), Some(b"bbbb".to_vec()));
        assert_eq!(it.next_chunk().await.unwrap(), Some(b"cccc".to_vec()));
        assert_eq!(it.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn serialize_reader_respects_requested_length() {
        let store = BlockStore::new(MemoryKvStore::new());
        store.put_block("f", 0, b"0123456789").await.unwrap();

        let mut reader = SerializeReader::new(serialize_iter(&store, "f"));
        assert_eq!(reader.read(Some(3)).await.unwrap(), b"012".to_vec());
        assert_eq!(reader.read(Some(100)).await.unwrap(), b"3456789".to_vec());
        assert_eq!(reader.read(Some(10)).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn serialize_reader_read_all_spans_multiple_blocks() {
        let store = BlockStore::new(MemoryKvStore::new());
        store.put_block("f", 0, b"hello ").await.unwrap();
        store.put_block("f", 1, b"world").await.unwrap();

        let mut reader = SerializeReader::new(serialize_iter(&store, "f"));
        assert_eq!(reader.read(None).await.unwrap(), b"hello world".to_vec());
    }

    #[tokio::test]
    async fn deserialize_iter_rechunks_arbitrary_boundaries() {
        let store = BlockStore::new(MemoryKvStore::new());
        let source = StaticByteSource::new(vec![b"abc".to_vec(), b"de".to_vec(), b"fghij".to_vec()]);

        let total = deserialize_iter(&store, "f", 4, source).await.unwrap();
        assert_eq!(total, 10);
        assert_eq!(store.get_block("f", 0).await.unwrap(), b"abcd".to_vec());
        assert_eq!(store.get_block("f", 1).await.unwrap(), b"efgh".to_vec());
        assert_eq!(store.get_block("f", 2).await.unwrap(), b"ij".to_vec());
        assert_eq!(store.get_total("f").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn deserialize_iter_empty_source_writes_zero_total() {
        let store = BlockStore::new(MemoryKvStore::new());
        let source = StaticByteSource::new(vec![]);

        let total = deserialize_iter(&store, "f", 16, source).await.unwrap();
        assert_eq!(total, 0);
        assert_eq!(store.get_total("f").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn round_trips_through_serialize_and_deserialize() {
        let original = BlockStore::new(MemoryKvStore::new());
        original.put_block("f", 0, b"0123456789").await.unwrap();
        original.put_block("f", 1, b"abcdefghij").await.unwrap();
        original.put_block("f", 2, b"XY").await.unwrap();

        let restored = BlockStore::new(MemoryKvStore::new());
        let source = serialize_iter(&original, "f");
        deserialize_iter(&restored, "g", 7, source).await.unwrap();

        let mut reader = SerializeReader::new(serialize_iter(&restored, "g"));
        let bytes = reader.read(None).await.unwrap();
        assert_eq!(bytes, b"0123456789abcdefghijXY".to_vec());
    }

    /// Builds a real SQLite file on local disk with `rusqlite`, then checks
    /// that `deserialize_iter` followed by `serialize_iter` reproduces it
    /// byte-for-byte, per spec §8's "serialize → external file" property.
    #[tokio::test]
    async fn round_trips_a_real_sqlite_file_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("cool.db");
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.pragma_update(None, "page_size", 4096).unwrap();
            conn.execute("CREATE TABLE foo (a INTEGER, b INTEGER)", [])
                .unwrap();
            for _ in 0..100 {
                conn.execute("INSERT INTO foo (a, b) VALUES (1, 2)", [])
                    .unwrap();
            }
            conn.execute("VACUUM", []).unwrap();
        }
        let original_bytes = std::fs::read(&db_path).unwrap();

        let store = BlockStore::new(MemoryKvStore::new());
        let source = StaticByteSource::new(vec![original_bytes.clone()]);
        deserialize_iter(&store, "cool.db", 4060, source).await.unwrap();

        let mut reader = SerializeReader::new(serialize_iter(&store, "cool.db"));
        let round_tripped = reader.read(None).await.unwrap();
        assert_eq!(round_tripped, original_bytes);
        assert_eq!(
            store.get_total("cool.db").await.unwrap() as usize,
            original_bytes.len()
        );
    }
}
