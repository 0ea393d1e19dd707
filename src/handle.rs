//! File handle (C3): the per-open VFS callbacks implemented over the
//! block store and lock manager, per spec §4.3.

use sqlite_vfs::{DatabaseHandle, LockKind, WalDisabled};
use tracing::instrument;

use crate::error::Error as DdbError;
use crate::lock::LockManager;
use crate::store::{BlockStore, KvStore};

/// The SQLite "lock byte page" offset the engine deliberately skips
/// writing. Blocks preceding it must be padded to a full block when the
/// hole is first crossed, so serialization reconstructs the engine's
/// expected file layout.
pub const LOCK_PAGE_OFFSET: u64 = 1_073_741_824;

fn wrap(err: DdbError) -> sqlite_vfs::error::Error<DdbError> {
    sqlite_vfs::error::Error::External { cause: err }
}

/// Lazily yields `(block, start, consume)` triples covering a byte range,
/// advancing `offset` and shrinking `amount` by `consume` each step.
struct BlockCoords {
    block_size: u64,
    offset: u64,
    remaining: u64,
}

impl BlockCoords {
    fn new(block_size: u64, offset: u64, amount: u64) -> Self {
        Self {
            block_size,
            offset,
            remaining: amount,
        }
    }
}

impl Iterator for BlockCoords {
    type Item = (u64, u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let block = self.offset / self.block_size;
        let start = self.offset % self.block_size;
        let consume = (self.block_size - start).min(self.remaining);
        self.offset += consume;
        self.remaining -= consume;
        Some((block, start, consume))
    }
}

/// A file handle opened against one `(pathname, table)` pair. Each handle
/// owns a random `client_id` used to tag writer claims in the lock
/// manager; handles do not share in-memory state with each other.
pub struct Handle<S: KvStore + Clone> {
    pub path: String,
    pub block_size: u64,
    pub blocks: BlockStore<S>,
    pub locks: LockManager<S>,
}

impl<S: KvStore + Clone> Handle<S> {
    pub fn new(store: S, path: impl Into<String>, block_size: u64) -> Self {
        let path = path.into();
        let client_id = uuid::Uuid::new_v4().to_string();
        Self {
            blocks: BlockStore::new(store.clone()),
            locks: LockManager::new(store, path.clone(), client_id),
            path,
            block_size,
        }
    }

    fn coords(&self, offset: u64, amount: u64) -> BlockCoords {
        BlockCoords::new(self.block_size, offset, amount)
    }

    /// `xRead(amount, offset) -> bytes`, concatenated across blocks.
    /// Missing blocks contribute empty bytes; the returned buffer may be
    /// shorter than `amount` if the file is shorter.
    async fn read(&self, amount: u64, offset: u64) -> Result<Vec<u8>, DdbError> {
        let mut out = Vec::with_capacity(amount as usize);
        for (block, start, consume) in self.coords(offset, amount) {
            let data = self.blocks.get_block(&self.path, block).await?;
            let start = start as usize;
            let end = (start + consume as usize).min(data.len());
            if start < data.len() {
                out.extend_from_slice(&data[start..end]);
            }
        }
        Ok(out)
    }

    /// Pads every full block preceding `first_data_block` back to
    /// `last_block` (inclusive) up to `block_size` bytes, stopping at the
    /// first block that is already full. Spec §4.3 step 1.
    async fn pad_preceding_blocks(&self, first_data_block: u64, last_block: u64) -> Result<i64, DdbError> {
        let mut delta = 0;
        let mut block = first_data_block;
        while block >= last_block {
            let existing = self.blocks.get_block(&self.path, block).await?;
            if existing.len() as u64 == self.block_size {
                break;
            }
            let mut padded = existing;
            padded.resize(self.block_size as usize, 0);
            delta += self.blocks.put_block(&self.path, block, &padded).await?;
            if block == 0 {
                break;
            }
            block -= 1;
        }
        Ok(delta)
    }

    /// `xWrite(data, offset)`.
    async fn write(&self, data: &[u8], offset: u64) -> Result<(), DdbError> {
        let mut delta = 0i64;

        if offset == LOCK_PAGE_OFFSET + data.len() as u64 {
            let data_first_block = offset / self.block_size;
            let lock_page_block = LOCK_PAGE_OFFSET / self.block_size;
            if data_first_block > 0 {
                delta += self
                    .pad_preceding_blocks(data_first_block - 1, lock_page_block)
                    .await?;
            }
        }

        let mut data_offset = 0usize;
        for (block, start, write_len) in self.coords(offset, data.len() as u64) {
            let write_len = write_len as usize;
            let chunk = &data[data_offset..data_offset + write_len];

            let to_write = if start != 0 || write_len as u64 != self.block_size {
                let mut existing = self.blocks.get_block(&self.path, block).await?;
                let start = start as usize;
                if existing.len() < start {
                    existing.resize(start, 0);
                }
                let mut merged = existing[..start.min(existing.len())].to_vec();
                merged.extend_from_slice(chunk);
                if existing.len() > start + write_len {
                    merged.extend_from_slice(&existing[start + write_len..]);
                }
                merged
            } else {
                chunk.to_vec()
            };

            data_offset += write_len;
            delta += self.blocks.put_block(&self.path, block, &to_write).await?;
        }

        self.blocks.update_total(&self.path, delta).await?;
        Ok(())
    }

    /// `xTruncate(newsize)`.
    async fn truncate(&self, newsize: u64) -> Result<(), DdbError> {
        let blocks = self.blocks.blocks_in_order(&self.path).await?;
        let mut total: i64 = 0;
        let mut delta: i64 = 0;
        for (block, size, data) in blocks {
            total += size;
            let to_keep = (size - total + newsize as i64).max(0);
            if to_keep == 0 {
                delta += self.blocks.delete_block(&self.path, block).await?;
            } else if to_keep < size {
                let kept = &data[..to_keep as usize];
                delta += self.blocks.put_block(&self.path, block, kept).await?;
            }
        }
        self.blocks.update_total(&self.path, delta).await?;
        Ok(())
    }
}

impl<S: KvStore + Clone + Sync> DatabaseHandle for Handle<S> {
    type WalIndex = WalDisabled;
    type Error = DdbError;

    #[instrument(skip(self))]
    async fn size(&self) -> Result<u64, sqlite_vfs::error::Error<Self::Error>> {
        let total = self.blocks.get_total(&self.path).await.map_err(wrap)?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self, buf))]
    async fn read_exact_at(
        &mut self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), sqlite_vfs::error::Error<Self::Error>> {
        let data = self.read(buf.len() as u64, offset).await.map_err(wrap)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < buf.len() {
            buf[n..].fill(0);
            return Err(sqlite_vfs::error::Error::UnexpectedEof);
        }
        Ok(())
    }

    #[instrument(skip(self, buf))]
    async fn write_all_at(
        &mut self,
        buf: &[u8],
        offset: u64,
    ) -> Result<(), sqlite_vfs::error::Error<Self::Error>> {
        self.write(buf, offset).await.map_err(wrap)
    }

    async fn sync(&mut self, _data_only: bool) -> Result<(), sqlite_vfs::error::Error<Self::Error>> {
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_len(&mut self, size: u64) -> Result<(), sqlite_vfs::error::Error<Self::Error>> {
        self.truncate(size).await.map_err(wrap)
    }

    #[instrument(skip(self))]
    async fn lock(&mut self, lock: LockKind) -> Result<bool, sqlite_vfs::error::Error<Self::Error>> {
        match self.locks.lock(lock).await {
            Ok(()) => Ok(true),
            Err(DdbError::Busy) => Ok(false),
            Err(e) => Err(wrap(e)),
        }
    }

    #[instrument(skip(self))]
    async fn unlock(&mut self, lock: LockKind) -> Result<bool, sqlite_vfs::error::Error<Self::Error>> {
        match self.locks.unlock(lock).await {
            Ok(()) => Ok(true),
            Err(DdbError::Busy) => Ok(false),
            Err(e) => Err(wrap(e)),
        }
    }

    async fn reserved(&mut self) -> Result<bool, sqlite_vfs::error::Error<Self::Error>> {
        self.locks.check_reserved().await.map_err(wrap)
    }

    async fn current_lock(&self) -> Result<LockKind, sqlite_vfs::error::Error<Self::Error>> {
        Ok(self.locks.current_lock())
    }

    async fn wal_index(
        &self,
        _readonly: bool,
    ) -> Result<Self::WalIndex, sqlite_vfs::error::Error<Self::Error>> {
        Ok(WalDisabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::MemoryKvStore;
    use std::sync::Arc;

    fn handle(block_size: u64) -> Handle<Arc<MemoryKvStore>> {
        Handle::new(Arc::new(MemoryKvStore::new()), "f", block_size)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let h = handle(16);
        h.write(b"hello world", 0).await.unwrap();
        let data = h.read(11, 0).await.unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn write_spanning_multiple_blocks() {
        let h = handle(4);
        h.write(b"abcdefghij", 0).await.unwrap();
        let data = h.read(10, 0).await.unwrap();
        assert_eq!(data, b"abcdefghij");
    }

    #[tokio::test]
    async fn partial_write_preserves_surrounding_bytes() {
        let h = handle(8);
        h.write(b"AAAAAAAA", 0).await.unwrap();
        h.write(b"BB", 3).await.unwrap();
        let data = h.read(8, 0).await.unwrap();
        assert_eq!(data, b"AAABBAAA");
    }

    #[tokio::test]
    async fn read_past_eof_returns_fewer_bytes() {
        let h = handle(8);
        h.write(b"hi", 0).await.unwrap();
        let data = h.read(100, 0).await.unwrap();
        assert_eq!(data, b"hi");
    }

    #[tokio::test]
    async fn total_size_tracks_writes() {
        let h = handle(8);
        h.write(b"hello", 0).await.unwrap();
        assert_eq!(h.blocks.get_total("f").await.unwrap(), 5);
        h.write(b"world", 5).await.unwrap();
        assert_eq!(h.blocks.get_total("f").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn truncate_shortens_trailing_block() {
        let h = handle(8);
        h.write(b"0123456789", 0).await.unwrap();
        h.truncate(5).await.unwrap();
        assert_eq!(h.blocks.get_total("f").await.unwrap(), 5);
        let data = h.read(5, 0).await.unwrap();
        assert_eq!(data, b"01234");
    }

    #[tokio::test]
    async fn truncate_drops_whole_blocks() {
        let h = handle(4);
        h.write(b"aaaabbbbcccc", 0).await.unwrap();
        h.truncate(4).await.unwrap();
        assert_eq!(h.blocks.get_total("f").await.unwrap(), 4);
        assert!(h.blocks.get_block("f", 1).await.unwrap().is_empty());
        assert!(h.blocks.get_block("f", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn truncate_beyond_current_length_is_a_no_op() {
        let h = handle(8);
        h.write(b"hello", 0).await.unwrap();
        h.truncate(1_000).await.unwrap();
        assert_eq!(h.blocks.get_total("f").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn lock_page_crossing_pads_preceding_blocks() {
        // A block size that does not evenly divide the gap between the
        // lock byte page and where the engine resumes writing, so more
        // than one block sits short in that gap until this write pads it.
        let block_size = 100u64;
        let h = handle(block_size);

        let lock_page_block = LOCK_PAGE_OFFSET / block_size;
        let tail_len = (LOCK_PAGE_OFFSET % block_size) as usize; // bytes before the hole in its block
        h.write(&vec![1u8; tail_len], lock_page_block * block_size)
            .await
            .unwrap();

        let page = vec![2u8; 250];
        h.write(&page, LOCK_PAGE_OFFSET + page.len() as u64)
            .await
            .unwrap();

        let data_first_block = (LOCK_PAGE_OFFSET + page.len() as u64) / block_size;
        assert!(data_first_block > lock_page_block + 1);

        // The block adjacent to the new data, entirely inside the gap, is
        // padded to a full block of zeros.
        let gap_block = h
            .blocks
            .get_block("f", data_first_block - 1)
            .await
            .unwrap();
        assert_eq!(gap_block.len() as u64, block_size);
        assert!(gap_block.iter().all(|&b| b == 0));

        // The block straddling the lock byte keeps its pre-hole tail and
        // is zero-padded for the rest.
        let straddling = h.blocks.get_block("f", lock_page_block).await.unwrap();
        assert_eq!(straddling.len() as u64, block_size);
        assert_eq!(&straddling[..tail_len], &vec![1u8; tail_len][..]);
        assert!(straddling[tail_len..].iter().all(|&b| b == 0));
    }
}
