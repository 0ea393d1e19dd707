//! Key schema & codec (C1): pure string formatting for the four item kinds
//! that share the table, keyed by `(key, range)`.

/// Partition key for the access-marker item kind.
pub const ACCESS_PK: &str = "ACCESS";

/// Partition key for the running-size-counter item kind.
pub const FSIZE_PK: &str = "FSIZE";

/// Partition key for the lock-record item kind.
pub const LOCK_PK: &str = "LK";

/// Partition key for a path's block items.
pub fn block_pk(path: &str) -> String {
    format!("BL_{path}")
}

/// Sort key for block number `n`, zero-padded to 10 digits so ascending
/// lexicographic order matches ascending numeric order.
pub fn block_sk(n: u64) -> String {
    format!("{n:010}")
}

/// Parse a block sort key back into its block number.
pub fn parse_block_sk(sk: &str) -> Option<u64> {
    sk.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_sort_keys_are_lexicographically_ordered() {
        let mut keys: Vec<String> = (0..12).map(block_sk).collect();
        let sorted = {
            let mut v = keys.clone();
            v.sort();
            v
        };
        keys.sort_by_key(|k| parse_block_sk(k).unwrap());
        assert_eq!(keys, sorted);
    }

    #[test]
    fn block_sk_is_ten_digits() {
        assert_eq!(block_sk(0), "0000000000");
        assert_eq!(block_sk(42), "0000000042");
        assert_eq!(block_sk(9_999_999_999), "9999999999");
    }

    #[test]
    fn block_pk_disjoint_from_other_prefixes() {
        let pk = block_pk("a-test/cool.db");
        assert_ne!(pk, ACCESS_PK);
        assert_ne!(pk, FSIZE_PK);
        assert_ne!(pk, LOCK_PK);
    }
}
