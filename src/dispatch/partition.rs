//! Partition routing for sinks with parallel delivery channels.
//!
//! A partition is `|hash(key) % partitions|` where the key comes from the
//! configured basis. Rows that are not data (DDL, heartbeats) and rows whose
//! primary basis yields nothing use the fallback basis, so every row kind
//! routes deterministically.

use std::collections::HashMap;

use crate::config::{HashFunctionKind, PartitionBasis, PartitionConfig};
use crate::row::RowEvent;

const MURMUR3_SEED: u32 = 25342;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFunction {
    /// 31-based polynomial string hash over UTF-16 code units.
    Default,
    /// 32-bit Murmur3 (x86 variant) with a fixed seed.
    Murmur3,
}

impl HashFunction {
    pub fn hash(&self, key: &str) -> i32 {
        match self {
            HashFunction::Default => string_hash(key),
            HashFunction::Murmur3 => murmur3_32(key.as_bytes(), MURMUR3_SEED) as i32,
        }
    }
}

impl From<HashFunctionKind> for HashFunction {
    fn from(kind: HashFunctionKind) -> Self {
        match kind {
            HashFunctionKind::Default => HashFunction::Default,
            HashFunctionKind::Murmur3 => HashFunction::Murmur3,
        }
    }
}

fn string_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k |= (*byte as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[derive(Debug, Clone)]
pub struct Partitioner {
    hash: HashFunction,
    basis: PartitionBasis,
    columns: Vec<String>,
    fallback: PartitionBasis,
    fixed: HashMap<String, u32>,
}

enum Route {
    Key(String),
    Fixed(u32),
}

impl Partitioner {
    pub fn new(hash: HashFunction, basis: PartitionBasis, fallback: PartitionBasis) -> Self {
        Self {
            hash,
            basis,
            columns: Vec::new(),
            fallback,
            fixed: HashMap::new(),
        }
    }

    pub fn from_config(config: &PartitionConfig) -> Self {
        Self {
            hash: config.hash_function.into(),
            basis: config.partition_by,
            columns: config.columns.clone(),
            fallback: config.fallback,
            fixed: config.fixed.clone(),
        }
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_fixed(mut self, fixed: HashMap<String, u32>) -> Self {
        self.fixed = fixed;
        self
    }

    /// Partition in `0..partitions` for `row`.
    pub fn partition(&self, row: &RowEvent, partitions: u32) -> u32 {
        let partitions = partitions.max(1);
        let basis = if row.kind.is_data() {
            self.basis
        } else {
            self.fallback
        };

        let route = self
            .route(basis, row)
            .or_else(|| self.route(self.fallback, row))
            .unwrap_or_else(|| Route::Key(row.database.clone()));

        match route {
            Route::Fixed(partition) => partition % partitions,
            Route::Key(key) => {
                let hash = self.hash.hash(&key) as i64;
                (hash % partitions as i64).unsigned_abs() as u32
            }
        }
    }

    fn route(&self, basis: PartitionBasis, row: &RowEvent) -> Option<Route> {
        match basis {
            PartitionBasis::Database => Some(Route::Key(row.database.clone())),
            PartitionBasis::Table => Some(Route::Key(row.table_name().to_string())),
            PartitionBasis::PrimaryKey => Some(Route::Key(row.pk_as_concat_string())),
            PartitionBasis::Column => {
                let key = row.build_partition_key(&self.columns);
                (!key.is_empty()).then_some(Route::Key(key))
            }
            PartitionBasis::Fixed => {
                let qualified = format!("{}.{}", row.database, row.table_name());
                self.fixed
                    .get(&qualified)
                    .or_else(|| self.fixed.get(&row.database))
                    .map(|p| Route::Fixed(*p))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::tests::insert_row;
    use crate::row::RowKind;
    use serde_json::json;

    #[test]
    fn test_murmur3_reference_values() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"hello", 0), 613_153_351);
    }

    #[test]
    fn test_default_hash_matches_polynomial_string_hash() {
        assert_eq!(HashFunction::Default.hash(""), 0);
        assert_eq!(HashFunction::Default.hash("hello"), 99_162_322);
    }

    #[test]
    fn test_partition_is_deterministic_and_in_range() {
        let partitioner = Partitioner::new(
            HashFunction::Murmur3,
            PartitionBasis::PrimaryKey,
            PartitionBasis::Database,
        );
        let mut row = insert_row("shop", "orders", 1).with_primary_key(vec!["id".to_string()]);
        row.data.insert("id".to_string(), json!(42));

        let first = partitioner.partition(&row, 12);
        assert_eq!(partitioner.partition(&row.clone(), 12), first);
        assert!(first < 12);
    }

    #[test]
    fn test_ddl_routes_by_fallback_basis() {
        let partitioner = Partitioner::new(
            HashFunction::Default,
            PartitionBasis::PrimaryKey,
            PartitionBasis::Database,
        );
        let by_database = Partitioner::new(
            HashFunction::Default,
            PartitionBasis::Database,
            PartitionBasis::Database,
        );

        let mut ddl = insert_row("shop", "orders", 1);
        ddl.kind = RowKind::Ddl;
        let mut other_ddl = insert_row("shop", "customers", 2);
        other_ddl.kind = RowKind::Ddl;
        let row = insert_row("shop", "anything", 3);

        for n in [1, 7, 16, 100] {
            let p = partitioner.partition(&ddl, n);
            assert_eq!(partitioner.partition(&other_ddl, n), p);
            assert_eq!(by_database.partition(&row, n), p);
        }
    }

    #[test]
    fn test_fixed_mapping_prefers_table_over_database() {
        let fixed = HashMap::from([
            ("shop".to_string(), 3),
            ("shop.orders".to_string(), 5),
        ]);
        let partitioner = Partitioner::new(
            HashFunction::Default,
            PartitionBasis::Fixed,
            PartitionBasis::Database,
        )
        .with_fixed(fixed);

        assert_eq!(partitioner.partition(&insert_row("shop", "orders", 1), 8), 5);
        assert_eq!(partitioner.partition(&insert_row("shop", "users", 1), 8), 3);

        let unmapped = insert_row("crm", "users", 1);
        let expected = (HashFunction::Default.hash("crm") as i64 % 8).unsigned_abs() as u32;
        assert_eq!(partitioner.partition(&unmapped, 8), expected);
    }

    #[test]
    fn test_column_basis_falls_back_when_columns_missing() {
        let partitioner = Partitioner::new(
            HashFunction::Murmur3,
            PartitionBasis::Column,
            PartitionBasis::Table,
        )
        .with_columns(vec!["tenant".to_string()]);

        let mut row = insert_row("shop", "orders", 1);
        let by_table = partitioner.partition(&row, 32);
        let expected = (HashFunction::Murmur3.hash("orders") as i64 % 32).unsigned_abs() as u32;
        assert_eq!(by_table, expected);

        row.data.insert("tenant".to_string(), json!("acme"));
        let expected = (HashFunction::Murmur3.hash("acme") as i64 % 32).unsigned_abs() as u32;
        assert_eq!(partitioner.partition(&row, 32), expected);
    }
}
