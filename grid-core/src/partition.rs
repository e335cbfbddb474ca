use std::sync::Arc;

use uuid::Uuid;

pub const PARTITION_HASH_SEED: u32 = 0x0100_0193;

pub fn murmur3_x86_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();
    for chunk in chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let mut k1 = 0u32;
    if tail.len() >= 3 {
        k1 ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 ^= tail[0] as u32;
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

/// Maps serialized key bytes onto `[0, partition_count)`.
pub fn partition_id(key: &[u8], partition_count: u32) -> i32 {
    if partition_count == 0 {
        return -1;
    }
    let hash = murmur3_x86_32(key, PARTITION_HASH_SEED) as i32;
    let hash = if hash == i32::MIN { 0 } else { hash.abs() };
    hash % partition_count as i32
}

/// Partition id -> owner member. Replaced wholesale, never patched.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub enum PartitionTable {
    #[default]
    Unknown,
    Known(Arc<[Uuid]>),
}

impl PartitionTable {
    pub fn new(owners: Vec<Uuid>) -> Self {
        if owners.is_empty() {
            PartitionTable::Unknown
        } else {
            PartitionTable::Known(owners.into())
        }
    }

    pub fn owner(&self, partition_id: i32) -> Option<Uuid> {
        match self {
            PartitionTable::Unknown => None,
            PartitionTable::Known(owners) => {
                usize::try_from(partition_id).ok().and_then(|id| owners.get(id).copied())
            }
        }
    }

    pub fn partition_count(&self) -> u32 {
        match self {
            PartitionTable::Unknown => 0,
            PartitionTable::Known(owners) => owners.len() as u32,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, PartitionTable::Known(_))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use crate::partition::{murmur3_x86_32, partition_id, PartitionTable};

    #[test]
    fn test_murmur3_reference_vectors() {
        assert_eq!(murmur3_x86_32(b"", 0), 0);
        assert_eq!(murmur3_x86_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_x86_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(
            murmur3_x86_32(b"The quick brown fox jumps over the lazy dog", 0),
            0x2e4f_f723
        );
    }

    #[test]
    fn test_partition_id_in_range_and_stable() {
        for i in 0..1000 {
            let key = format!("key{}", i);
            let id = partition_id(key.as_bytes(), 271);
            assert!((0..271).contains(&id));
            assert_eq!(id, partition_id(key.as_bytes(), 271));
        }
        assert_eq!(partition_id(b"key", 0), -1);
    }

    #[test]
    fn test_partition_table_lookup() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let table = PartitionTable::new(vec![a, b, a]);
        assert_eq!(table.partition_count(), 3);
        assert_eq!(table.owner(0), Some(a));
        assert_eq!(table.owner(1), Some(b));
        assert_eq!(table.owner(3), None);
        assert_eq!(table.owner(-1), None);
        assert!(!PartitionTable::new(vec![]).is_known());
        assert_eq!(PartitionTable::Unknown.owner(0), None);
    }
}
