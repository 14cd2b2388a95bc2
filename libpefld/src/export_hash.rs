//! The PEF export hash: the canonical hash word over a symbol name, and the
//! slot/key grouping used to build an output container's export tables.

use crate::pef;

/// Computes the canonical 32-bit hash word for a name: the name length in
/// the high 16 bits, a mixed hash over the bytes in the low 16. Arithmetic
/// is 32-bit signed with wrap-around.
pub fn hash_word(name: &[u8]) -> u32 {
    let mut h: i32 = 0;
    for &byte in name {
        h = ((h << 1).wrapping_sub(h >> 16)) ^ i32::from(byte);
    }
    let mixed = (h ^ (h >> 16)) as u32 & 0xFFFF;
    ((name.len() as u32 & 0xFFFF) << 16) | mixed
}

/// Picks the slot-table power for a given export count: the smallest power
/// of two that keeps the average chain at or under ten entries, capped at
/// 2^16 slots.
pub(crate) fn table_power(export_count: u32) -> u32 {
    let target_slots = export_count.div_ceil(pef::AVERAGE_CHAIN_LENGTH);
    let mut power = 0;
    while (1u32 << power) < target_slots && power < pef::EXPONENT_LIMIT {
        power += 1;
    }
    power
}

/// The export hash table for one output container. Exports are regrouped so
/// that each slot's entries are contiguous; `order[i]` is the caller's index
/// of the export that ends up at table position `i`, and `keys[i]` is its
/// full hash word. Within a slot, the caller's order is preserved.
pub(crate) struct HashTable {
    pub(crate) power: u32,
    /// `(chain_count, first_index)` per slot.
    pub(crate) slots: Vec<(u32, u32)>,
    pub(crate) order: Vec<usize>,
    pub(crate) keys: Vec<u32>,
}

pub(crate) fn build_table(names: &[&[u8]]) -> HashTable {
    let power = table_power(names.len() as u32);
    let slot_count = 1usize << power;

    let hashes: Vec<u32> = names.iter().map(|name| hash_word(name)).collect();

    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); slot_count];
    for (index, hash) in hashes.iter().enumerate() {
        buckets[(*hash as usize) % slot_count].push(index);
    }

    let mut slots = Vec::with_capacity(slot_count);
    let mut order = Vec::with_capacity(names.len());
    let mut keys = Vec::with_capacity(names.len());
    for bucket in &buckets {
        slots.push((bucket.len() as u32, order.len() as u32));
        for &index in bucket {
            order.push(index);
            keys.push(hashes[index]);
        }
    }

    HashTable {
        power,
        slots,
        order,
        keys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A direct transcription of the published algorithm, using wider
    /// arithmetic, as an independent reference.
    fn reference_hash(name: &[u8]) -> u32 {
        let mut h: i64 = 0;
        for &byte in name {
            let shifted = (h << 1) & 0xFFFF_FFFF;
            let shifted = if shifted & 0x8000_0000 != 0 {
                shifted - 0x1_0000_0000
            } else {
                shifted
            };
            let arith_right = h >> 16;
            let mut value = shifted - arith_right;
            value &= 0xFFFF_FFFF;
            if value & 0x8000_0000 != 0 {
                value -= 0x1_0000_0000;
            }
            h = value ^ i64::from(byte);
        }
        let mixed = ((h ^ (h >> 16)) & 0xFFFF) as u32;
        (((name.len() as u32) & 0xFFFF) << 16) | mixed
    }

    #[test]
    fn hash_of_main() {
        assert_eq!(hash_word(b"main") >> 16, 4);
        assert_eq!(hash_word(b"main"), 0x0004_0250);
    }

    #[test]
    fn matches_reference_implementation() {
        let names: &[&[u8]] = &[
            b"",
            b"a",
            b"main",
            b"SysBeep",
            b"InitGraf",
            b"__start",
            b"a_rather_longer_symbol_name_with_underscores",
            &[0xFF, 0x00, 0x80, 0x7F],
        ];
        for name in names {
            assert_eq!(hash_word(name), reference_hash(name), "name {name:?}");
        }
        // Pseudo-random byte strings, deterministic seed.
        let mut state = 0x1234_5678u32;
        for len in 0..64 {
            let bytes: Vec<u8> = (0..len)
                .map(|_| {
                    state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                    (state >> 16) as u8
                })
                .collect();
            assert_eq!(hash_word(&bytes), reference_hash(&bytes));
        }
    }

    #[test]
    fn table_power_scales_with_count() {
        assert_eq!(table_power(0), 0);
        assert_eq!(table_power(1), 0);
        assert_eq!(table_power(10), 0);
        assert_eq!(table_power(11), 1);
        assert_eq!(table_power(21), 2);
        assert_eq!(table_power(u32::MAX), pef::EXPONENT_LIMIT);
    }

    #[test]
    fn table_is_well_formed() {
        let names: Vec<Vec<u8>> = (0..40).map(|i| format!("symbol_{i}").into_bytes()).collect();
        let name_refs: Vec<&[u8]> = names.iter().map(|n| n.as_slice()).collect();
        let table = build_table(&name_refs);
        let slot_count = 1usize << table.power;

        assert_eq!(table.order.len(), names.len());
        assert_eq!(table.keys.len(), names.len());

        for (original_index, name) in name_refs.iter().enumerate() {
            let hash = hash_word(name);
            let slot = (hash as usize) % slot_count;
            let (chain_count, first_index) = table.slots[slot];

            let position = table
                .order
                .iter()
                .position(|&o| o == original_index)
                .unwrap() as u32;
            assert!(first_index <= position && position < first_index + chain_count);
            assert_eq!(table.keys[position as usize], hash);
        }
    }
}
