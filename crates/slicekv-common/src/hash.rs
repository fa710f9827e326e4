//! Key placement hash
//!
//! Hsieh SuperFastHash over the key bytes. Shard routing is a plain
//! modulo over this hash, so the arithmetic here is load-bearing: any
//! change to it silently strands data written by earlier builds.

/// Hashes a key for shard placement.
///
/// Empty keys hash to 0. Trailing bytes that do not fill a 16-bit word
/// are mixed in sign-extended; that quirk is part of the on-disk
/// placement contract and must not be "fixed".
pub fn hash_key(key: &[u8]) -> u32 {
    let len = key.len();
    if len == 0 {
        return 0;
    }

    let mut hash = len as u32;
    let rem = len & 3;
    let mut i = 0;

    for _ in 0..(len >> 2) {
        hash = hash.wrapping_add(get16(key, i));
        let tmp = (get16(key, i + 2) << 11) ^ hash;
        hash = (hash << 16) ^ tmp;
        i += 4;
        hash = hash.wrapping_add(hash >> 11);
    }

    match rem {
        3 => {
            hash = hash.wrapping_add(get16(key, i));
            hash ^= hash << 16;
            hash ^= ((i32::from(key[i + 2] as i8)) << 18) as u32;
            hash = hash.wrapping_add(hash >> 11);
        }
        2 => {
            hash = hash.wrapping_add(get16(key, i));
            hash ^= hash << 11;
            hash = hash.wrapping_add(hash >> 17);
        }
        1 => {
            hash = hash.wrapping_add(i32::from(key[i] as i8) as u32);
            hash ^= hash << 10;
            hash = hash.wrapping_add(hash >> 1);
        }
        _ => {}
    }

    hash ^= hash << 3;
    hash = hash.wrapping_add(hash >> 5);
    hash ^= hash << 4;
    hash = hash.wrapping_add(hash >> 17);
    hash ^= hash << 25;
    hash = hash.wrapping_add(hash >> 6);

    hash
}

/// Little-endian unsigned 16-bit load at byte offset `i`.
fn get16(data: &[u8], i: usize) -> u32 {
    u32::from(data[i]) | (u32::from(data[i + 1]) << 8)
}

/// Routes a key to one of `n_shards` data shards.
pub fn shard_for_key(key: &[u8], n_shards: u32) -> u32 {
    debug_assert!(n_shards > 0);
    hash_key(key) % n_shards
}
