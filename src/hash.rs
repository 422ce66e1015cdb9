//! Command hashing for the build log.
//!
//! Outputs are judged stale when the hash of the command that would produce
//! them differs from the hash recorded on the last successful run.  The hash
//! is 64-bit MurmurHash2, matching the on-disk log format.

const SEED: u64 = 0xDECAFBADDECAFBAD;

/// 64-bit MurmurHash2, by Austin Appleby.
fn murmur_hash_64a(data: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4a7935bd1e995;
    const R: u32 = 47;

    let mut h = seed ^ (data.len() as u64).wrapping_mul(M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u64 = 0;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u64) << (8 * i);
        }
        h ^= k;
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// Hash a command line as recorded in the build log.
pub fn hash_command(command: &str) -> u64 {
    murmur_hash_64a(command.as_bytes(), SEED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinguishes_commands() {
        assert_ne!(hash_command("cc foo.c"), hash_command("cc -O2 foo.c"));
        assert_ne!(hash_command(""), hash_command(" "));
    }

    #[test]
    fn stable_across_calls() {
        let cmd = "cc foo.c -o foo.o;rspfile=extra args";
        assert_eq!(hash_command(cmd), hash_command(cmd));
    }

    #[test]
    fn tail_bytes_contribute() {
        // Commands differing only in the last (non-8-aligned) bytes must
        // hash differently.
        assert_ne!(hash_command("12345678a"), hash_command("12345678b"));
        assert_ne!(hash_command("1234567"), hash_command("1234568"));
    }
}
