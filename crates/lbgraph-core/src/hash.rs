/// Hashing through one reusable xxh64 hasher per thread.
pub(crate) mod thread_local_xxhash {
    use std::cell::RefCell;
    use std::hash::Hash;

    use xxhash_rust::xxh64::Xxh64;

    // every replica has to agree on shard buckets and checksums, so the seed
    // is fixed.
    const SEED: u64 = 0;

    thread_local! {
        static XXH64: RefCell<Xxh64> = const { RefCell::new(Xxh64::new(SEED)) };
    }

    fn digest(feed: impl FnOnce(&mut Xxh64)) -> u64 {
        XXH64.with_borrow_mut(|state| {
            state.reset(SEED);
            feed(state);
            state.digest()
        })
    }

    /// The xxh64 digest of one value. Pass a tuple to hash several fields of
    /// different types together.
    pub(crate) fn hash<T: Hash + ?Sized>(value: &T) -> u64 {
        digest(|state| value.hash(state))
    }

    /// The xxh64 digest of a sequence of values, in iteration order.
    pub(crate) fn hash_iter<T: Hash>(values: impl IntoIterator<Item = T>) -> u64 {
        digest(|state| values.into_iter().for_each(|v| v.hash(state)))
    }
}

// Node checksums are 32 bits wide. Everything here folds an xxh64 digest down
// instead of running a separate 32 bit hash.
//
// Strings are hashed through std::hash::Hash, which terminates every str with
// a 0xff byte. That keeps adjacent fields from running together, so
// ("ab", "c") and ("a", "bc") never collide by construction.

/// Compute a 32 bit checksum of a single hashable value.
pub(crate) fn checksum<H: std::hash::Hash + ?Sized>(h: &H) -> u32 {
    fold(thread_local_xxhash::hash(h))
}

/// Compute a 32 bit checksum of a set of strings, ignoring their order.
pub(crate) fn checksum_unordered<S: AsRef<str>>(items: &[S]) -> u32 {
    let mut sorted: Vec<&str> = items.iter().map(|s| s.as_ref()).collect();
    sorted.sort_unstable();
    fold(thread_local_xxhash::hash_iter(sorted))
}

fn fold(h: u64) -> u32 {
    (h ^ (h >> 32)) as u32
}
