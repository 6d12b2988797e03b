//! Sources of certificate serial numbers.
//!
//! An [`Authority`](crate::Authority) owns exactly one [`SerialNumberSource`]
//! and asks it for a fresh serial for every certificate it signs. All sources
//! hand out positive, non-zero values, because `0` asks the issuer for a
//! random 128-bit serial instead.
use std::{
    fmt::Debug,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::{Rng, SeedableRng, rngs::StdRng};

/// All bits of a positive `i64`.
const SERIAL_MASK: u64 = i64::MAX.unsigned_abs();

/// Produces serial numbers for signed certificates.
///
/// Implementations must be safe to call from many threads at once and must
/// never return the same value twice during their lifetime.
pub trait SerialNumberSource: Send + Sync + Debug {
    fn next_serial(&self) -> i64;
}

/// Hands out random looking serials from a generator seeded with the wall
/// clock.
///
/// Each serial is a keyed permutation of a counter over the 63-bit positive
/// range, so no value repeats within 2^63 draws. Drawing is lock free and
/// keeps no record of issued serials. The generator is not cryptographically
/// secure.
#[derive(Debug)]
pub struct RandomSerialSource {
    counter: AtomicU64,
    multipliers: [u64; 2],
    key: u64,
}

impl RandomSerialSource {
    pub fn new() -> Self {
        Self::with_seed(clock_seed())
    }

    /// Creates a source with a fixed seed, which produces a reproducible
    /// sequence.
    pub fn with_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        // Odd multipliers are invertible modulo 2^63
        Self {
            counter: AtomicU64::new(0),
            multipliers: [rng.random::<u64>() | 1, rng.random::<u64>() | 1],
            key: rng.random::<u64>() & SERIAL_MASK,
        }
    }

    /// A bijection on `0..2^63`.
    fn permute(&self, index: u64) -> u64 {
        let mut value = index.wrapping_mul(self.multipliers[0]) & SERIAL_MASK;
        value ^= self.key;
        value ^= value >> 31;
        value.wrapping_mul(self.multipliers[1]) & SERIAL_MASK
    }
}

impl Default for RandomSerialSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialNumberSource for RandomSerialSource {
    fn next_serial(&self) -> i64 {
        loop {
            let index = self.counter.fetch_add(1, Ordering::Relaxed);

            // Zero comes up once per 2^63 draws
            match i64::try_from(self.permute(index)) {
                Ok(serial) if serial > 0 => return serial,
                _ => {}
            }
        }
    }
}

/// Hands out increasing serials, starting at a value derived from the wall
/// clock so that restarts are unlikely to reuse old serials.
#[derive(Debug)]
pub struct SequentialSerialSource {
    next: AtomicI64,
}

impl SequentialSerialSource {
    pub fn new() -> Self {
        // Nanoseconds since the epoch fit into an i64 until the year 2262
        Self::starting_at(i64::try_from(clock_seed()).unwrap_or(1))
    }

    /// Creates a source whose first serial is `first`. Values below `1` are
    /// raised to `1`.
    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first.max(1)),
        }
    }
}

impl Default for SequentialSerialSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialNumberSource for SequentialSerialSource {
    fn next_serial(&self) -> i64 {
        // Wraps around to 1 after i64::MAX, which takes a few hundred years
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                Some(next.checked_add(1).unwrap_or(1))
            })
            .unwrap_or_else(|next| next)
    }
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |duration| duration.as_nanos() as u64)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use rstest::rstest;

    use super::*;

    fn draw_concurrently(
        source: Arc<dyn SerialNumberSource>,
        threads: usize,
        per_thread: usize,
    ) -> Vec<i64> {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let source = Arc::clone(&source);
                thread::spawn(move || {
                    (0..per_thread)
                        .map(|_| source.next_serial())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("serial thread panicked"))
            .collect()
    }

    #[rstest]
    #[case::random(Arc::new(RandomSerialSource::new()))]
    #[case::sequential(Arc::new(SequentialSerialSource::new()))]
    fn concurrent_serials_are_unique(#[case] source: Arc<dyn SerialNumberSource>) {
        let serials = draw_concurrently(source, 8, 1_250);
        assert_eq!(serials.len(), 10_000);

        let unique: HashSet<_> = serials.iter().copied().collect();
        assert_eq!(unique.len(), serials.len());
        assert!(serials.iter().all(|serial| *serial > 0));
    }

    #[test]
    fn seeded_random_source_is_reproducible() {
        let first = RandomSerialSource::with_seed(42);
        let second = RandomSerialSource::with_seed(42);

        for _ in 0..100 {
            assert_eq!(first.next_serial(), second.next_serial());
        }
    }

    #[test]
    fn random_serials_are_not_sequential() {
        let source = RandomSerialSource::with_seed(7);
        let serials: Vec<_> = (0..1_000).map(|_| source.next_serial()).collect();

        assert!(
            serials
                .windows(2)
                .all(|pair| pair[1].checked_sub(pair[0]) != Some(1))
        );
        assert_ne!(serials[0], RandomSerialSource::with_seed(8).next_serial());
    }

    #[test]
    fn permutation_is_injective_on_a_dense_range() {
        let source = RandomSerialSource::with_seed(42);
        let permuted: HashSet<_> = (0..100_000).map(|index| source.permute(index)).collect();

        assert_eq!(permuted.len(), 100_000);
        assert!(permuted.iter().all(|value| *value <= SERIAL_MASK));
    }

    #[test]
    fn sequential_source_counts_up() {
        let source = SequentialSerialSource::starting_at(10);
        assert_eq!(source.next_serial(), 10);
        assert_eq!(source.next_serial(), 11);

        let source = SequentialSerialSource::starting_at(-3);
        assert_eq!(source.next_serial(), 1);
    }

    #[test]
    fn concurrent_wrap_around_stays_unique() {
        let source = Arc::new(SequentialSerialSource::starting_at(i64::MAX - 99));
        let serials = draw_concurrently(source, 8, 100);

        let unique: HashSet<_> = serials.iter().copied().collect();
        assert_eq!(unique.len(), 800);
        assert!(serials.iter().all(|serial| *serial > 0));
        assert!(unique.contains(&i64::MAX));
        assert!(unique.contains(&1));
        assert!(unique.contains(&700));
    }

    #[test]
    fn sequential_source_skips_non_positive_values() {
        let source = SequentialSerialSource::starting_at(i64::MAX);
        assert_eq!(source.next_serial(), i64::MAX);
        assert_eq!(source.next_serial(), 1);
        assert_eq!(source.next_serial(), 2);
    }
}
