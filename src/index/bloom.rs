use std::sync::RwLock;

use bloomfilter::Bloom;
use tracing::debug;

/// Negative-lookup gate over entity ids.
///
/// Sized for twice the expected population at a 1 % false-positive target
/// and rebuilt at every checkpoint, so growth never degrades the rate for
/// long. Never returns a false negative for an id in the index.
pub struct BloomGate {
    fp_rate: f64,
    inner: RwLock<Bloom<str>>,
}

/// Floor on sizing so a fresh store does not start saturated.
const MIN_CAPACITY: usize = 1024;

fn sized(expected: usize, fp_rate: f64) -> Result<Bloom<str>, String> {
    Bloom::new_for_fp_rate(expected.max(MIN_CAPACITY), fp_rate).map_err(|e| e.to_string())
}

impl BloomGate {
    pub fn new(expected: usize, fp_rate: f64) -> Result<Self, String> {
        Ok(Self {
            fp_rate,
            inner: RwLock::new(sized(expected, fp_rate)?),
        })
    }

    pub fn insert(&self, id: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set(id);
    }

    /// `false` means definitely absent; `true` means probably present.
    pub fn check(&self, id: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .check(id)
    }

    /// Replaces the filter with one sized for `2 * count` members.
    pub fn rebuild<'a>(
        &self,
        ids: impl Iterator<Item = &'a str>,
        count: usize,
    ) -> Result<(), String> {
        let mut fresh = sized(count.saturating_mul(2), self.fp_rate)?;

        let mut inserted = 0usize;
        for id in ids {
            fresh.set(id);
            inserted += 1;
        }

        debug!(inserted, "rebuilt bloom filter");

        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let gate = BloomGate::new(1000, 0.01).unwrap();

        let ids: Vec<String> = (0..1000).map(|i| format!("entity-{i}")).collect();
        for id in &ids {
            gate.insert(id);
        }

        for id in &ids {
            assert!(gate.check(id));
        }
    }

    #[test]
    fn false_positive_rate_is_respected() {
        let gate = BloomGate::new(10_000, 0.01).unwrap();

        for i in 0..10_000 {
            gate.insert(&format!("member-{i}"));
        }

        let misses = (0..10_000)
            .filter(|i| gate.check(&format!("stranger-{i}")))
            .count();

        // 1% target with generous slack for hash variance
        assert!(misses < 300, "false positive count {misses} too high");
    }

    #[test]
    fn rebuild_keeps_members() {
        let gate = BloomGate::new(10, 0.01).unwrap();
        gate.insert("kept");

        let members = ["kept", "also-kept"];
        gate.rebuild(members.iter().copied(), members.len())
            .unwrap();

        assert!(gate.check("kept"));
        assert!(gate.check("also-kept"));
    }

    #[test]
    fn rejects_nonsense_rates() {
        assert!(BloomGate::new(10, 0.0).is_err());
    }
}
