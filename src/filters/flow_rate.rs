//! New-flow-rate filter
//!
//! Counts distinct source aggregates hitting each watched prefix inside a
//! rotating time window. Every watched prefix owns a pair of
//! approximate-membership slots: the *active* slot answers queries and
//! carries the count that trips the threshold, the *learning* slot shadows
//! every insert. When the window rolls over, the roles swap and the new
//! learning slot starts empty, so the active slot always holds at least one
//! full window of history.

use std::io::Write;
use std::net::IpAddr;

use tracing::debug;

use crate::addr::AddressFamily;
use crate::bloom::BloomFilter;
use crate::prefix::PrefixTable;
use crate::record::FlowRecord;

use super::Verdict;

/// Fixed width of a rendered aggregation key, sized for the longest
/// printable IPv6 address.
pub const KEY_LEN: usize = 46;

/// Default per-window flow threshold, applied when the operator passes 0.
pub const DEFAULT_THRESHOLD: u64 = 1000;

/// Sizing and windowing parameters for one filter instance.
#[derive(Debug, Clone)]
pub struct RateParams {
    /// Distinct new flows per watched prefix tolerated inside one window.
    pub threshold: u64,
    /// Seconds before the active/learning roles rotate.
    pub swap_time: u64,
    /// Projected distinct-key cardinality per slot.
    pub capacity: usize,
    /// Target false-positive rate per slot.
    pub fp_rate: f64,
}

impl Default for RateParams {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            swap_time: 90,
            capacity: 1_000_000,
            fp_rate: 0.01,
        }
    }
}

struct RateSlot {
    set: BloomFilter,
    count: u64,
}

struct SlotBank {
    slots: Vec<RateSlot>,
    timestamp: u64,
}

pub struct FlowRateFilter<F: AddressFamily> {
    watched: PrefixTable<F>,
    banks: [SlotBank; 2],
    active: usize,
    learning: usize,
    threshold: u64,
    swap_time: u64,
}

impl<F: AddressFamily> FlowRateFilter<F> {
    pub fn new(watched: PrefixTable<F>, params: &RateParams) -> Self {
        let make_bank = || SlotBank {
            slots: (0..watched.len())
                .map(|_| RateSlot {
                    set: BloomFilter::with_rate(params.capacity, params.fp_rate),
                    count: 0,
                })
                .collect(),
            timestamp: 0,
        };
        let banks = [make_bank(), make_bank()];

        Self {
            watched,
            banks,
            active: 0,
            learning: 1,
            threshold: if params.threshold == 0 {
                DEFAULT_THRESHOLD
            } else {
                params.threshold
            },
            swap_time: params.swap_time,
        }
    }

    pub fn check(&mut self, record: &FlowRecord) -> Verdict {
        let probe = if F::RATE_PROBE_ON_DST {
            record.dst_addr
        } else {
            record.src_addr
        };
        let Some(idx) = self.watched.contains(probe) else {
            return Verdict::Negative;
        };

        // rotate first so counts and set contents agree within the window
        self.maybe_rotate(record.first_seen);

        let Some(key) = aggregation_key::<F>(record.src_addr) else {
            return Verdict::Negative;
        };

        let active = &mut self.banks[self.active].slots[idx];
        if active.set.contains(&key) {
            // already counted in this window
            return Verdict::Negative;
        }
        active.set.insert(&key);
        active.count += 1;

        let learning = &mut self.banks[self.learning].slots[idx];
        learning.set.insert(&key);
        learning.count += 1;

        let count = self.banks[self.active].slots[idx].count;
        if count > self.threshold {
            debug!(
                "watched prefix #{} receiving too many new flows ({})",
                idx, count
            );
            Verdict::Positive
        } else {
            Verdict::Negative
        }
    }

    fn maybe_rotate(&mut self, timestamp: u64) {
        if self.banks[self.active].timestamp == 0 {
            // first record seen: open the window without rotating
            self.banks[0].timestamp = timestamp;
            self.banks[1].timestamp = timestamp;
            return;
        }

        let now = timestamp >> 32;
        let opened = self.banks[self.active].timestamp >> 32;
        if now.saturating_sub(opened) > self.swap_time {
            std::mem::swap(&mut self.active, &mut self.learning);
            for slot in &mut self.banks[self.learning].slots {
                slot.set.clear();
                slot.count = 0;
            }
            self.banks[0].timestamp = timestamp;
            self.banks[1].timestamp = timestamp;
        }
    }

    /// Active-slot count for a watched prefix index.
    pub fn active_count(&self, idx: usize) -> u64 {
        self.banks[self.active].slots[idx].count
    }

    pub fn watched_len(&self) -> usize {
        self.watched.len()
    }
}

/// Render the source aggregate (`/24` v4, `/64` v6) into a fixed,
/// zero-padded key buffer.
fn aggregation_key<F: AddressFamily>(src: IpAddr) -> Option<[u8; KEY_LEN]> {
    let bits = F::bits(src)?;
    let aggregate = F::to_addr(F::network(bits, F::AGG_PREFIX));
    let mut key = [0u8; KEY_LEN];
    let mut cursor = &mut key[..];
    // the longest address renders in 45 bytes, so this cannot fail
    let _ = write!(cursor, "{}", aggregate);
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{V4, V6};
    use crate::prefix::PrefixSet;
    use crate::record::Direction;

    fn v4_filter(threshold: u64, swap_time: u64) -> FlowRateFilter<V4> {
        let set = PrefixSet::from_lines("192.0.2.0/24\n");
        FlowRateFilter::new(
            set.v4,
            &RateParams {
                threshold,
                swap_time,
                capacity: 10_000,
                fp_rate: 0.01,
            },
        )
    }

    fn incoming(src: &str, dst: &str, secs: u64) -> FlowRecord {
        FlowRecord::new(
            src.parse().unwrap(),
            dst.parse().unwrap(),
            Direction::Incoming,
            0x1,
            secs,
        )
    }

    #[test]
    fn threshold_crossed_on_next_distinct_key() {
        let mut f = v4_filter(3, 60);
        let sources = ["10.0.0.1", "10.0.1.1", "10.0.2.1", "10.0.3.1", "10.0.4.1"];
        let verdicts: Vec<bool> = sources
            .iter()
            .enumerate()
            .map(|(i, &src)| {
                f.check(&incoming(src, "192.0.2.10", 1000 + i as u64))
                    .is_positive()
            })
            .collect();
        assert_eq!(verdicts, vec![false, false, false, true, true]);
    }

    #[test]
    fn repeated_aggregate_does_not_count_twice() {
        let mut f = v4_filter(3, 60);
        f.check(&incoming("10.0.0.1", "192.0.2.10", 1000));
        // same host, then a sibling inside the same /24 aggregate
        f.check(&incoming("10.0.0.1", "192.0.2.10", 1001));
        f.check(&incoming("10.0.0.77", "192.0.2.10", 1002));
        assert_eq!(f.active_count(0), 1);
    }

    #[test]
    fn unwatched_destination_is_ignored() {
        let mut f = v4_filter(3, 60);
        assert!(!f.check(&incoming("10.0.0.1", "8.8.8.8", 1000)).is_positive());
        assert_eq!(f.active_count(0), 0);
    }

    #[test]
    fn rotation_keeps_the_learning_history() {
        let mut f = v4_filter(3, 60);
        for (i, &src) in ["10.0.0.1", "10.0.1.1", "10.0.2.1", "10.0.3.1"]
            .iter()
            .enumerate()
        {
            f.check(&incoming(src, "192.0.2.10", 1000 + i as u64));
        }
        assert_eq!(f.active_count(0), 4);

        // past the rotation interval: roles swap, the former learning slot
        // (count 4) becomes active, the fresh learning slot starts empty
        let replay = f.check(&incoming("10.0.3.1", "192.0.2.10", 1100));
        assert!(!replay.is_positive());
        assert_eq!(f.active_count(0), 4);

        // a genuinely new aggregate still counts and trips the threshold
        let fresh = f.check(&incoming("10.0.9.1", "192.0.2.10", 1101));
        assert!(fresh.is_positive());
        assert_eq!(f.active_count(0), 5);
    }

    #[test]
    fn rotation_discards_keys_older_than_two_windows() {
        let mut f = v4_filter(100, 60);
        f.check(&incoming("10.0.0.1", "192.0.2.10", 1000));
        // first rotation: key survives in the former learning slot
        f.check(&incoming("10.0.1.1", "192.0.2.10", 1070));
        // second rotation: the slot that held the original key is cleared
        f.check(&incoming("10.0.2.1", "192.0.2.10", 1140));
        assert_eq!(f.active_count(0), 2);
        f.check(&incoming("10.0.0.1", "192.0.2.10", 1141));
        assert_eq!(f.active_count(0), 3);
    }

    #[test]
    fn zero_threshold_uses_default() {
        let f = v4_filter(0, 60);
        assert_eq!(f.threshold, DEFAULT_THRESHOLD);
    }

    #[test]
    fn v6_probes_the_source_address() {
        let set = PrefixSet::from_lines("2001:db8:ffff::/48\n");
        let mut f = FlowRateFilter::<V6>::new(
            set.v6,
            &RateParams {
                threshold: 1,
                swap_time: 60,
                capacity: 10_000,
                fp_rate: 0.01,
            },
        );

        // destination inside the watched prefix, source outside: no match
        let by_dst = incoming("2001:db8:1::1", "2001:db8:ffff::1", 1000);
        assert!(!f.check(&by_dst).is_positive());
        assert_eq!(f.active_count(0), 0);

        // source inside the watched prefix: counted per /64 aggregate
        for i in 0..2u64 {
            let src = format!("2001:db8:ffff:{}::1", i + 1);
            f.check(&incoming(&src, "2001:db8:1::1", 1000 + i));
        }
        assert_eq!(f.active_count(0), 2);
        let third = incoming("2001:db8:ffff:3::1", "2001:db8:1::1", 1003);
        assert!(f.check(&third).is_positive());
    }
}
