//! Symmetric-routing filter
//!
//! Learns, from outgoing traffic, which uplinks legitimately carry flows
//! toward each destination aggregate, then validates incoming traffic
//! against that map: a record arriving on a link that has never been a
//! confirmed egress path toward its claimed source is flagged.
//!
//! Keys aggregate by destination /24 for IPv4 and by the high 64 bits for
//! IPv6. The rewrite window gates writes only; a stale entry keeps
//! answering ingress checks until an egress record replaces it.

use std::collections::HashMap;

use tracing::debug;

use crate::addr::AddressFamily;
use crate::record::{Direction, FlowRecord};

use super::Verdict;

/// Default rewrite window in seconds, applied when the operator passes 0.
pub const DEFAULT_RW_TIME: u64 = 45;

#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    /// Union of link bits seen on egress toward this aggregate.
    pub links: u64,
    pub timestamp: u64,
}

pub struct SymmetricRouteFilter<F: AddressFamily> {
    routes: HashMap<F::SymKey, RouteEntry>,
    rw_time: u64,
}

impl<F: AddressFamily> SymmetricRouteFilter<F> {
    pub fn new(rw_time: u64) -> Self {
        Self {
            routes: HashMap::new(),
            rw_time: if rw_time == 0 { DEFAULT_RW_TIME } else { rw_time },
        }
    }

    pub fn check(&mut self, record: &FlowRecord) -> Verdict {
        match record.direction {
            Direction::Outgoing => {
                let Some(bits) = F::bits(record.dst_addr) else {
                    return Verdict::Negative;
                };
                let key = F::sym_key(bits);
                let now = record.first_seen_secs();

                match self.routes.get_mut(&key) {
                    Some(entry) if now.wrapping_sub(entry.timestamp >> 32) < self.rw_time => {
                        entry.links |= record.link_bitfield;
                        entry.timestamp = record.first_seen;
                    }
                    _ => {
                        self.routes.insert(
                            key,
                            RouteEntry {
                                links: record.link_bitfield,
                                timestamp: record.first_seen,
                            },
                        );
                    }
                }
                // egress never flags; it only teaches the map
                Verdict::Negative
            }
            Direction::Incoming => {
                let Some(bits) = F::bits(record.src_addr) else {
                    return Verdict::Negative;
                };
                match self.routes.get(&F::sym_key(bits)) {
                    Some(entry) => {
                        if entry.links & record.link_bitfield == 0 {
                            debug!(
                                "{} arrived on links {:#x}, confirmed egress links are {:#x}",
                                record.src_addr, record.link_bitfield, entry.links
                            );
                            Verdict::Positive
                        } else {
                            Verdict::Negative
                        }
                    }
                    // never seen egress toward this aggregate: not enough
                    // evidence to call it spoofed
                    None => Verdict::Negative,
                }
            }
        }
    }

    /// Stored entry for an aggregate, if any.
    pub fn route(&self, key: &F::SymKey) -> Option<&RouteEntry> {
        self.routes.get(key)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{V4, V6};
    use std::net::IpAddr;

    fn rec(src: &str, dst: &str, dir: Direction, link: u64, secs: u64) -> FlowRecord {
        FlowRecord::new(
            src.parse::<IpAddr>().unwrap(),
            dst.parse::<IpAddr>().unwrap(),
            dir,
            link,
            secs,
        )
    }

    #[test]
    fn learn_then_confirm() {
        let mut f = SymmetricRouteFilter::<V4>::new(45);
        let out = rec("198.51.100.5", "203.0.113.7", Direction::Outgoing, 0x04, 1000);
        assert!(!f.check(&out).is_positive());

        let back = rec("203.0.113.7", "198.51.100.5", Direction::Incoming, 0x04, 1010);
        assert!(!f.check(&back).is_positive());
    }

    #[test]
    fn mismatched_link_is_positive() {
        let mut f = SymmetricRouteFilter::<V4>::new(45);
        f.check(&rec("198.51.100.5", "203.0.113.7", Direction::Outgoing, 0x04, 1000));

        let wrong = rec("203.0.113.7", "198.51.100.5", Direction::Incoming, 0x01, 1010);
        assert!(f.check(&wrong).is_positive());
    }

    #[test]
    fn unknown_source_is_negative() {
        let mut f = SymmetricRouteFilter::<V4>::new(45);
        let probe = rec("203.0.113.7", "198.51.100.5", Direction::Incoming, 0x01, 1000);
        assert!(!f.check(&probe).is_positive());
        assert!(f.is_empty());
    }

    #[test]
    fn window_gates_writes_not_reads() {
        let mut f = SymmetricRouteFilter::<V4>::new(45);
        f.check(&rec("198.51.100.5", "203.0.113.7", Direction::Outgoing, 0x04, 1000));

        // well past the window: the entry is still consulted on ingress
        let late = rec("203.0.113.7", "198.51.100.5", Direction::Incoming, 0x01, 1100);
        assert!(f.check(&late).is_positive());

        let key = V4::sym_key(V4::bits("203.0.113.7".parse().unwrap()).unwrap());
        assert_eq!(f.route(&key).unwrap().links, 0x04);
    }

    #[test]
    fn links_merge_within_window() {
        let mut f = SymmetricRouteFilter::<V4>::new(45);
        f.check(&rec("198.51.100.5", "203.0.113.7", Direction::Outgoing, 0x04, 1000));
        f.check(&rec("198.51.100.5", "203.0.113.7", Direction::Outgoing, 0x02, 1010));

        let key = V4::sym_key(V4::bits("203.0.113.7".parse().unwrap()).unwrap());
        let entry = f.route(&key).unwrap();
        assert_eq!(entry.links, 0x06);
        assert_eq!(entry.timestamp >> 32, 1010);
    }

    #[test]
    fn stale_entry_is_overwritten_on_egress() {
        let mut f = SymmetricRouteFilter::<V4>::new(45);
        f.check(&rec("198.51.100.5", "203.0.113.7", Direction::Outgoing, 0x04, 1000));
        // outside the window: fresh entry, old links forgotten
        f.check(&rec("198.51.100.5", "203.0.113.7", Direction::Outgoing, 0x02, 1100));

        let key = V4::sym_key(V4::bits("203.0.113.7".parse().unwrap()).unwrap());
        assert_eq!(f.route(&key).unwrap().links, 0x02);
    }

    #[test]
    fn destination_aggregated_to_slash_24() {
        let mut f = SymmetricRouteFilter::<V4>::new(45);
        f.check(&rec("198.51.100.5", "203.0.113.7", Direction::Outgoing, 0x04, 1000));

        // a different host in the same /24 shares the route entry
        let sibling = rec("203.0.113.200", "198.51.100.5", Direction::Incoming, 0x04, 1010);
        assert!(!f.check(&sibling).is_positive());
        assert_eq!(f.len(), 1);
    }

    #[test]
    fn v6_keys_on_high_half_and_refreshes_timestamp() {
        let mut f = SymmetricRouteFilter::<V6>::new(45);
        f.check(&rec(
            "2001:db8:1::1",
            "2001:db8:2::1",
            Direction::Outgoing,
            0x08,
            1000,
        ));
        f.check(&rec(
            "2001:db8:1::1",
            "2001:db8:2::ffff",
            Direction::Outgoing,
            0x01,
            1010,
        ));

        let key = V6::sym_key(V6::bits("2001:db8:2::1".parse().unwrap()).unwrap());
        let entry = f.route(&key).unwrap();
        assert_eq!(entry.links, 0x09);
        assert_eq!(entry.timestamp >> 32, 1010);

        let ok = rec("2001:db8:2::7", "2001:db8:1::1", Direction::Incoming, 0x08, 1020);
        assert!(!f.check(&ok).is_positive());
        let bad = rec("2001:db8:2::7", "2001:db8:1::1", Direction::Incoming, 0x02, 1020);
        assert!(f.check(&bad).is_positive());
    }

    #[test]
    fn zero_rw_time_uses_default() {
        let f = SymmetricRouteFilter::<V4>::new(0);
        assert_eq!(f.rw_time, DEFAULT_RW_TIME);
    }

    #[test]
    fn mixed_family_record_is_ignored() {
        let mut f = SymmetricRouteFilter::<V4>::new(45);
        // v6 destination in a v4 filter: nothing learned
        f.check(&rec("198.51.100.5", "2001:db8::1", Direction::Outgoing, 0x04, 1000));
        assert!(f.is_empty());
    }
}
