//! Bogon / watched-prefix filter
//!
//! Flags records whose source sits in reserved (bogon) space. Incoming
//! records are additionally checked against the watched-network prefixes:
//! a watched address arriving as a *source* from outside can only be
//! spoofed, while outbound traffic to those networks is uninteresting here.

use tracing::debug;

use crate::prefix::PrefixSet;
use crate::record::{Direction, FlowRecord};

use super::Verdict;

pub struct BogonFilter {
    bogons: PrefixSet,
    watched: PrefixSet,
}

impl BogonFilter {
    pub fn new(bogons: PrefixSet, watched: PrefixSet) -> Self {
        Self { bogons, watched }
    }

    pub fn check(&self, record: &FlowRecord) -> Verdict {
        if self.bogons.contains(record.src_addr) {
            debug!("source {} fits a bogon prefix", record.src_addr);
            return Verdict::Positive;
        }

        if record.direction == Direction::Incoming && self.watched.contains(record.src_addr) {
            debug!("source {} fits a watched prefix on ingress", record.src_addr);
            return Verdict::Positive;
        }

        Verdict::Negative
    }
}
