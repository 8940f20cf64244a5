//! Detector orchestrator
//!
//! Owns all per-record state and runs the filter sequence for every
//! record: bogon check, symmetric-route check, new-flow-rate check. The
//! first positive verdict wins; records that pass every filter are
//! dropped. Which stage fired is reported so the caller can keep
//! per-filter diagnostics.

use tracing::info;

use crate::addr::{V4, V6};
use crate::config::DetectorConfig;
use crate::error::Result;
use crate::filters::flow_rate::RateParams;
use crate::filters::{BogonFilter, FlowRateFilter, SymmetricRouteFilter};
use crate::prefix::PrefixSet;
use crate::record::FlowRecord;

/// Which filter flagged a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    Bogon,
    SymmetricRoute,
    FlowRate,
}

impl std::fmt::Display for FilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterStage::Bogon => write!(f, "bogon"),
            FilterStage::SymmetricRoute => write!(f, "symmetric-route"),
            FilterStage::FlowRate => write!(f, "flow-rate"),
        }
    }
}

/// Running diagnostics, logged at shutdown.
#[derive(Debug, Default, Clone)]
pub struct DetectorStats {
    pub v4_records: u64,
    pub v6_records: u64,
    pub bogon_hits: u64,
    pub symmetric_hits: u64,
    pub flow_rate_hits: u64,
}

impl DetectorStats {
    pub fn spoofed_total(&self) -> u64 {
        self.bogon_hits + self.symmetric_hits + self.flow_rate_hits
    }

    pub fn log_summary(&self) {
        info!("IPv4 records: {}", self.v4_records);
        info!("IPv6 records: {}", self.v6_records);
        info!("possibly spoofed: {}", self.spoofed_total());
        info!("  caught by bogon filter: {}", self.bogon_hits);
        info!("  caught by symmetric-routing filter: {}", self.symmetric_hits);
        info!("  caught by new-flow-rate filter: {}", self.flow_rate_hits);
    }
}

pub struct Detector {
    bogon: BogonFilter,
    sym_v4: SymmetricRouteFilter<V4>,
    sym_v6: SymmetricRouteFilter<V6>,
    rate_v4: FlowRateFilter<V4>,
    rate_v6: FlowRateFilter<V6>,
    stats: DetectorStats,
}

impl Detector {
    /// Build a detector from configuration, loading the prefix files.
    /// A missing bogon file is fatal; an absent watched-prefix file just
    /// leaves the specific checks and the flow-rate filter with nothing
    /// to match.
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        let bogons = PrefixSet::load(&config.bogon_file)?;
        let watched = match &config.specific_file {
            Some(path) => PrefixSet::load(path)?,
            None => PrefixSet::empty(),
        };
        Ok(Self::with_tables(bogons, watched, config))
    }

    /// Build from already-loaded tables; lets tests construct isolated
    /// instances without touching the filesystem.
    pub fn with_tables(bogons: PrefixSet, watched: PrefixSet, config: &DetectorConfig) -> Self {
        let params = RateParams {
            threshold: config.nf_threshold,
            swap_time: config.bf_swap_time,
            capacity: config.bf_capacity,
            fp_rate: config.bf_fp_rate,
        };

        Self {
            rate_v4: FlowRateFilter::new(watched.v4.clone(), &params),
            rate_v6: FlowRateFilter::new(watched.v6.clone(), &params),
            bogon: BogonFilter::new(bogons, watched),
            sym_v4: SymmetricRouteFilter::new(config.sym_rw_time),
            sym_v6: SymmetricRouteFilter::new(config.sym_rw_time),
            stats: DetectorStats::default(),
        }
    }

    /// Run one record through the filter sequence. `Some(stage)` means the
    /// record should be forwarded as spoofed; `None` means drop it.
    pub fn check(&mut self, record: &FlowRecord) -> Option<FilterStage> {
        let is_v4 = record.src_addr.is_ipv4();
        if is_v4 {
            self.stats.v4_records += 1;
        } else {
            self.stats.v6_records += 1;
        }

        if self.bogon.check(record).is_positive() {
            self.stats.bogon_hits += 1;
            return Some(FilterStage::Bogon);
        }

        let sym = if is_v4 {
            self.sym_v4.check(record)
        } else {
            self.sym_v6.check(record)
        };
        if sym.is_positive() {
            self.stats.symmetric_hits += 1;
            return Some(FilterStage::SymmetricRoute);
        }

        let rate = if is_v4 {
            self.rate_v4.check(record)
        } else {
            self.rate_v6.check(record)
        };
        if rate.is_positive() {
            self.stats.flow_rate_hits += 1;
            return Some(FilterStage::FlowRate);
        }

        None
    }

    pub fn stats(&self) -> &DetectorStats {
        &self.stats
    }

    #[cfg(test)]
    pub(crate) fn sym_v4(&self) -> &SymmetricRouteFilter<V4> {
        &self.sym_v4
    }

    #[cfg(test)]
    pub(crate) fn rate_v4(&self) -> &FlowRateFilter<V4> {
        &self.rate_v4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::record::Direction;

    fn detector(bogons: &str, watched: &str, threshold: u64) -> Detector {
        let config = DetectorConfig {
            nf_threshold: threshold,
            sym_rw_time: 45,
            bf_capacity: 10_000,
            ..DetectorConfig::default()
        };
        Detector::with_tables(
            PrefixSet::from_lines(bogons),
            PrefixSet::from_lines(watched),
            &config,
        )
    }

    fn rec(src: &str, dst: &str, dir: Direction, link: u64, secs: u64) -> FlowRecord {
        FlowRecord::new(src.parse().unwrap(), dst.parse().unwrap(), dir, link, secs)
    }

    #[test]
    fn bogon_hit_short_circuits_downstream_state() {
        let mut d = detector("10.0.0.0/8\n", "192.0.2.0/24\n", 1000);

        let hit = rec("10.1.2.3", "8.8.8.8", Direction::Incoming, 0x2, 1000);
        assert_eq!(d.check(&hit), Some(FilterStage::Bogon));

        // neither the route map nor the flow-rate slots saw the record
        assert!(d.sym_v4().is_empty());
        assert_eq!(d.rate_v4().active_count(0), 0);
        assert_eq!(d.stats().bogon_hits, 1);
        assert_eq!(d.stats().v4_records, 1);
    }

    #[test]
    fn symmetric_violation_is_reported() {
        let mut d = detector("", "", 1000);
        assert_eq!(
            d.check(&rec("198.51.100.5", "203.0.113.7", Direction::Outgoing, 0x04, 1000)),
            None
        );
        assert_eq!(
            d.check(&rec("203.0.113.7", "198.51.100.5", Direction::Incoming, 0x01, 1010)),
            Some(FilterStage::SymmetricRoute)
        );
        assert_eq!(d.stats().symmetric_hits, 1);
    }

    #[test]
    fn flow_rate_fires_after_threshold() {
        let mut d = detector("", "192.0.2.0/24\n", 2);
        let mut stages = Vec::new();
        for (i, &src) in ["10.0.0.1", "10.0.1.1", "10.0.2.1"].iter().enumerate() {
            stages.push(d.check(&rec(
                src,
                "192.0.2.10",
                Direction::Incoming,
                0x1,
                1000 + i as u64,
            )));
        }
        assert_eq!(stages, vec![None, None, Some(FilterStage::FlowRate)]);
        assert_eq!(d.stats().flow_rate_hits, 1);
    }

    #[test]
    fn clean_traffic_is_dropped() {
        let mut d = detector("10.0.0.0/8\n", "192.0.2.0/24\n", 1000);
        let clean = rec("198.51.100.9", "203.0.113.9", Direction::Incoming, 0x1, 1000);
        assert_eq!(d.check(&clean), None);
        assert_eq!(d.stats().spoofed_total(), 0);
    }

    #[test]
    fn families_are_dispatched_and_counted() {
        let mut d = detector("10.0.0.0/8\n2001:db8::/32\n", "", 1000);
        d.check(&rec("10.0.0.1", "8.8.8.8", Direction::Incoming, 0x1, 1000));
        d.check(&rec("2001:db8::1", "2620::1", Direction::Incoming, 0x1, 1000));
        d.check(&rec("203.0.113.1", "8.8.8.8", Direction::Incoming, 0x1, 1000));
        assert_eq!(d.stats().v4_records, 2);
        assert_eq!(d.stats().v6_records, 1);
        assert_eq!(d.stats().bogon_hits, 2);
    }
}
