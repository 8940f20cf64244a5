//! Record pipeline
//!
//! I/O shims around the detector: a reader thread turns a byte stream of
//! fixed-size frames into records on a crossbeam channel, the detector
//! loop drains that channel, and flagged records leave on a tokio channel
//! toward the sink. Closing either channel shuts the pipeline down
//! cleanly; a truncated frame is an input error and stops the reader.

use std::io::{Read, Write};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::detector::{Detector, DetectorStats};
use crate::error::{Result, SpoofError};
use crate::record::{FlowRecord, WIRE_SIZE};

/// Single-owner detector loop between the input and output channels.
pub struct DetectorPipeline {
    detector: Detector,
    record_rx: Receiver<FlowRecord>,
    spoofed_tx: mpsc::Sender<FlowRecord>,
    shutdown_rx: Option<Receiver<()>>,
}

impl DetectorPipeline {
    pub fn new(
        detector: Detector,
        record_rx: Receiver<FlowRecord>,
        spoofed_tx: mpsc::Sender<FlowRecord>,
    ) -> Self {
        Self {
            detector,
            record_rx,
            spoofed_tx,
            shutdown_rx: None,
        }
    }

    /// Attach a termination signal; the in-flight record completes before
    /// the loop exits.
    pub fn with_shutdown(mut self, shutdown_rx: Receiver<()>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    /// Process records until the input channel closes, the output side
    /// hangs up, or the termination signal fires, then log and return the
    /// summary counters.
    pub async fn run(mut self) -> DetectorStats {
        loop {
            if let Some(rx) = &self.shutdown_rx {
                if rx.try_recv().is_ok() {
                    debug!("termination signal received, stopping detector");
                    break;
                }
            }
            match self.record_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(record) => {
                    if let Some(stage) = self.detector.check(&record) {
                        debug!(
                            "{} -> {} flagged by {} filter",
                            record.src_addr, record.dst_addr, stage
                        );
                        if self.spoofed_tx.send(record).await.is_err() {
                            debug!("output channel closed, stopping detector");
                            break;
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("record channel closed, stopping detector");
                    break;
                }
            }
        }

        let stats = self.detector.stats().clone();
        stats.log_summary();
        stats
    }
}

/// Read fixed-size record frames from `input` and feed them to the
/// detector until EOF, a malformed (short) frame, or a closed channel.
/// Returns the number of records delivered.
pub fn spawn_record_reader<R>(mut input: R, tx: Sender<FlowRecord>) -> JoinHandle<Result<u64>>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut buf = [0u8; WIRE_SIZE];
        let mut delivered = 0u64;
        while read_frame(&mut input, &mut buf)? {
            let record = FlowRecord::from_bytes(&buf)?;
            if tx.send(record).is_err() {
                // detector went away first
                break;
            }
            delivered += 1;
        }
        Ok(delivered)
    })
}

/// Fill one frame. `Ok(false)` is clean EOF on a frame boundary; EOF
/// mid-frame is a malformed record.
fn read_frame(input: &mut impl Read, buf: &mut [u8; WIRE_SIZE]) -> Result<bool> {
    let mut filled = 0;
    while filled < WIRE_SIZE {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(SpoofError::RecordSize {
                expected: WIRE_SIZE,
                got: filled,
            });
        }
        filled += n;
    }
    Ok(true)
}

/// Drain flagged records into `out`, re-framed exactly as they arrived.
/// Returns how many were written.
pub async fn write_spoofed<W: Write>(mut rx: mpsc::Receiver<FlowRecord>, mut out: W) -> Result<u64> {
    let mut written = 0u64;
    while let Some(record) = rx.recv().await {
        out.write_all(&record.to_bytes())?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

/// Sink used when no output file is configured: report each flagged
/// record through the log instead.
pub async fn log_spoofed(mut rx: mpsc::Receiver<FlowRecord>) -> Result<u64> {
    let mut seen = 0u64;
    while let Some(record) = rx.recv().await {
        info!(
            "spoofed: {} -> {} ({}, links {:#x})",
            record.src_addr, record.dst_addr, record.direction, record.link_bitfield
        );
        seen += 1;
    }
    Ok(seen)
}
