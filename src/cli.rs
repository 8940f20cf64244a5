use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use spoofwatch::config::Config;
use spoofwatch::pipeline::{log_spoofed, spawn_record_reader, write_spoofed, DetectorPipeline};
use spoofwatch::record::Direction;
use spoofwatch::{Detector, FlowRecord};

#[derive(Parser)]
#[command(name = "spoofwatch")]
#[command(author, version, about = "IP spoofing detector for flow record streams")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the detector on a binary flow record stream
    Run {
        /// File with bogon prefixes (mandatory unless set in the config file)
        #[arg(short, long)]
        bogons: Option<PathBuf>,

        /// File with other watched specific prefixes
        #[arg(short = 'p', long)]
        specific: Option<PathBuf>,

        /// Seconds before symmetric-route records are updated (0 = default 45)
        #[arg(short = 's', long, default_value = "0")]
        rw_time: u64,

        /// New-flow threshold before reporting (0 = default 1000)
        #[arg(short = 't', long, default_value = "0")]
        threshold: u64,

        /// Record stream to read ("-" for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Where flagged records are written ("-" for stdout); when absent
        /// they are reported through the log only
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replay a CSV flow log through the detector
    Replay {
        /// CSV file: src,dst,src_port,dst_port,protocol,dir,link,first
        file: PathBuf,

        /// File with bogon prefixes (mandatory unless set in the config file)
        #[arg(short, long)]
        bogons: Option<PathBuf>,

        /// File with other watched specific prefixes
        #[arg(short = 'p', long)]
        specific: Option<PathBuf>,

        /// Seconds before symmetric-route records are updated (0 = default 45)
        #[arg(short = 's', long, default_value = "0")]
        rw_time: u64,

        /// New-flow threshold before reporting (0 = default 1000)
        #[arg(short = 't', long, default_value = "0")]
        threshold: u64,
    },

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Run {
            bogons,
            specific,
            rw_time,
            threshold,
            input,
            output,
        } => {
            apply_overrides(&mut config, bogons, specific, rw_time, threshold);
            let source = open_input(&input)?;
            run_detector(config, source, output).await
        }

        Commands::Replay {
            file,
            bogons,
            specific,
            rw_time,
            threshold,
        } => {
            apply_overrides(&mut config, bogons, specific, rw_time, threshold);
            replay_csv(config, file).await
        }

        Commands::GenConfig { output } => {
            let rendered = Config::default_toml()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("wrote default config to {}", path.display());
                }
                None => print!("{}", rendered),
            }
            Ok(())
        }
    }
}

fn apply_overrides(
    config: &mut Config,
    bogons: Option<PathBuf>,
    specific: Option<PathBuf>,
    rw_time: u64,
    threshold: u64,
) {
    if let Some(path) = bogons {
        config.detector.bogon_file = path;
    }
    if let Some(path) = specific {
        config.detector.specific_file = Some(path);
    }
    if rw_time != 0 {
        config.detector.sym_rw_time = rw_time;
    }
    if threshold != 0 {
        config.detector.nf_threshold = threshold;
    }
}

fn open_input(path: &PathBuf) -> Result<Box<dyn Read + Send>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(std::io::stdin()))
    } else {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::new(file))
    }
}

fn open_output(path: &PathBuf) -> Result<Box<dyn Write + Send>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(std::io::stdout()))
    } else {
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

async fn run_detector(
    config: Config,
    source: Box<dyn Read + Send>,
    output: Option<PathBuf>,
) -> Result<()> {
    config.detector.validate()?;
    let detector = Detector::new(&config.detector)?;

    let (record_tx, record_rx) = crossbeam_channel::bounded(config.pipeline.record_buffer);
    let (spoofed_tx, spoofed_rx) = mpsc::channel(config.pipeline.spoofed_buffer);
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);

    let reader = spawn_record_reader(source, record_tx);

    let sink = match output {
        Some(path) => {
            let writer = open_output(&path)?;
            tokio::spawn(write_spoofed(spoofed_rx, writer))
        }
        None => tokio::spawn(log_spoofed(spoofed_rx)),
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    let pipeline = DetectorPipeline::new(detector, record_rx, spoofed_tx).with_shutdown(shutdown_rx);
    pipeline.run().await;

    let forwarded = sink.await??;
    info!("forwarded {} spoofed records", forwarded);

    // the reader may still be parked on a blocking read after an interrupt
    if reader.is_finished() {
        match reader.join() {
            Ok(Ok(delivered)) => debug!("input stream delivered {} records", delivered),
            Ok(Err(e)) => error!("input error: {}", e),
            Err(_) => error!("record reader panicked"),
        }
    }

    Ok(())
}

async fn replay_csv(config: Config, file: PathBuf) -> Result<()> {
    config.detector.validate()?;
    let detector = Detector::new(&config.detector)?;

    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let (record_tx, record_rx) = crossbeam_channel::bounded(config.pipeline.record_buffer);
    let (spoofed_tx, spoofed_rx) = mpsc::channel(config.pipeline.spoofed_buffer);

    let feeder = std::thread::spawn(move || {
        let mut fed = 0u64;
        for (lineno, line) in content.lines().enumerate() {
            match parse_replay_line(line) {
                Some(record) => {
                    if record_tx.send(record).is_err() {
                        break;
                    }
                    fed += 1;
                }
                None if lineno == 0 => debug!("skipping header line"),
                None => {
                    if !line.trim().is_empty() {
                        warn!("skipping malformed line {}: {:?}", lineno + 1, line);
                    }
                }
            }
        }
        fed
    });

    let sink = tokio::spawn(log_spoofed(spoofed_rx));
    let pipeline = DetectorPipeline::new(detector, record_rx, spoofed_tx);
    pipeline.run().await;

    let flagged = sink.await??;
    let replayed = feeder.join().unwrap_or(0);
    info!("replayed {} records, {} flagged", replayed, flagged);
    Ok(())
}

/// Parse one replay line:
/// `src,dst,src_port,dst_port,protocol,dir,link,first[,...]`.
/// The timestamp is epoch seconds or RFC 3339; the link field accepts a
/// `0x` prefix. Extra trailing columns are ignored.
fn parse_replay_line(line: &str) -> Option<FlowRecord> {
    let mut fields = line.split(',').map(str::trim);

    let src: IpAddr = fields.next()?.parse().ok()?;
    let dst: IpAddr = fields.next()?.parse().ok()?;
    let src_port: u16 = fields.next()?.parse().ok()?;
    let dst_port: u16 = fields.next()?.parse().ok()?;
    let protocol: u8 = fields.next()?.parse().ok()?;
    let direction = Direction::from(fields.next()?.parse::<u8>().ok()?);
    let link = parse_link(fields.next()?)?;
    let first_secs = parse_timestamp(fields.next()?)?;

    let mut record = FlowRecord::new(src, dst, direction, link, first_secs);
    record.src_port = src_port;
    record.dst_port = dst_port;
    record.protocol = protocol;
    Some(record)
}

fn parse_link(field: &str) -> Option<u64> {
    match field.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => field.parse().ok(),
    }
}

fn parse_timestamp(field: &str) -> Option<u64> {
    if let Ok(secs) = field.parse::<u64>() {
        return Some(secs);
    }
    chrono::DateTime::parse_from_rfc3339(field)
        .ok()
        .map(|t| t.timestamp().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_line_with_epoch_timestamp() {
        let rec =
            parse_replay_line("10.0.0.1,192.0.2.5,1234,80,6,1,0x04,1372680000").unwrap();
        assert_eq!(rec.src_addr, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(rec.direction, Direction::Incoming);
        assert_eq!(rec.link_bitfield, 0x04);
        assert_eq!(rec.first_seen_secs(), 1_372_680_000);
        assert_eq!(rec.src_port, 1234);
    }

    #[test]
    fn replay_line_with_rfc3339_timestamp() {
        let rec = parse_replay_line(
            "2001:db8::1,2001:db8::2,0,0,17,0,2,2013-07-01T12:00:00+00:00",
        )
        .unwrap();
        assert_eq!(rec.direction, Direction::Outgoing);
        assert_eq!(rec.first_seen_secs(), 1_372_680_000);
    }

    #[test]
    fn header_and_garbage_lines_are_rejected() {
        assert!(parse_replay_line("SRC_IP,DST_IP,SRC_PORT,DST_PORT,PROTOCOL,DIR,LINK,TIME").is_none());
        assert!(parse_replay_line("").is_none());
        assert!(parse_replay_line("10.0.0.1,bad,1,2,6,1,1,100").is_none());
    }

    #[test]
    fn extra_columns_are_ignored() {
        let rec = parse_replay_line("10.0.0.1,192.0.2.5,0,0,6,1,1,100,999,extra").unwrap();
        assert_eq!(rec.first_seen_secs(), 100);
    }
}
