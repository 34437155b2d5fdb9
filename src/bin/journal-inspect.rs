//! journal-inspect - offline inspection of a partition's journal
//!
//! Reads segment files directly and never modifies them, so it is safe to
//! run next to a live replica.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use raft_journal::storage::log::{
    DESCRIPTOR_SIZE, FrameIter, RECORD_HEADER_SIZE, RecordError, SegmentDescriptor,
    list_segment_files,
};

#[derive(Parser, Debug)]
#[command(name = "journal-inspect")]
#[command(about = "Inspect the segment files of a Raft journal")]
struct Args {
    /// Directory holding the segment files
    #[arg(short, long, default_value = "./data")]
    dir: PathBuf,

    /// Journal prefix
    #[arg(short, long, default_value = "raft")]
    prefix: String,

    /// Log filter, e.g. "info" or "raft_journal=debug"
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List segments with their descriptors
    Segments,
    /// Check every record checksum and position continuity
    Verify,
    /// Print records starting at a position
    Dump {
        #[arg(long, default_value = "1")]
        from: u64,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

struct SegmentScan {
    descriptor: SegmentDescriptor,
    records: Vec<(u64, u64, usize)>,
    end_offset: usize,
    error: Option<RecordError>,
}

fn scan_segment(path: &Path) -> Result<SegmentScan, Box<dyn std::error::Error>> {
    let data = std::fs::read(path)?;
    let descriptor = SegmentDescriptor::decode(&data)
        .map_err(|e| format!("{}: {}", path.display(), e))?;

    let body = &data[DESCRIPTOR_SIZE.min(data.len())..];
    let mut iter = FrameIter::new(body);
    let mut records = Vec::new();
    let mut error = None;
    let mut end_offset = DESCRIPTOR_SIZE;
    while let Some(frame) = iter.next() {
        match frame {
            Ok((header, _)) => {
                records.push((header.position, header.term, header.length as usize));
                end_offset = DESCRIPTOR_SIZE + iter.offset();
            }
            Err(RecordError::Empty) => break,
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }

    Ok(SegmentScan {
        descriptor,
        records,
        end_offset,
        error,
    })
}

fn segments(dir: &Path, prefix: &str) -> Result<(), Box<dyn std::error::Error>> {
    for (id, path) in list_segment_files(dir, prefix)? {
        let scan = scan_segment(&path)?;
        let d = scan.descriptor;
        let last = scan.records.last().map(|(p, _, _)| *p);
        println!(
            "segment {:>6}  first={:<10} last={:<10} records={:<8} used={}/{} sealed={}",
            id,
            d.first_position,
            last.map_or("-".to_string(), |p| p.to_string()),
            scan.records.len(),
            scan.end_offset,
            d.max_size,
            d.sealed
        );
    }
    Ok(())
}

fn verify(dir: &Path, prefix: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let mut ok = true;
    let mut expected: Option<u64> = None;
    let files = list_segment_files(dir, prefix)?;
    let count = files.len();

    for (i, (id, path)) in files.into_iter().enumerate() {
        let scan = scan_segment(&path)?;
        if scan.descriptor.id != id {
            warn!("Segment {} carries descriptor id {}", id, scan.descriptor.id);
            ok = false;
        }
        if let Some(expected) = expected {
            if scan.descriptor.first_position != expected {
                warn!(
                    "Segment {} starts at {}, expected {}",
                    id, scan.descriptor.first_position, expected
                );
                ok = false;
            }
        }

        let mut next = scan.descriptor.first_position;
        for (position, _, _) in &scan.records {
            if *position != next {
                warn!("Segment {} holds position {}, expected {}", id, position, next);
                ok = false;
            }
            next = position + 1;
        }

        if let Some(e) = scan.error {
            let last_segment = i + 1 == count;
            warn!(
                "Segment {} has a damaged record at offset {} ({}){}",
                id,
                scan.end_offset,
                e,
                if last_segment { ", recoverable torn tail" } else { "" }
            );
            ok &= last_segment;
        }
        if scan.descriptor.sealed && scan.descriptor.last_position + 1 != next {
            warn!(
                "Sealed segment {} records last position {} but ends at {}",
                id,
                scan.descriptor.last_position,
                next.saturating_sub(1)
            );
            ok = false;
        }
        expected = Some(next);
    }

    info!("Verified {} segments: {}", count, if ok { "ok" } else { "damaged" });
    Ok(ok)
}

fn dump(dir: &Path, prefix: &str, from: u64, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let mut printed = 0;
    for (_, path) in list_segment_files(dir, prefix)? {
        let data = std::fs::read(&path)?;
        if data.len() <= DESCRIPTOR_SIZE {
            continue;
        }
        for frame in FrameIter::new(&data[DESCRIPTOR_SIZE..]) {
            let Ok((header, frame)) = frame else { break };
            if header.position < from {
                continue;
            }
            let payload = &frame[RECORD_HEADER_SIZE..];
            let preview: String = String::from_utf8_lossy(&payload[..payload.len().min(48)])
                .chars()
                .map(|c| if c.is_control() { '.' } else { c })
                .collect();
            println!(
                "{:>10}  term={:<6} len={:<8} {}",
                header.position, header.term, header.length, preview
            );
            printed += 1;
            if printed >= limit {
                return Ok(());
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Segments => segments(&args.dir, &args.prefix)?,
        Command::Verify => {
            if !verify(&args.dir, &args.prefix)? {
                std::process::exit(1);
            }
        }
        Command::Dump { from, limit } => dump(&args.dir, &args.prefix, from, limit)?,
    }
    Ok(())
}
