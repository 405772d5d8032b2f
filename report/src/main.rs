use clap::Parser;
use scamp_runner::checkpoint::CheckpointStore;
use scamp_runner::status::{JobRecord, JobState, RecordMap};
use std::{path::PathBuf, process::exit};

#[derive(Parser, Debug)]
#[command(
    name = "scamp-report",
    about = "Speedup/efficiency table from a campaign checkpoint"
)]
struct Args {
    /// checkpoint written by the campaign runner
    checkpoint: PathBuf,
}

struct Row {
    name: String,
    procs: u64,
    wall: f64,
    speedup: f64,
    efficiency: f64,
}

/// Speedup and efficiency relative to the completed job with the fewest
/// processor slots. Jobs without a measured wall time are left out.
fn rows(records: &RecordMap) -> Vec<Row> {
    let mut completed: Vec<(&JobRecord, f64)> = records
        .values()
        .filter(|record| record.state == JobState::Done)
        .filter_map(|record| {
            record
                .wall_time
                .filter(|wall| *wall > 0.0)
                .map(|wall| (record, wall))
        })
        .collect();
    completed.sort_by(|(a, _), (b, _)| {
        a.spec
            .procs()
            .cmp(&b.spec.procs())
            .then_with(|| a.spec.name.cmp(&b.spec.name))
    });

    let Some((baseline, base_wall)) = completed.first().copied() else {
        return Vec::new();
    };
    let base_procs = baseline.spec.procs() as f64;

    completed
        .iter()
        .map(|(record, wall)| {
            let procs = record.spec.procs();
            let speedup = base_wall / wall;

            Row {
                name: record.spec.name.clone(),
                procs,
                wall: *wall,
                speedup,
                efficiency: speedup * base_procs / procs as f64,
            }
        })
        .collect()
}

fn main() {
    let args = Args::parse();

    let records = match CheckpointStore::load(&args.checkpoint) {
        Ok(records) => records,
        Err(error) => {
            eprintln!("failed to read checkpoint {}: {error}", args.checkpoint.display());
            exit(1);
        }
    };

    let rows = rows(&records);
    let skipped = records.len() - rows.len();

    println!(
        "{:<24} {:>6} {:>10} {:>8} {:>10}",
        "job", "procs", "wall [s]", "speedup", "efficiency"
    );
    for row in rows {
        println!(
            "{:<24} {:>6} {:>10.2} {:>8.2} {:>10.2}",
            row.name, row.procs, row.wall, row.speedup, row.efficiency
        );
    }

    if skipped > 0 {
        eprintln!("{skipped} job(s) without a usable result were skipped");
    }
}
