use chrono::NaiveDate;
use clap::Parser;
use participant_metrics::MemoryStore;
use qu::ick_use::*;
use std::path::PathBuf;
use term_data_table::{Cell, Row, Table};

#[derive(Parser)]
struct Opt {
    /// Metrics store file written by `run_metrics`.
    #[clap(long, default_value = "metrics.bin")]
    store: PathBuf,
    /// Restrict to one HPO; use "" for the cross-HPO aggregate.
    #[clap(long)]
    hpo: Option<String>,
    #[clap(long)]
    start: Option<NaiveDate>,
    #[clap(long)]
    end: Option<NaiveDate>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let store = MemoryStore::load(&opt.store)?;
    let Some(version) = store.serving_version() else {
        bail!("no complete metrics version in \"{}\"", opt.store.display());
    };

    header(&format!(
        "Metrics version {} (run at {})",
        version.id, version.date
    ));
    let start = opt.start.unwrap_or(NaiveDate::MIN);
    let end = opt.end.unwrap_or(NaiveDate::MAX);
    let buckets = store.serving_buckets(opt.hpo.as_deref(), start, end);
    println!("{} bucket(s)", buckets.len());

    for bucket in buckets {
        let hpo = if bucket.hpo_id.is_empty() {
            "(all HPOs)"
        } else {
            &bucket.hpo_id
        };
        header(&format!("{} {}", hpo, bucket.date));
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from("Metric"))
                .with_cell(Cell::from("Count")),
        );
        for (metric, count) in &bucket.metrics {
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(metric.as_str()))
                    .with_cell(Cell::from(count.to_string())),
            );
        }
        println!("{}", table);
    }
    Ok(())
}

fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}
