use anyhow::Result;
use clap::{Args, ValueEnum};
use comfy_table::{Table, presets::UTF8_FULL};
use waypoint_core::config::EngineConfig;
use waypoint_core::dispatch::{ExecutionEngine, QueryResults, RunStats};

use super::OutputContext;
use crate::demo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Demo {
    /// Tuples per query
    Count,
    /// Orders per region
    Group,
    /// Orders joined to customers, counted per tier
    Join,
    /// Amounts centered on the mean computed by an upstream waypoint
    Center,
    /// One-dimensional k-means over the amounts
    Kmeans,
    /// A count repeated over several passes of the scan
    Passes,
}

#[derive(Args)]
pub struct RunArgs {
    /// Plan to run
    #[arg(value_enum, default_value = "count")]
    pub demo: Demo,

    /// Synthetic orders to generate
    #[arg(long, default_value = "100000")]
    pub tuples: usize,

    /// Tuples per chunk
    #[arg(long, default_value = "8192")]
    pub chunk_tuples: usize,

    /// Queries sharing the plan (query `i` sees every `i+1`-th order)
    #[arg(short, long, default_value = "2")]
    pub queries: usize,

    /// Random seed for the synthetic data
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Fragments for the group demo, clusters for kmeans, passes for passes
    #[arg(long, default_value = "3")]
    pub param: usize,

    /// Print run statistics
    #[arg(long)]
    pub stats: bool,
}

pub fn execute(args: RunArgs, cfg: EngineConfig, output: &OutputContext) -> Result<()> {
    if args.queries == 0 || args.chunk_tuples == 0 {
        output.print_error("--queries and --chunk-tuples must be positive");
        return Ok(());
    }

    let orders = demo::orders(args.tuples, args.chunk_tuples, args.queries, args.seed)?;
    if output.verbose {
        output.print_info(&format!(
            "Generated {} orders in {} chunks",
            args.tuples,
            orders.len()
        ));
    }

    let plan = match args.demo {
        Demo::Count => demo::count_plan(orders, args.queries)?,
        Demo::Group => demo::group_plan(orders, args.queries, args.param)?,
        Demo::Join => demo::join_plan(orders, args.queries)?,
        Demo::Center => demo::center_plan(orders, args.queries)?,
        Demo::Kmeans => demo::kmeans_plan(orders, args.queries, args.param)?,
        Demo::Passes => demo::passes_plan(orders, args.queries, u32::try_from(args.param)?)?,
    };

    let mut engine = ExecutionEngine::new(cfg)?;
    let results = engine.run(&plan)?;
    engine.shutdown()?;

    if output.json {
        return output.print_json(&results);
    }

    print_results(args.demo, &results, output);
    if args.stats {
        print_stats(&results.stats, output);
    }
    output.print_success(&format!(
        "{} queries finished in {:.1} ms",
        results.outputs.len(),
        results.stats.elapsed.as_secs_f64() * 1000.0
    ));
    Ok(())
}

fn column_names(demo: Demo) -> &'static [&'static str] {
    match demo {
        Demo::Count => &["tuples"],
        Demo::Group => &["region", "orders"],
        Demo::Join => &["tier", "orders"],
        Demo::Center => &["sum_centered"],
        Demo::Kmeans => &["cluster", "center", "points"],
        Demo::Passes => &["passes", "tuples_seen"],
    }
}

fn print_results(demo: Demo, results: &QueryResults, output: &OutputContext) {
    let names = column_names(demo);
    for (query, out) in &results.outputs {
        if !output.csv {
            output.print_info(&format!("{query}: {} rows", out.len()));
        }
        let columns: Vec<String> = out
            .columns
            .iter()
            .map(|slot| {
                names
                    .get(usize::from(*slot))
                    .map_or_else(|| format!("slot_{slot}"), |n| (*n).to_string())
            })
            .collect();
        output.print_table(&columns, &out.rows);
    }
}

fn print_stats(stats: &RunStats, output: &OutputContext) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Stage", "Invocations", "Time (ms)"]);
    for (tag, count) in &stats.stage_invocations {
        let ms = stats
            .stage_time
            .get(tag)
            .map_or(0.0, |d| d.as_secs_f64() * 1000.0);
        table.add_row(vec![format!("{tag:?}"), count.to_string(), format!("{ms:.2}")]);
    }
    println!("{table}");

    output.print_info(&format!("Chunks scanned: {}", stats.chunks_scanned));
    if stats.overfull_events > 0 {
        output.print_info(&format!(
            "Overfull segments: {} (cleaner advised {})",
            stats.overfull_events, stats.cleaner_advice
        ));
    }
    if stats.cleaner_passes > 0 {
        output.print_info(&format!(
            "Cleaner passes: {} ({} join records spilled)",
            stats.cleaner_passes, stats.records_spilled
        ));
    }
    if stats.records_purged > 0 {
        output.print_info(&format!("Join records purged: {}", stats.records_purged));
    }
    for (waypoint, rounds) in &stats.rounds {
        output.print_info(&format!("{waypoint}: {rounds} rounds"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_demo_has_names() {
        for demo in Demo::value_variants() {
            assert!(!column_names(*demo).is_empty());
        }
    }
}
