//! Trace a cell back through one encoder layer
//!
//! Builds the default encoder, prints the calculation breakdown of one
//! cell (an attention score by default), then lists the distinct sources
//! it was computed from, one step back.
//!
//! Usage:
//!   cargo run --example trace_cell
//!   cargo run --example trace_cell -- --name "encoder.0.ffn.Output" --row 1 --col 2

use anyhow::Result;
use clap::Parser;
use encoder_trace::{explain, resolve, Dimensions, ElementIdentifier, Session};

#[derive(Parser)]
#[command(name = "trace_cell")]
#[command(about = "Explain one cell and list its direct sources")]
struct Args {
    /// Dotted path of the starting cell
    #[arg(short, long, default_value = "encoder.0.mha.h0.Scores")]
    name: String,

    #[arg(long, default_value_t = 1)]
    row: usize,

    #[arg(long, default_value_t = 0)]
    col: usize,

    /// Number of encoder layers
    #[arg(long, default_value_t = 1)]
    layers: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let dims = Dimensions {
        n_layers: args.layers,
        ..Dimensions::default()
    };
    let session = Session::new(dims);
    let Some(data) = session.snapshot() else {
        anyhow::bail!("invalid dimensions");
    };

    let start = ElementIdentifier::new(args.name, args.row, args.col);
    println!("=== Tracing {start} ===\n");

    let calc = explain(&data, &start);
    println!("{} ({:?})", calc.title, calc.op);
    for step in &calc.steps {
        println!("  {} = {:.2}", step.label, step.result);
    }

    let state = resolve(&data, &start);
    println!("\nSources:");
    for source in state.distinct_sources() {
        let extent = match (source.highlight_row, source.highlight_col) {
            (true, _) => format!("row {}", source.element.row),
            (_, true) => format!("column {}", source.element.col),
            _ => format!("cell ({}, {})", source.element.row, source.element.col),
        };
        println!("  {} {}", source.element.name, extent);
    }
    if state.sources.is_empty() {
        println!("  (leaf: no further sources)");
    }

    Ok(())
}
