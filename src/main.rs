//! encoder-trace CLI: build an encoder snapshot and trace a cell

use anyhow::Result;
use clap::Parser;
use encoder_trace::{Dimensions, ElementIdentifier, Session};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "encoder-trace")]
#[command(about = "Single-encoder Transformer forward pass with cell provenance")]
#[command(version)]
struct Cli {
    /// JSON file with {d_model, h, seq_len, n_layers, d_ff}
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hidden width
    #[arg(long)]
    d_model: Option<usize>,

    /// Number of attention heads (must divide d_model)
    #[arg(long)]
    heads: Option<usize>,

    /// Sequence length
    #[arg(long)]
    seq_len: Option<usize>,

    /// Number of encoder layers
    #[arg(long)]
    layers: Option<usize>,

    /// Feed-forward width (default: 4·d_model)
    #[arg(long)]
    d_ff: Option<usize>,

    /// Cell to trace, as a dotted path (e.g. "encoder.0.mha.h0.Scores")
    #[arg(short, long)]
    select: Option<String>,

    /// Row of the selected cell
    #[arg(long, default_value_t = 0)]
    row: usize,

    /// Column of the selected cell
    #[arg(long, default_value_t = 0)]
    col: usize,

    /// Also print the calculation breakdown of the selected cell
    #[arg(long)]
    explain: bool,

    /// Write the full snapshot as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn dimensions(&self) -> Result<Dimensions> {
        let mut dims = match &self.config {
            Some(path) => Dimensions::load(&path.to_string_lossy())?,
            None => Dimensions::default(),
        };
        if let Some(d_model) = self.d_model {
            dims.d_model = d_model;
            // Keep the UI coupling unless d_ff is given explicitly.
            dims = dims.with_ui_d_ff();
        }
        if let Some(h) = self.heads {
            dims.h = h;
        }
        if let Some(seq_len) = self.seq_len {
            dims.seq_len = seq_len;
        }
        if let Some(n_layers) = self.layers {
            dims.n_layers = n_layers;
        }
        if let Some(d_ff) = self.d_ff {
            dims.d_ff = d_ff;
        }
        Ok(dims)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let dims = cli.dimensions()?;
    if let Err(e) = dims.check_ui_ranges() {
        warn!("Outside the interactive ranges: {}", e);
    }

    println!("=== encoder-trace ===");
    println!(
        "d_model={} h={} d_k={} seq_len={} n_layers={} d_ff={}",
        dims.d_model,
        dims.h,
        dims.d_k(),
        dims.seq_len,
        dims.n_layers,
        dims.d_ff
    );

    let mut session = Session::new(dims);
    let Some(snapshot) = session.snapshot() else {
        anyhow::bail!("invalid dimensions (d_model must be divisible by h)");
    };

    println!("\n=== Tensors ===");
    for path in snapshot.paths() {
        if let Some(tensor) = snapshot.lookup(&path) {
            let (rows, cols) = tensor.shape();
            let name = path.to_string();
            println!("{name:<40} {rows}x{cols}");
        }
    }

    if let Some(output) = &cli.output {
        std::fs::write(output, serde_json::to_string_pretty(snapshot.as_ref())?)?;
        info!("Snapshot saved to {}", output.display());
    }

    if let Some(name) = &cli.select {
        let element = ElementIdentifier::new(name.as_str(), cli.row, cli.col);
        match snapshot.cell(&element) {
            Some(value) => println!("\nSelected {element} = {value:.2}"),
            None => warn!("{} does not address a cell of this snapshot", element),
        }
        if let Some(highlight) = session.select(element) {
            println!("\n=== Highlight ===");
            println!("{}", serde_json::to_string_pretty(highlight)?);
            println!(
                "{} sources ({} distinct)",
                highlight.sources.len(),
                highlight.distinct_sources().len()
            );
        }
        if cli.explain {
            if let Some(calc) = session.explain_selection() {
                println!("\n=== Calculation ===");
                println!("{}", serde_json::to_string_pretty(&calc)?);
            }
        }
    }

    Ok(())
}
