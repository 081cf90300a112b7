use clap::Parser;
use std::path::PathBuf;

use doff::loops::{LoopProvider, NoLoops, StaticLoops};
use doff::simplify::PruneEmptyStates;
use doff::transform::{OffloadConfig, OffloadError, Offloader};

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    Json,
    Dot,
}

#[derive(Parser, Debug)]
#[command(
    name = "doff",
    version,
    about = "doff — rewrites a dataflow program graph to run its array computation on an accelerator device"
)]
struct Cli {
    /// Input program graph (JSON)
    graph: PathBuf,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Structural loop descriptors, keyed by graph label (JSON)
    #[arg(long)]
    loops: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Json)]
    emit: EmitStage,

    /// Skip the explicit prologue copy for this array (repeatable)
    #[arg(long = "exclude-copyin")]
    exclude_copy_in: Vec<String>,

    /// Skip the explicit epilogue copy for this array (repeatable)
    #[arg(long = "exclude-copyout")]
    exclude_copy_out: Vec<String>,

    /// Keep empty scaffolding states instead of pruning them
    #[arg(long)]
    no_simplify: bool,

    /// Print transform statistics
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let source = match std::fs::read_to_string(&cli.graph) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("doff: error: {}: {}", cli.graph.display(), e);
            std::process::exit(2);
        }
    };
    let mut graph: doff::ir::ProgramGraph = match serde_json::from_str(&source) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("doff: error: {}: invalid graph: {}", cli.graph.display(), e);
            std::process::exit(2);
        }
    };

    if cli.verbose {
        eprintln!(
            "doff: loaded '{}': {} states, {} arrays",
            graph.label,
            graph.state_ids().len(),
            graph.arrays.len(),
        );
    }

    let provider: Box<dyn LoopProvider> = match &cli.loops {
        Some(path) => {
            let text = match std::fs::read_to_string(path) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("doff: error: {}: {}", path.display(), e);
                    std::process::exit(2);
                }
            };
            match serde_json::from_str::<StaticLoops>(&text) {
                Ok(p) => Box::new(p),
                Err(e) => {
                    eprintln!("doff: error: {}: invalid loop file: {}", path.display(), e);
                    std::process::exit(2);
                }
            }
        }
        None => Box::new(NoLoops),
    };

    let config = OffloadConfig {
        run_simplify_after: !cli.no_simplify,
        exclude_copy_in: cli.exclude_copy_in.iter().cloned().collect(),
        exclude_copy_out: cli.exclude_copy_out.iter().cloned().collect(),
        ..OffloadConfig::default()
    };
    let offloader = Offloader::new(config);

    match offloader.apply(&mut graph, provider.as_ref(), Some(&PruneEmptyStates)) {
        Ok(()) => {}
        Err(OffloadError::NotApplicable) => {
            eprintln!("doff: error: transform not applicable to '{}'", graph.label);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("doff: error: {}", e);
            std::process::exit(1);
        }
    }

    if cli.verbose {
        eprintln!(
            "doff: transformed '{}': {} states, {} arrays",
            graph.label,
            graph.state_ids().len(),
            graph.arrays.len(),
        );
    }

    let rendered = match cli.emit {
        EmitStage::Json => match serde_json::to_string_pretty(&graph) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("doff: error: serialization failed: {}", e);
                std::process::exit(1);
            }
        },
        EmitStage::Dot => doff::dot::emit_dot(&graph),
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, rendered) {
                eprintln!("doff: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
        None => println!("{rendered}"),
    }
}
