//! cptools
#![deny(missing_docs)]

use clap::Parser;
use cp_wrap::{print_error_chain, run_generate, run_join};
use std::path::PathBuf;
use std::process::ExitCode;

const CMD: &str = "cptools";

/// Prepare CellProfiler batch jobs for submission to a compute cluster.
#[derive(Parser, Debug)]
#[clap(name = CMD, version)]
struct Cptools {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser, Debug)]
enum SubCommand {
    /// Generate staging, analysis and destaging commands plus submission
    /// scripts from a configuration file.
    #[clap(name = "generate")]
    Generate(Generate),

    /// Join per-job output tables back into one table per plate.
    #[clap(name = "join")]
    Join(Join),
}

#[derive(Parser, Debug)]
struct Generate {
    /// Path to the YAML configuration file.
    config: PathBuf,
}

#[derive(Parser, Debug)]
struct Join {
    /// Output location of the run whose results should be joined.
    #[clap(long)]
    location: PathBuf,

    /// One or more file patterns to join, e.g. Image.csv.
    #[clap(long, num_args = 1.., required = true)]
    patterns: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();
    let args = Cptools::parse();
    let result = match args.subcmd {
        SubCommand::Generate(generate) => run_generate(&generate.config),
        SubCommand::Join(join) => run_join(&join.location, &join.patterns),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            print_error_chain(&err);
            ExitCode::FAILURE
        }
    }
}
