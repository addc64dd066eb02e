//! The command line interface of the simulator.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

/// the command line interface of the simulator
#[derive(Parser, Debug)]
#[command(author, about, version)]
pub struct Cli {
    /// subcommand
    #[clap(subcommand)]
    pub subcmd: Operation,
}

/// the subcommands of the simulator
#[derive(Debug, Subcommand)]
pub enum Operation {
    /// run the simulator
    Run(RunArgs),
    /// write a preset config file
    GenConfig(GenConfigArgs),
    /// generate the shell completion script
    Completion(CompArgs),
}

/// the arguments of the run subcommand
#[derive(Debug, Args)]
pub struct RunArgs {
    /// the config file path
    pub config: PathBuf,
    /// transaction trace file; synthetic traffic when omitted
    #[arg(long)]
    pub trace: Option<PathBuf>,
    /// hard cycle limit for the run
    #[arg(long)]
    pub max_cycles: Option<u64>,
    /// epoch statistics CSV output path
    #[arg(long)]
    pub csv: Option<PathBuf>,
    /// number of synthetic transactions when no trace is given
    #[arg(long, default_value_t = 10_000)]
    pub synthetic: usize,
}

/// the arguments of the gen-config subcommand
#[derive(Debug, Args)]
pub struct GenConfigArgs {
    /// where to write the config
    pub path: PathBuf,
    /// emit the STT-MRAM variant of the preset
    #[arg(long)]
    pub smart_mram: bool,
}

/// the arguments of the completion subcommand
#[derive(Debug, Args)]
pub struct CompArgs {
    /// the shell type
    pub shell: Shell,
}
