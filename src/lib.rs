//! a library for cycle-accurate DRAM/STT-MRAM memory controller simulation
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use clap::CommandFactory;
use cli::{Cli, CompArgs, GenConfigArgs, RunArgs};
use eyre::Result;
use tracing::info;
use tracing::metadata::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

use crate::mem::config::{MemoryConfig, MemoryType};
use crate::mem::timing::{DramTiming, SmartMramTiming};

pub mod cli;
pub mod mem;
pub mod trace;

pub use mem::MemorySystem;

/// set by the ctrl-c handler; long runs poll it between cycles
pub static STOP: AtomicBool = AtomicBool::new(false);

pub fn stop_requested() -> bool {
    STOP.load(Ordering::Relaxed)
}

#[allow(dead_code)]
pub fn init_logger_info() {
    init_logger(LevelFilter::INFO, io::stderr);
}

#[allow(dead_code)]
pub fn init_logger_debug() {
    init_logger(LevelFilter::DEBUG, io::stderr);
}

#[allow(dead_code)]
pub fn init_logger(
    filter: LevelFilter,
    writter: impl for<'writer> MakeWriter<'writer> + 'static + Send + Sync,
) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(filter.into())
                .from_env_lossy(),
        )
        .with_writer(writter)
        .with_ansi(false)
        .try_init()
        .unwrap_or_else(|e| {
            eprintln!("failed to init logger: {}", e);
        });
}

#[allow(dead_code)]
pub fn init_logger_stderr(filter: LevelFilter) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(filter.into())
                .from_env_lossy(),
        )
        .with_ansi(true)
        .try_init()
        .unwrap_or_else(|e| {
            eprintln!("failed to init logger: {}", e);
        });
}

/// the main function of the simulator
pub fn main_inner<A, T>(args: A) -> Result<()>
where
    A: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    std::fs::create_dir_all("output/")?;
    let file_appender = tracing_appender::rolling::hourly("output/", "mramsim.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    init_logger(LevelFilter::INFO, non_blocking);
    ctrlc::set_handler(|| {
        let _ = writeln!(
            io::stderr(),
            "\n------\nCTRL-C received, exiting gracefully"
        );
        let _ = writeln!(
            io::stderr(),
            "the simulator will stop at the end of the current cycle"
        );
        STOP.store(true, Ordering::Relaxed);
    })?;

    match cli.subcmd {
        cli::Operation::Run(RunArgs {
            config,
            trace: trace_path,
            max_cycles,
            csv,
            synthetic,
        }) => {
            println!("run with config: {:?}", config);
            let config = MemoryConfig::new(config)?;
            let output_path = config.output_path.clone();
            let entries = match trace_path {
                Some(path) => trace::parse_trace(path)?,
                None => trace::synthetic_trace(synthetic),
            };
            info!(transactions = entries.len(), "starting simulation");
            let current_time = std::time::Instant::now();
            let summary = match config.memory_type {
                MemoryType::Dram => {
                    trace::run_trace::<DramTiming>(config, entries, max_cycles, csv)?
                }
                MemoryType::SmartMram => {
                    trace::run_trace::<SmartMramTiming>(config, entries, max_cycles, csv)?
                }
            };
            if let Some(dir) = output_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            info!("the result will be written to {:?}", output_path);
            serde_json::to_writer_pretty(BufWriter::new(File::create(output_path)?), &summary)?;
            info!("time elapsed: {:?}", current_time.elapsed());
        }
        cli::Operation::GenConfig(GenConfigArgs { path, smart_mram }) => {
            let config = if smart_mram {
                MemoryConfig::from_ddr3_1333_smart_mram()
            } else {
                MemoryConfig::from_ddr3_1333()
            };
            config.save_to_file(&path)?;
            println!("wrote preset config to {:?}", path);
        }
        cli::Operation::Completion(CompArgs { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "mramsim", &mut io::stdout());
        }
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::mem::config::MemoryConfig;
    use crate::mem::timing::DramTiming;
    use crate::trace;

    #[test]
    fn synthetic_run_round_trips_every_transaction() {
        let config = MemoryConfig::from_ddr3_1333();
        let entries = trace::synthetic_trace(200);
        let summary =
            trace::run_trace::<DramTiming>(config, entries, Some(500_000), None).unwrap();
        assert_eq!(
            summary.reads_returned + summary.writes_completed,
            summary.transactions_admitted
        );
    }
}
