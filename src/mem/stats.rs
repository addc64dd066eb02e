//! energy, latency and bandwidth accounting
//!
//! raw accumulators live here (mA x cycles for energy, cycles for
//! latency); conversion to watts, GB/s and ns happens once per epoch.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::mem::config::MemoryConfig;

/// per-epoch raw counters, owned by the controller
#[derive(Debug)]
pub struct ControllerStats {
    pub total_transactions: u64,
    pub total_reads_per_bank: Vec<Vec<u64>>,
    pub total_writes_per_bank: Vec<Vec<u64>>,
    /// summed read latency (cycles) per bank, this epoch
    pub total_epoch_latency: Vec<Vec<u64>>,
    pub grand_total_bank_accesses: Vec<Vec<u64>>,
    pub background_energy: Vec<u64>,
    pub burst_energy: Vec<u64>,
    pub actpre_energy: Vec<u64>,
    pub refresh_energy: Vec<u64>,
    pub refreshes_issued: Vec<u64>,
    /// total latency (add-to-return), binned
    pub latencies: BTreeMap<u64, u64>,
    /// access latency (first-command-to-return), binned
    pub access_latencies: BTreeMap<u64, u64>,
    histogram_bin_size: u64,
}

impl ControllerStats {
    pub fn new(cfg: &MemoryConfig) -> Self {
        let per_bank = || vec![vec![0u64; cfg.num_banks]; cfg.num_ranks];
        Self {
            total_transactions: 0,
            total_reads_per_bank: per_bank(),
            total_writes_per_bank: per_bank(),
            total_epoch_latency: per_bank(),
            grand_total_bank_accesses: per_bank(),
            background_energy: vec![0; cfg.num_ranks],
            burst_energy: vec![0; cfg.num_ranks],
            actpre_energy: vec![0; cfg.num_ranks],
            refresh_energy: vec![0; cfg.num_ranks],
            refreshes_issued: vec![0; cfg.num_ranks],
            latencies: BTreeMap::new(),
            access_latencies: BTreeMap::new(),
            histogram_bin_size: cfg.histogram_bin_size,
        }
    }

    pub fn insert_total_latency(&mut self, latency: u64, rank: usize, bank: usize) {
        self.total_epoch_latency[rank][bank] += latency;
        let bin = latency / self.histogram_bin_size * self.histogram_bin_size;
        *self.latencies.entry(bin).or_default() += 1;
    }

    pub fn insert_access_latency(&mut self, latency: u64) {
        let bin = latency / self.histogram_bin_size * self.histogram_bin_size;
        *self.access_latencies.entry(bin).or_default() += 1;
    }

    /// epoch rollover: fold per-bank access counts into the grand totals,
    /// zero everything that is per-epoch. histograms survive resets.
    pub fn reset_epoch(&mut self) {
        for (rank, banks) in self.grand_total_bank_accesses.iter_mut().enumerate() {
            for (bank, total) in banks.iter_mut().enumerate() {
                *total += self.total_reads_per_bank[rank][bank]
                    + self.total_writes_per_bank[rank][bank];
            }
        }
        for grid in [
            &mut self.total_reads_per_bank,
            &mut self.total_writes_per_bank,
            &mut self.total_epoch_latency,
        ] {
            grid.iter_mut().flatten().for_each(|v| *v = 0);
        }
        for per_rank in [
            &mut self.background_energy,
            &mut self.burst_energy,
            &mut self.actpre_energy,
            &mut self.refresh_energy,
        ] {
            per_rank.iter_mut().for_each(|v| *v = 0);
        }
    }
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct BankStats {
    pub bandwidth_gbps: f64,
    pub average_latency_ns: f64,
    pub activates: u64,
    pub row_hits: u64,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct RankStats {
    pub reads: u64,
    pub writes: u64,
    pub average_power_w: f64,
    pub background_power_w: f64,
    pub burst_power_w: f64,
    pub refresh_power_w: f64,
    pub actpre_power_w: f64,
    pub banks: Vec<BankStats>,
}

/// one epoch worth of converted statistics
#[derive(Serialize, Debug, Clone, Default)]
pub struct EpochStats {
    pub channel: usize,
    pub cycles: u64,
    pub total_transactions: u64,
    pub total_bytes: u64,
    pub aggregate_bandwidth_gbps: f64,
    pub ranks: Vec<RankStats>,
}

impl EpochStats {
    /// energy / cycles x Vdd / 1000: mA x cycles accumulators to watts
    pub fn power_watts(energy: u64, cycles: u64, vdd: f64) -> f64 {
        energy as f64 / cycles as f64 * vdd / 1000.0
    }
}

/// appends one row per epoch with `Name[channel][rank][bank?]` headers,
/// written lazily on the first completed row
pub struct CsvWriter {
    out: BufWriter<File>,
    header: Vec<String>,
    values: Vec<String>,
    header_written: bool,
}

impl CsvWriter {
    pub fn new(path: impl AsRef<Path>) -> eyre::Result<Self> {
        if let Some(dir) = path.as_ref().parent() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
            header: Vec::new(),
            values: Vec::new(),
            header_written: false,
        })
    }

    pub fn indexed_name(base: &str, indices: &[usize]) -> String {
        let mut name = base.to_string();
        for index in indices {
            name.push_str(&format!("[{index}]"));
        }
        name
    }

    pub fn field(&mut self, name: String, value: f64) {
        if !self.header_written {
            self.header.push(name);
        }
        self.values.push(format!("{value:.3}"));
    }

    pub fn finish_row(&mut self) -> eyre::Result<()> {
        if !self.header_written {
            writeln!(self.out, "{}", self.header.join(","))?;
            self.header_written = true;
        }
        writeln!(self.out, "{}", self.values.join(","))?;
        self.values.clear();
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_binning() {
        let cfg = MemoryConfig::from_ddr3_1333();
        let mut stats = ControllerStats::new(&cfg);
        stats.insert_total_latency(27, 0, 0);
        stats.insert_total_latency(23, 0, 0);
        stats.insert_total_latency(30, 0, 0);
        assert_eq!(stats.latencies.get(&20), Some(&2));
        assert_eq!(stats.latencies.get(&30), Some(&1));
        assert_eq!(stats.total_epoch_latency[0][0], 80);
    }

    #[test]
    fn epoch_reset_folds_grand_totals() {
        let cfg = MemoryConfig::from_ddr3_1333();
        let mut stats = ControllerStats::new(&cfg);
        stats.total_reads_per_bank[0][3] = 7;
        stats.total_writes_per_bank[0][3] = 2;
        stats.burst_energy[0] = 999;
        stats.reset_epoch();
        assert_eq!(stats.grand_total_bank_accesses[0][3], 9);
        assert_eq!(stats.total_reads_per_bank[0][3], 0);
        assert_eq!(stats.burst_energy[0], 0);
        stats.total_reads_per_bank[0][3] = 1;
        stats.reset_epoch();
        assert_eq!(stats.grand_total_bank_accesses[0][3], 10);
    }

    #[test]
    fn indexed_names() {
        assert_eq!(CsvWriter::indexed_name("Bandwidth", &[0, 1, 5]), "Bandwidth[0][1][5]");
        assert_eq!(CsvWriter::indexed_name("Refresh_Power", &[2, 0]), "Refresh_Power[2][0]");
    }

    #[test]
    fn power_conversion() {
        // 5200 mA-cycles over 5200 cycles at 1.5 V = 1.5 mW
        let w = EpochStats::power_watts(5200, 5200, 1.5);
        assert!((w - 0.0015).abs() < 1e-9);
    }
}
