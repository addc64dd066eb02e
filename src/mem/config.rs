//! the memory system configuration
//!
//! every timing, sizing and current constant the controller consumes lives
//! here as one immutable struct, loaded from toml or built from a preset.
//! cycle-valued parameters are in bus-clock cycles, `tck` is in ns, IDD
//! currents in mA per device.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    #[default]
    Dram,
    SmartMram,
}

/// command queue partitioning: one queue per rank, or one per (rank, bank)
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum QueueStructure {
    #[default]
    PerRank,
    PerRankPerBank,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RowBufferPolicy {
    /// rows stay open until a row conflict or a refresh closes them
    #[default]
    OpenPage,
    /// every column command carries auto-precharge
    ClosePage,
}

/// field order the address mapper slices the physical address into,
/// most-significant field first (channel count is fixed at one per §6)
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AddressMappingScheme {
    #[default]
    RowBankRankColChan,
    RowColRankBankChan,
    ChanRankBankRowCol,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MemoryConfig {
    // geometry
    pub num_channels: usize,
    pub num_ranks: usize,
    pub num_banks: usize,
    pub num_rows: usize,
    pub num_cols: usize,
    /// devices ganged per rank to fill the data bus
    pub num_devices: u64,
    pub jedec_data_bus_bits: u64,

    // mode
    pub memory_type: MemoryType,
    pub queue_structure: QueueStructure,
    pub row_buffer_policy: RowBufferPolicy,
    pub address_scheme: AddressMappingScheme,
    pub use_low_power: bool,

    // burst / latency
    pub bl: u64,
    pub wl: u64,
    pub al: u64,
    pub cl: u64,
    /// bus clock period in ns
    pub tck: f64,

    // DRAM timing matrix, in cycles
    pub t_rc: u64,
    pub t_ras: u64,
    pub t_rcd: u64,
    pub t_rp: u64,
    pub t_rrd: u64,
    pub t_rtrs: u64,
    pub t_ccd: u64,
    pub t_rtp: u64,
    pub t_wtr: u64,
    pub t_wr: u64,
    pub t_rfc: u64,
    pub t_cke: u64,
    pub t_xp: u64,
    pub t_faw: u64,
    pub t_cmd: u64,
    pub refresh_period_ns: f64,

    // queues and stats
    pub trans_queue_depth: usize,
    pub cmd_queue_depth: usize,
    pub epoch_length: u64,
    pub histogram_bin_size: u64,

    // JEDEC device currents, mA
    pub idd0: u64,
    pub idd1: u64,
    pub idd2p: u64,
    pub idd2q: u64,
    pub idd2n: u64,
    pub idd3n: u64,
    pub idd4w: u64,
    pub idd4r: u64,
    pub idd5: u64,
    pub idd6: u64,
    pub idd6l: u64,
    pub idd7: u64,
    pub vdd: f64,

    pub output_path: PathBuf,
}

impl MemoryConfig {
    pub fn new(path: impl AsRef<Path>) -> eyre::Result<Self> {
        Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> eyre::Result<()> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// DDR3-1333-class device, 2 Gbit x8 parts, one rank of 8 devices
    pub fn from_ddr3_1333() -> Self {
        Self {
            num_channels: 1,
            num_ranks: 1,
            num_banks: 8,
            num_rows: 32768,
            num_cols: 1024,
            num_devices: 8,
            jedec_data_bus_bits: 64,
            memory_type: MemoryType::Dram,
            queue_structure: QueueStructure::PerRank,
            row_buffer_policy: RowBufferPolicy::OpenPage,
            address_scheme: AddressMappingScheme::RowBankRankColChan,
            use_low_power: false,
            bl: 8,
            wl: 6,
            al: 0,
            cl: 9,
            tck: 1.5,
            t_rc: 33,
            t_ras: 24,
            t_rcd: 9,
            t_rp: 9,
            t_rrd: 4,
            t_rtrs: 1,
            t_ccd: 4,
            t_rtp: 5,
            t_wtr: 5,
            t_wr: 10,
            t_rfc: 107,
            t_cke: 4,
            t_xp: 4,
            t_faw: 20,
            t_cmd: 1,
            refresh_period_ns: 7800.0,
            trans_queue_depth: 32,
            cmd_queue_depth: 32,
            epoch_length: 100_000,
            histogram_bin_size: 10,
            idd0: 130,
            idd1: 155,
            idd2p: 10,
            idd2q: 70,
            idd2n: 70,
            idd3n: 90,
            idd4w: 300,
            idd4r: 255,
            idd5: 305,
            idd6: 9,
            idd6l: 12,
            idd7: 415,
            vdd: 1.5,
            output_path: PathBuf::from("output/mramsim.json"),
        }
    }

    /// same device geometry and bus, restore-free STT-MRAM cell timing
    pub fn from_ddr3_1333_smart_mram() -> Self {
        Self {
            memory_type: MemoryType::SmartMram,
            ..Self::from_ddr3_1333()
        }
    }

    // derived delays, computed the way the original simulator derived them
    // from the ini parameters at load time

    pub fn read_latency(&self) -> u64 {
        self.al + self.cl
    }

    pub fn burst_cycles(&self) -> u64 {
        self.bl / 2
    }

    pub fn read_to_pre_delay(&self) -> u64 {
        self.al + self.bl / 2 + self.t_rtp.max(self.t_ccd) - self.t_ccd
    }

    pub fn write_to_pre_delay(&self) -> u64 {
        self.wl + self.bl / 2 + self.t_wr
    }

    pub fn read_autopre_delay(&self) -> u64 {
        self.al + self.t_rtp + self.t_rp
    }

    pub fn write_autopre_delay(&self) -> u64 {
        self.wl + self.bl / 2 + self.t_wr + self.t_rp
    }

    pub fn read_to_write_delay(&self) -> u64 {
        (self.read_latency() + self.bl / 2 + self.t_rtrs).saturating_sub(self.wl)
    }

    pub fn write_to_read_delay_b(&self) -> u64 {
        self.wl + self.bl / 2 + self.t_wtr
    }

    pub fn write_to_read_delay_r(&self) -> u64 {
        (self.wl + self.bl / 2 + self.t_rtrs).saturating_sub(self.read_latency())
    }

    pub fn refresh_period_cycles(&self) -> u64 {
        (self.refresh_period_ns / self.tck) as u64
    }

    pub fn bytes_per_transaction(&self) -> u64 {
        self.jedec_data_bus_bits * self.bl / 8
    }

    /// one ACTIVATE+PRECHARGE pair, mA x cycles across the rank's devices
    pub fn act_pre_energy(&self) -> u64 {
        (self.idd0 * self.t_rc - (self.idd3n * self.t_ras + self.idd2n * (self.t_rc - self.t_ras)))
            * self.num_devices
    }
}
