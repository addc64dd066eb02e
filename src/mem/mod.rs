//! the memory subsystem
//!
//! `MemorySystem` owns one controller and its ranks (one channel) and
//! drives them one bus-clock cycle per `update()`. ownership is a strict
//! tree: ranks never see the controller, the system moves returning DATA
//! packets between them.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use self::{
    config::MemoryConfig,
    controller::{MemoryController, PowerCallback, ReadCallback, WriteCallback},
    packet::Transaction,
    rank::Rank,
    stats::{CsvWriter, EpochStats},
    timing::TimingPolicy,
};

pub mod addressing;
pub mod bank;
pub mod command_queue;
pub mod config;
pub mod controller;
pub mod packet;
pub mod rank;
pub mod stats;
pub mod timing;

pub struct MemorySystem<P: TimingPolicy> {
    cfg: Arc<MemoryConfig>,
    pub controller: MemoryController<P>,
    ranks: Vec<Rank>,
    csv: Option<CsvWriter>,
}

impl<P: TimingPolicy + Default> MemorySystem<P> {
    pub fn new(cfg: MemoryConfig) -> Self {
        Self::with_channel(cfg, 0)
    }

    pub fn with_channel(cfg: MemoryConfig, channel: usize) -> Self {
        let cfg = Arc::new(cfg);
        let ranks = (0..cfg.num_ranks)
            .map(|id| Rank::new(id, cfg.clone()))
            .collect();
        Self {
            controller: MemoryController::new(cfg.clone(), P::default(), channel),
            ranks,
            csv: None,
            cfg,
        }
    }
}

impl<P: TimingPolicy> MemorySystem<P> {
    pub fn config(&self) -> &MemoryConfig {
        &self.cfg
    }

    pub fn cycle(&self) -> u64 {
        self.controller.current_cycle()
    }

    pub fn set_csv_output(&mut self, path: impl AsRef<Path>) -> eyre::Result<()> {
        self.csv = Some(CsvWriter::new(path)?);
        Ok(())
    }

    pub fn register_read_callback(&mut self, cb: ReadCallback) {
        self.controller.set_read_callback(cb);
    }

    pub fn register_write_callback(&mut self, cb: WriteCallback) {
        self.controller.set_write_callback(cb);
    }

    pub fn register_power_callback(&mut self, cb: PowerCallback) {
        self.controller.set_power_callback(cb);
    }

    pub fn will_accept_transaction(&self) -> bool {
        self.controller.will_accept_transaction()
    }

    pub fn add_transaction(&mut self, trans: Transaction) -> bool {
        self.controller.add_transaction(trans)
    }

    /// one bus cycle: ranks first (surfacing due read bursts), then the
    /// controller, then the epoch boundary
    pub fn update(&mut self) {
        for rank in self.ranks.iter_mut() {
            if let Some(pkt) = rank.update() {
                self.controller.receive_from_bus(pkt);
            }
        }
        self.controller.update(&mut self.ranks);
        if self.controller.current_cycle() % self.cfg.epoch_length == 0 {
            self.emit_epoch();
        }
    }

    fn emit_epoch(&mut self) -> EpochStats {
        let epoch = self.controller.collect_epoch();
        info!(
            channel = epoch.channel,
            cycles = epoch.cycles,
            bandwidth_gbps = epoch.aggregate_bandwidth_gbps,
            transactions = epoch.total_transactions,
            "epoch statistics"
        );
        if let Some(csv) = self.csv.as_mut() {
            let c = epoch.channel;
            for (r, rank) in epoch.ranks.iter().enumerate() {
                csv.field(
                    CsvWriter::indexed_name("Background_Power", &[c, r]),
                    rank.background_power_w,
                );
                csv.field(
                    CsvWriter::indexed_name("ACT_PRE_Power", &[c, r]),
                    rank.actpre_power_w,
                );
                csv.field(CsvWriter::indexed_name("Burst_Power", &[c, r]), rank.burst_power_w);
                csv.field(
                    CsvWriter::indexed_name("Refresh_Power", &[c, r]),
                    rank.refresh_power_w,
                );
                for (b, bank) in rank.banks.iter().enumerate() {
                    csv.field(
                        CsvWriter::indexed_name("Bandwidth", &[c, r, b]),
                        bank.bandwidth_gbps,
                    );
                    csv.field(
                        CsvWriter::indexed_name("Average_Latency", &[c, r, b]),
                        bank.average_latency_ns,
                    );
                }
            }
            csv.field(
                CsvWriter::indexed_name("Aggregate_Bandwidth", &[c]),
                epoch.aggregate_bandwidth_gbps,
            );
            if let Err(error) = csv.finish_row() {
                tracing::warn!(%error, "dropping csv epoch row");
            }
        }
        epoch
    }

    /// end-of-run statistics for whatever partial epoch remains
    pub fn finalize(&mut self) -> EpochStats {
        self.emit_epoch()
    }
}
