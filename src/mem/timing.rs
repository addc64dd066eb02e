//! cell-technology timing strategy
//!
//! the controller tick is identical for DRAM and STT-MRAM; the two
//! technologies differ only in what ACTIVATE, PRECHARGE and the implicit
//! auto-precharge do to a bank, and in when the activation energy is
//! charged. those differences live behind this trait, picked once at
//! system construction.

use crate::mem::{
    bank::{BankState, CurrentBankState},
    config::MemoryConfig,
    packet::BusPacketType,
};

pub trait TimingPolicy {
    /// bank update when a READ_P/WRITE_P implicit precharge countdown expires
    fn finish_auto_precharge(&self, cfg: &MemoryConfig, bank: &mut BankState);

    /// bank-local state and timing on ACTIVATE issue; returns the
    /// activation energy (mA x cycles x devices) charged at this instant
    fn issue_activate(&self, cfg: &MemoryConfig, now: u64, bank: &mut BankState, row: u64) -> u64;

    /// bank-local state and timing on explicit PRECHARGE issue
    fn issue_precharge(&self, cfg: &MemoryConfig, now: u64, bank: &mut BankState);

    /// activation energy charged lazily at a column access, given the
    /// bank's previous command (nonzero only right after ACTIVATE)
    fn column_access_energy(&self, cfg: &MemoryConfig, last_command: BusPacketType) -> u64;
}

/// conventional destructive-read DRAM: rows must be restored (tRAS) and
/// precharged (tRP), and the activation energy is paid up front
#[derive(Debug, Default, Clone, Copy)]
pub struct DramTiming;

impl TimingPolicy for DramTiming {
    fn finish_auto_precharge(&self, cfg: &MemoryConfig, bank: &mut BankState) {
        bank.current_state = CurrentBankState::Precharging;
        bank.open_row = None;
        bank.last_command = BusPacketType::Precharge;
        bank.state_change_countdown = cfg.t_rp;
    }

    fn issue_activate(&self, cfg: &MemoryConfig, now: u64, bank: &mut BankState, row: u64) -> u64 {
        bank.current_state = CurrentBankState::RowActive;
        bank.last_command = BusPacketType::Activate;
        bank.open_row = Some(row);
        bank.push_next_activate(now + cfg.t_rc);
        bank.push_next_precharge(now + cfg.t_ras);
        bank.push_next_read(now + (cfg.t_rcd - cfg.al));
        bank.push_next_write(now + (cfg.t_rcd - cfg.al));
        cfg.act_pre_energy()
    }

    fn issue_precharge(&self, cfg: &MemoryConfig, now: u64, bank: &mut BankState) {
        bank.current_state = CurrentBankState::Precharging;
        bank.open_row = None;
        bank.last_command = BusPacketType::Precharge;
        bank.state_change_countdown = cfg.t_rp;
        bank.push_next_activate(now + cfg.t_rp);
    }

    fn column_access_energy(&self, _cfg: &MemoryConfig, _last_command: BusPacketType) -> u64 {
        0
    }
}

/// STT-MRAM with non-destructive reads: no restore phase, so activation
/// carries no tRCD/tRAS obligation and precharge is instantaneous. the
/// sensing energy moves from ACTIVATE to the first column access.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmartMramTiming;

impl TimingPolicy for SmartMramTiming {
    fn finish_auto_precharge(&self, _cfg: &MemoryConfig, bank: &mut BankState) {
        bank.current_state = CurrentBankState::Idle;
        bank.open_row = None;
        bank.last_command = BusPacketType::Precharge;
        bank.state_change_countdown = 0;
    }

    fn issue_activate(&self, cfg: &MemoryConfig, now: u64, bank: &mut BankState, row: u64) -> u64 {
        bank.current_state = CurrentBankState::RowActive;
        bank.last_command = BusPacketType::Activate;
        bank.open_row = Some(row);
        bank.push_next_activate(now + cfg.t_rrd);
        // max-merge keeps earlier bus reservations on this bank intact
        bank.push_next_precharge(now);
        bank.push_next_read(now);
        bank.push_next_write(now);
        0
    }

    fn issue_precharge(&self, _cfg: &MemoryConfig, now: u64, bank: &mut BankState) {
        bank.current_state = CurrentBankState::Idle;
        bank.open_row = None;
        bank.last_command = BusPacketType::Precharge;
        bank.state_change_countdown = 0;
        bank.push_next_activate(now);
    }

    fn column_access_energy(&self, cfg: &MemoryConfig, last_command: BusPacketType) -> u64 {
        if last_command == BusPacketType::Activate {
            cfg.act_pre_energy()
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dram_activate_arms_full_matrix() {
        let cfg = MemoryConfig::from_ddr3_1333();
        let mut bank = BankState::default();
        let energy = DramTiming.issue_activate(&cfg, 100, &mut bank, 9);
        assert_eq!(bank.open_row, Some(9));
        assert_eq!(bank.next_activate, 100 + cfg.t_rc);
        assert_eq!(bank.next_precharge, 100 + cfg.t_ras);
        assert_eq!(bank.next_read, 100 + cfg.t_rcd);
        assert_eq!(energy, cfg.act_pre_energy());
    }

    #[test]
    fn smart_mram_activate_is_immediate_and_defers_energy() {
        let cfg = MemoryConfig::from_ddr3_1333();
        let mut bank = BankState::default();
        let energy = SmartMramTiming.issue_activate(&cfg, 100, &mut bank, 9);
        assert_eq!(bank.next_read, 100);
        assert_eq!(bank.next_write, 100);
        assert_eq!(bank.next_activate, 100 + cfg.t_rrd);
        assert_eq!(energy, 0);
        assert_eq!(
            SmartMramTiming.column_access_energy(&cfg, BusPacketType::Activate),
            cfg.act_pre_energy()
        );
        // only the first column access after the activate pays it
        assert_eq!(
            SmartMramTiming.column_access_energy(&cfg, BusPacketType::Read),
            0
        );
    }

    #[test]
    fn smart_mram_activate_keeps_bus_reservations() {
        let cfg = MemoryConfig::from_ddr3_1333();
        let mut bank = BankState::default();
        bank.push_next_read(140);
        SmartMramTiming.issue_activate(&cfg, 100, &mut bank, 2);
        assert_eq!(bank.next_read, 140);
    }

    #[test]
    fn precharge_latency_by_technology() {
        let cfg = MemoryConfig::from_ddr3_1333();
        let mut bank = BankState::default();
        bank.current_state = CurrentBankState::RowActive;
        bank.open_row = Some(1);
        DramTiming.issue_precharge(&cfg, 50, &mut bank);
        assert_eq!(bank.current_state, CurrentBankState::Precharging);
        assert_eq!(bank.next_activate, 50 + cfg.t_rp);

        let mut bank = BankState::default();
        bank.current_state = CurrentBankState::RowActive;
        bank.open_row = Some(1);
        SmartMramTiming.issue_precharge(&cfg, 50, &mut bank);
        assert_eq!(bank.current_state, CurrentBankState::Idle);
        assert_eq!(bank.next_activate, 50);
    }
}
