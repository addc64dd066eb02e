//! per-bank protocol state and the legality predicate

use enum_as_inner::EnumAsInner;

use crate::mem::{
    config::MemoryConfig,
    packet::{BusPacket, BusPacketType},
    timing::TimingPolicy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumAsInner)]
pub enum CurrentBankState {
    #[default]
    Idle,
    RowActive,
    Precharging,
    Refreshing,
    PowerDown,
}

/// one cell of the ranks x banks state grid.
///
/// `next_*` hold the earliest cycle each command class is permitted; they
/// only ever move forward (max-merge), so repeated pushes are idempotent.
#[derive(Debug, Clone)]
pub struct BankState {
    pub current_state: CurrentBankState,
    pub open_row: Option<u64>,
    /// most recent command class that transitioned this bank
    pub last_command: BusPacketType,
    /// cycles until an implicit transition fires (end of tRP, tRFC, ...)
    pub state_change_countdown: u64,
    pub next_activate: u64,
    pub next_read: u64,
    pub next_write: u64,
    pub next_precharge: u64,
    pub next_power_up: u64,
}

impl Default for BankState {
    fn default() -> Self {
        Self {
            current_state: CurrentBankState::Idle,
            open_row: None,
            last_command: BusPacketType::Precharge,
            state_change_countdown: 0,
            next_activate: 0,
            next_read: 0,
            next_write: 0,
            next_precharge: 0,
            next_power_up: 0,
        }
    }
}

impl BankState {
    pub fn push_next_activate(&mut self, cycle: u64) {
        self.next_activate = self.next_activate.max(cycle);
    }

    pub fn push_next_read(&mut self, cycle: u64) {
        self.next_read = self.next_read.max(cycle);
    }

    pub fn push_next_write(&mut self, cycle: u64) {
        self.next_write = self.next_write.max(cycle);
    }

    pub fn push_next_precharge(&mut self, cycle: u64) {
        self.next_precharge = self.next_precharge.max(cycle);
    }

    pub fn is_row_open(&self, row: u64) -> bool {
        self.current_state == CurrentBankState::RowActive && self.open_row == Some(row)
    }
}

/// the ranks x banks grid: source of truth for protocol legality and the
/// implicit-state-transition clock
#[derive(Debug)]
pub struct BankTable {
    num_ranks: usize,
    num_banks: usize,
    states: Vec<Vec<BankState>>,
}

impl BankTable {
    pub fn new(num_ranks: usize, num_banks: usize) -> Self {
        Self {
            num_ranks,
            num_banks,
            states: vec![vec![BankState::default(); num_banks]; num_ranks],
        }
    }

    pub fn get(&self, rank: usize, bank: usize) -> &BankState {
        &self.states[rank][bank]
    }

    pub fn get_mut(&mut self, rank: usize, bank: usize) -> &mut BankState {
        &mut self.states[rank][bank]
    }

    /// `true` iff the bank's state machine and its earliest-legal-cycle
    /// stamps both permit the command right now. cross-bank constraints
    /// (tFAW) are the command queue's job.
    pub fn is_legal(&self, pkt: &BusPacket, now: u64) -> bool {
        let bank = &self.states[pkt.rank][pkt.bank];
        match pkt.packet_type {
            BusPacketType::Activate => {
                bank.current_state == CurrentBankState::Idle && now >= bank.next_activate
            }
            BusPacketType::Read | BusPacketType::ReadP => {
                bank.is_row_open(pkt.row) && now >= bank.next_read
            }
            BusPacketType::Write | BusPacketType::WriteP => {
                bank.is_row_open(pkt.row) && now >= bank.next_write
            }
            BusPacketType::Precharge => {
                bank.current_state == CurrentBankState::RowActive && now >= bank.next_precharge
            }
            BusPacketType::Refresh => self.refresh_legal(pkt.rank, now),
            BusPacketType::Data => false,
        }
    }

    /// REFRESH needs every bank of the rank closed and past its nextActivate
    pub fn refresh_legal(&self, rank: usize, now: u64) -> bool {
        self.states[rank]
            .iter()
            .all(|bank| bank.current_state.is_idle() && now >= bank.next_activate)
    }

    pub fn all_idle(&self, rank: usize) -> bool {
        self.states[rank].iter().all(|bank| bank.current_state.is_idle())
    }

    /// a RowActive or Refreshing bank keeps the rank in the active-standby
    /// current (IDD3N) for background-energy purposes
    pub fn any_bank_open(&self, rank: usize) -> bool {
        self.states[rank].iter().any(|bank| {
            matches!(
                bank.current_state,
                CurrentBankState::RowActive | CurrentBankState::Refreshing
            )
        })
    }

    /// the tick's opening phase: decrement every armed countdown and apply
    /// the implicit transition derived from the bank's last command
    pub fn tick<P: TimingPolicy>(&mut self, policy: &P, cfg: &MemoryConfig) {
        for rank in 0..self.num_ranks {
            for bank in 0..self.num_banks {
                let state = &mut self.states[rank][bank];
                if state.state_change_countdown == 0 {
                    continue;
                }
                state.state_change_countdown -= 1;
                if state.state_change_countdown > 0 {
                    continue;
                }
                match state.last_command {
                    BusPacketType::ReadP | BusPacketType::WriteP => {
                        policy.finish_auto_precharge(cfg, state);
                    }
                    BusPacketType::Refresh | BusPacketType::Precharge => {
                        state.current_state = CurrentBankState::Idle;
                        state.open_row = None;
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::timing::{DramTiming, SmartMramTiming};

    fn read_pkt(rank: usize, bank: usize, row: u64) -> BusPacket {
        BusPacket::new(BusPacketType::Read, 0, rank, bank, row, 0, 0)
    }

    #[test]
    fn next_cycle_merge_is_idempotent() {
        let mut bank = BankState::default();
        bank.push_next_activate(40);
        bank.push_next_activate(40);
        assert_eq!(bank.next_activate, 40);
        bank.push_next_activate(12);
        assert_eq!(bank.next_activate, 40);
    }

    #[test]
    fn read_requires_matching_open_row() {
        let mut table = BankTable::new(1, 2);
        assert!(!table.is_legal(&read_pkt(0, 0, 7), 100));
        let bank = table.get_mut(0, 0);
        bank.current_state = CurrentBankState::RowActive;
        bank.open_row = Some(7);
        assert!(table.is_legal(&read_pkt(0, 0, 7), 100));
        assert!(!table.is_legal(&read_pkt(0, 0, 8), 100));
        table.get_mut(0, 0).push_next_read(200);
        assert!(!table.is_legal(&read_pkt(0, 0, 7), 100));
    }

    #[test]
    fn precharge_countdown_closes_bank() {
        let cfg = MemoryConfig::from_ddr3_1333();
        let mut table = BankTable::new(1, 1);
        let bank = table.get_mut(0, 0);
        bank.current_state = CurrentBankState::Precharging;
        bank.last_command = BusPacketType::Precharge;
        bank.state_change_countdown = 2;
        table.tick(&DramTiming, &cfg);
        assert_eq!(table.get(0, 0).current_state, CurrentBankState::Precharging);
        table.tick(&DramTiming, &cfg);
        assert_eq!(table.get(0, 0).current_state, CurrentBankState::Idle);
    }

    #[test]
    fn auto_precharge_dram_vs_smart_mram() {
        let cfg = MemoryConfig::from_ddr3_1333();
        let mut table = BankTable::new(1, 1);
        let bank = table.get_mut(0, 0);
        bank.current_state = CurrentBankState::RowActive;
        bank.open_row = Some(3);
        bank.last_command = BusPacketType::ReadP;
        bank.state_change_countdown = 1;
        table.tick(&DramTiming, &cfg);
        // dram restores the cells first: tRP precharging phase
        assert_eq!(table.get(0, 0).current_state, CurrentBankState::Precharging);
        assert_eq!(table.get(0, 0).state_change_countdown, cfg.t_rp);

        let mut table = BankTable::new(1, 1);
        let bank = table.get_mut(0, 0);
        bank.current_state = CurrentBankState::RowActive;
        bank.open_row = Some(3);
        bank.last_command = BusPacketType::WriteP;
        bank.state_change_countdown = 1;
        table.tick(&SmartMramTiming, &cfg);
        // no restore phase: straight to idle
        assert_eq!(table.get(0, 0).current_state, CurrentBankState::Idle);
        assert_eq!(table.get(0, 0).state_change_countdown, 0);
        assert_eq!(table.get(0, 0).open_row, None);
    }

    #[test]
    fn refresh_legality_needs_whole_rank_idle() {
        let mut table = BankTable::new(1, 2);
        assert!(table.refresh_legal(0, 0));
        table.get_mut(0, 1).current_state = CurrentBankState::RowActive;
        assert!(!table.refresh_legal(0, 0));
        table.get_mut(0, 1).current_state = CurrentBankState::Idle;
        table.get_mut(0, 0).push_next_activate(50);
        assert!(!table.refresh_legal(0, 49));
        assert!(table.refresh_legal(0, 50));
    }
}
