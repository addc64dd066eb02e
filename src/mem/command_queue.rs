//! decoded command storage and selection
//!
//! holds the ACTIVATE/column/precharge stream per rank (or per rank and
//! bank) and picks at most one legal command per tick. refresh
//! coordination runs first: queued column work to open rows of the
//! refresh-pending rank is drained, remaining open rows are closed, then
//! the REFRESH itself is injected. the normal path is rank-round-robin,
//! oldest-first, with a same-bank/same-row dependency rule and a tFAW
//! four-activate window per rank.

use std::collections::VecDeque;

use tracing::debug;

use crate::mem::{
    bank::{BankTable, CurrentBankState},
    config::{MemoryConfig, QueueStructure, RowBufferPolicy},
    packet::{BusPacket, BusPacketType},
};

pub struct CommandQueue {
    structure: QueueStructure,
    policy: RowBufferPolicy,
    num_ranks: usize,
    num_banks: usize,
    depth: usize,
    t_faw: u64,
    /// [rank][0] for per-rank partitioning, [rank][bank] otherwise
    queues: Vec<Vec<VecDeque<BusPacket>>>,
    next_rank: usize,
    next_queue: usize,
    refresh_rank: usize,
    refresh_waiting: bool,
    /// cycles left in the rolling four-activate window, per rank
    tfaw_countdown: Vec<VecDeque<u64>>,
    row_buffer_hits: Vec<Vec<u64>>,
    row_buffer_misses: Vec<Vec<u64>>,
}

impl CommandQueue {
    pub fn new(cfg: &MemoryConfig) -> Self {
        let queues_per_rank = match cfg.queue_structure {
            QueueStructure::PerRank => 1,
            QueueStructure::PerRankPerBank => cfg.num_banks,
        };
        Self {
            structure: cfg.queue_structure,
            policy: cfg.row_buffer_policy,
            num_ranks: cfg.num_ranks,
            num_banks: cfg.num_banks,
            depth: cfg.cmd_queue_depth,
            t_faw: cfg.t_faw,
            queues: vec![vec![VecDeque::new(); queues_per_rank]; cfg.num_ranks],
            next_rank: 0,
            next_queue: 0,
            refresh_rank: 0,
            refresh_waiting: false,
            tfaw_countdown: vec![VecDeque::new(); cfg.num_ranks],
            row_buffer_hits: vec![vec![0; cfg.num_banks]; cfg.num_ranks],
            row_buffer_misses: vec![vec![0; cfg.num_banks]; cfg.num_ranks],
        }
    }

    fn queue_index(&self, bank: usize) -> usize {
        match self.structure {
            QueueStructure::PerRank => 0,
            QueueStructure::PerRankPerBank => bank,
        }
    }

    /// gate for admitting a multi-command decode atomically
    pub fn has_room_for(&self, count: usize, rank: usize, bank: usize) -> bool {
        self.queues[rank][self.queue_index(bank)].len() + count <= self.depth
    }

    pub fn enqueue(&mut self, pkt: BusPacket) {
        let qi = self.queue_index(pkt.bank);
        let queue = &mut self.queues[pkt.rank][qi];
        assert!(
            queue.len() < self.depth,
            "command queue overflow, callers must gate with has_room_for: {pkt:?}"
        );
        queue.push_back(pkt);
    }

    pub fn is_empty(&self, rank: usize) -> bool {
        self.queues[rank].iter().all(|queue| queue.is_empty())
    }

    /// force the scheduler to work toward a REFRESH for this rank
    pub fn need_refresh(&mut self, rank: usize) {
        self.refresh_waiting = true;
        self.refresh_rank = rank;
    }

    /// select at most one legal command. callers invoke once per tick.
    pub fn pop(&mut self, banks: &BankTable, now: u64) -> Option<BusPacket> {
        if self.refresh_waiting {
            if let Some(pkt) = self.refresh_progress(banks, now) {
                return Some(pkt);
            }
            // the refresh rank is still draining or settling; other ranks
            // keep going below
        }
        if let Some(pkt) = self.scan_all(banks, now) {
            return Some(pkt);
        }
        if self.policy == RowBufferPolicy::OpenPage {
            return self.find_conflict_precharge(banks, now);
        }
        None
    }

    /// advance the rolling four-activate windows; called once per tick
    pub fn step(&mut self) {
        for rank_window in &mut self.tfaw_countdown {
            for left in rank_window.iter_mut() {
                *left -= 1;
            }
            while rank_window.front() == Some(&0) {
                rank_window.pop_front();
            }
        }
    }

    pub fn get_row_buffer_hits(&self, rank: usize, bank: usize) -> u64 {
        self.row_buffer_hits[rank][bank]
    }

    pub fn get_row_buffer_misses(&self, rank: usize, bank: usize) -> u64 {
        self.row_buffer_misses[rank][bank]
    }

    pub fn reset_row_buffer_stats(&mut self) {
        for row in self.row_buffer_hits.iter_mut().chain(self.row_buffer_misses.iter_mut()) {
            row.iter_mut().for_each(|v| *v = 0);
        }
    }

    // refresh path: drain column work to open rows of the refresh rank,
    // close what remains, then inject the REFRESH packet itself
    fn refresh_progress(&mut self, banks: &BankTable, now: u64) -> Option<BusPacket> {
        let rank = self.refresh_rank;
        if self.policy == RowBufferPolicy::OpenPage {
            for bank in 0..self.num_banks {
                let state = banks.get(rank, bank);
                if state.current_state != CurrentBankState::RowActive {
                    continue;
                }
                let open_row = state.open_row.expect("RowActive bank with no open row");
                if let Some(pkt) = self.pop_column_to_row(banks, now, rank, bank, open_row) {
                    return Some(pkt);
                }
                if now >= state.next_precharge {
                    debug!(rank, bank, row = open_row, "closing row ahead of refresh");
                    return Some(BusPacket::new(
                        BusPacketType::Precharge,
                        0,
                        rank,
                        bank,
                        open_row,
                        0,
                        0,
                    ));
                }
                // not ready to close yet; try again next tick
                return None;
            }
        }
        if banks.refresh_legal(rank, now) {
            self.refresh_waiting = false;
            debug!(rank, "issuing refresh");
            return Some(BusPacket::new(BusPacketType::Refresh, 0, rank, 0, 0, 0, 0));
        }
        None
    }

    /// first queued issuable column command for (rank, bank, row), honoring
    /// the oldest-first dependency rule
    fn pop_column_to_row(
        &mut self,
        banks: &BankTable,
        now: u64,
        rank: usize,
        bank: usize,
        row: u64,
    ) -> Option<BusPacket> {
        let qi = self.queue_index(bank);
        let queue = &self.queues[rank][qi];
        let pos = queue.iter().position(|p| {
            p.bank == bank && p.row == row && p.packet_type.is_column_command()
        })?;
        if !banks.is_legal(&queue[pos], now) || Self::has_dependency(queue, pos) {
            return None;
        }
        Some(self.take(rank, qi, pos))
    }

    fn scan_all(&mut self, banks: &BankTable, now: u64) -> Option<BusPacket> {
        let start = (self.next_rank, self.next_queue);
        loop {
            let (rank, qi) = (self.next_rank, self.next_queue);
            let found = self.scan_queue(banks, now, rank, qi);
            self.advance_round_robin();
            if found.is_some() {
                return found;
            }
            if (self.next_rank, self.next_queue) == start {
                return None;
            }
        }
    }

    fn scan_queue(&mut self, banks: &BankTable, now: u64, rank: usize, qi: usize) -> Option<BusPacket> {
        for i in 0..self.queues[rank][qi].len() {
            let queue = &self.queues[rank][qi];
            let pkt = &queue[i];
            // while a refresh is pending, nothing may re-open rows on that rank
            if self.refresh_waiting
                && pkt.rank == self.refresh_rank
                && pkt.packet_type == BusPacketType::Activate
            {
                continue;
            }
            if pkt.packet_type == BusPacketType::Activate
                && self.tfaw_countdown[pkt.rank].len() >= 4
            {
                continue;
            }
            if !banks.is_legal(pkt, now) {
                continue;
            }
            if Self::has_dependency(queue, i) {
                continue;
            }
            return Some(self.take(rank, qi, i));
        }
        None
    }

    /// an entry may not overtake an older column command to the same bank
    /// and row; pending ACTIVATEs do not order (their pair does)
    fn has_dependency(queue: &VecDeque<BusPacket>, index: usize) -> bool {
        let pkt = &queue[index];
        queue.iter().take(index).any(|earlier| {
            earlier.packet_type != BusPacketType::Activate
                && earlier.bank == pkt.bank
                && earlier.row == pkt.row
        })
    }

    /// remove entry `pos`, record telemetry, and elide the stale paired
    /// ACTIVATE when a column command turned out to be a row hit
    fn take(&mut self, rank: usize, qi: usize, pos: usize) -> BusPacket {
        let pkt = self.queues[rank][qi]
            .remove(pos)
            .expect("take out of bounds");
        match pkt.packet_type {
            BusPacketType::Activate => {
                self.row_buffer_misses[pkt.rank][pkt.bank] += 1;
                self.tfaw_countdown[pkt.rank].push_back(self.t_faw);
            }
            t if t.is_column_command() => {
                if self.policy == RowBufferPolicy::OpenPage {
                    let queue = &mut self.queues[rank][qi];
                    if let Some(act) = queue.iter().position(|p| {
                        p.packet_type == BusPacketType::Activate
                            && p.physical_address == pkt.physical_address
                    }) {
                        queue.remove(act);
                        self.row_buffer_hits[pkt.rank][pkt.bank] += 1;
                        debug!(
                            rank = pkt.rank,
                            bank = pkt.bank,
                            row = pkt.row,
                            "row hit, eliding queued activate"
                        );
                    }
                }
            }
            _ => {}
        }
        pkt
    }

    /// nothing was issuable: close an open row with no queued same-row
    /// work so a blocked ACTIVATE can land
    fn find_conflict_precharge(&mut self, banks: &BankTable, now: u64) -> Option<BusPacket> {
        for rank in 0..self.num_ranks {
            if self.refresh_waiting && rank == self.refresh_rank {
                continue;
            }
            for bank in 0..self.num_banks {
                let state = banks.get(rank, bank);
                if state.current_state != CurrentBankState::RowActive || now < state.next_precharge
                {
                    continue;
                }
                let open_row = state.open_row.expect("RowActive bank with no open row");
                let qi = self.queue_index(bank);
                let pending_same_row = self.queues[rank][qi].iter().any(|p| {
                    p.bank == bank && p.row == open_row && p.packet_type.is_column_command()
                });
                if !pending_same_row {
                    return Some(BusPacket::new(
                        BusPacketType::Precharge,
                        0,
                        rank,
                        bank,
                        open_row,
                        0,
                        0,
                    ));
                }
            }
        }
        None
    }

    fn advance_round_robin(&mut self) {
        self.next_queue += 1;
        if self.next_queue >= self.queues[self.next_rank].len() {
            self.next_queue = 0;
            self.next_rank = (self.next_rank + 1) % self.num_ranks;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::bank::BankTable;

    fn cfg() -> MemoryConfig {
        MemoryConfig::from_ddr3_1333()
    }

    fn act(addr: u64, bank: usize, row: u64) -> BusPacket {
        BusPacket::new(BusPacketType::Activate, addr, 0, bank, row, 0, 0)
    }

    fn read(addr: u64, bank: usize, row: u64) -> BusPacket {
        BusPacket::new(BusPacketType::Read, addr, 0, bank, row, 0, 0)
    }

    #[test]
    fn room_gate_is_exact() {
        let mut cfg = cfg();
        cfg.cmd_queue_depth = 2;
        let mut queue = CommandQueue::new(&cfg);
        assert!(queue.has_room_for(2, 0, 0));
        queue.enqueue(act(0, 0, 0));
        assert!(!queue.has_room_for(2, 0, 0));
        assert!(queue.has_room_for(1, 0, 0));
    }

    #[test]
    #[should_panic(expected = "command queue overflow")]
    fn enqueue_past_depth_aborts() {
        let mut cfg = cfg();
        cfg.cmd_queue_depth = 1;
        let mut queue = CommandQueue::new(&cfg);
        queue.enqueue(act(0, 0, 0));
        queue.enqueue(read(0, 0, 0));
    }

    #[test]
    fn cold_bank_pops_activate_first() {
        let cfg = cfg();
        let mut queue = CommandQueue::new(&cfg);
        let banks = BankTable::new(cfg.num_ranks, cfg.num_banks);
        queue.enqueue(act(0x40, 0, 5));
        queue.enqueue(read(0x40, 0, 5));
        let pkt = queue.pop(&banks, 0).unwrap();
        assert_eq!(pkt.packet_type, BusPacketType::Activate);
        assert_eq!(queue.get_row_buffer_misses(0, 0), 1);
        // read is not legal until the bank actually opens
        assert!(queue.pop(&banks, 1).is_none());
    }

    #[test]
    fn row_hit_elides_queued_activate() {
        let cfg = cfg();
        let mut queue = CommandQueue::new(&cfg);
        let mut banks = BankTable::new(cfg.num_ranks, cfg.num_banks);
        let bank = banks.get_mut(0, 0);
        bank.current_state = CurrentBankState::RowActive;
        bank.open_row = Some(5);
        queue.enqueue(act(0x40, 0, 5));
        queue.enqueue(read(0x40, 0, 5));
        let pkt = queue.pop(&banks, 10).unwrap();
        assert_eq!(pkt.packet_type, BusPacketType::Read);
        assert_eq!(queue.get_row_buffer_hits(0, 0), 1);
        assert!(queue.is_empty(0), "paired activate must be gone");
    }

    #[test]
    fn reads_to_same_row_stay_ordered() {
        let cfg = cfg();
        let mut queue = CommandQueue::new(&cfg);
        let mut banks = BankTable::new(cfg.num_ranks, cfg.num_banks);
        let bank = banks.get_mut(0, 0);
        bank.current_state = CurrentBankState::RowActive;
        bank.open_row = Some(5);
        queue.enqueue(read(0x40, 0, 5));
        queue.enqueue(read(0x80, 0, 5));
        let first = queue.pop(&banks, 10).unwrap();
        assert_eq!(first.physical_address, 0x40);
        let second = queue.pop(&banks, 11).unwrap();
        assert_eq!(second.physical_address, 0x80);
    }

    #[test]
    fn four_activate_window_blocks_fifth() {
        let mut cfg = cfg();
        cfg.num_banks = 8;
        cfg.queue_structure = QueueStructure::PerRank;
        let mut queue = CommandQueue::new(&cfg);
        let banks = BankTable::new(cfg.num_ranks, cfg.num_banks);
        for bank in 0..5 {
            queue.enqueue(act(bank as u64 * 0x10000, bank, 1));
        }
        for now in 0..4 {
            let pkt = queue.pop(&banks, now).unwrap();
            assert_eq!(pkt.packet_type, BusPacketType::Activate);
        }
        // fifth activate held back by the rolling window
        assert!(queue.pop(&banks, 4).is_none());
        for _ in 0..cfg.t_faw {
            queue.step();
        }
        assert!(queue.pop(&banks, 4 + cfg.t_faw).is_some());
    }

    #[test]
    fn refresh_closes_open_row_then_issues() {
        let cfg = cfg();
        let mut queue = CommandQueue::new(&cfg);
        let mut banks = BankTable::new(cfg.num_ranks, cfg.num_banks);
        let bank = banks.get_mut(0, 2);
        bank.current_state = CurrentBankState::RowActive;
        bank.open_row = Some(9);
        queue.need_refresh(0);
        let pkt = queue.pop(&banks, 100).unwrap();
        assert_eq!(pkt.packet_type, BusPacketType::Precharge);
        assert_eq!(pkt.bank, 2);
        // once every bank is idle the refresh itself goes out
        let bank = banks.get_mut(0, 2);
        bank.current_state = CurrentBankState::Idle;
        bank.open_row = None;
        let pkt = queue.pop(&banks, 101).unwrap();
        assert_eq!(pkt.packet_type, BusPacketType::Refresh);
        // and the pending flag clears
        assert!(queue.pop(&banks, 102).is_none());
    }

    #[test]
    fn refresh_blocks_new_activates_on_that_rank() {
        let cfg = cfg();
        let mut queue = CommandQueue::new(&cfg);
        let mut banks = BankTable::new(cfg.num_ranks, cfg.num_banks);
        // a bank still precharging keeps refresh waiting
        let bank = banks.get_mut(0, 0);
        bank.current_state = CurrentBankState::Precharging;
        bank.state_change_countdown = 5;
        queue.need_refresh(0);
        queue.enqueue(act(0x40, 1, 3));
        assert!(queue.pop(&banks, 50).is_none());
    }

    #[test]
    fn conflict_precharge_for_blocked_activate() {
        let cfg = cfg();
        let mut queue = CommandQueue::new(&cfg);
        let mut banks = BankTable::new(cfg.num_ranks, cfg.num_banks);
        let bank = banks.get_mut(0, 0);
        bank.current_state = CurrentBankState::RowActive;
        bank.open_row = Some(5);
        // queued work wants row 6 of the same bank
        queue.enqueue(act(0x1000, 0, 6));
        queue.enqueue(read(0x1000, 0, 6));
        let pkt = queue.pop(&banks, 50).unwrap();
        assert_eq!(pkt.packet_type, BusPacketType::Precharge);
        assert_eq!(pkt.row, 5);
    }
}
