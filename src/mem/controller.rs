//! the memory controller tick loop
//!
//! one `update()` call is exactly one bus-clock cycle, executed in a fixed
//! substep order so every cycle's inputs and outputs are deterministic:
//! bank countdowns, the two bus slots, the write-data fifo, refresh
//! arbitration, one command issue, one transaction decode, low-power
//! transitions, background energy, read-return matching, and finally the
//! per-tick counters.

use std::collections::VecDeque;
use std::sync::Arc;

use itertools::iproduct;
use tracing::debug;

use crate::mem::{
    addressing::AddressMapper,
    bank::{BankTable, CurrentBankState},
    command_queue::CommandQueue,
    config::{MemoryConfig, RowBufferPolicy},
    packet::{BusPacket, BusPacketType, Transaction, TransactionType},
    rank::Rank,
    stats::{BankStats, ControllerStats, EpochStats, RankStats},
    timing::TimingPolicy,
};

pub type ReadCallback = Box<dyn FnMut(usize, u64, u64)>;
pub type WriteCallback = Box<dyn FnMut(usize, u64, u64)>;
/// (background, burst, refresh, actpre) watts for one rank
pub type PowerCallback = Box<dyn FnMut(f64, f64, f64, f64)>;

pub struct MemoryController<P: TimingPolicy> {
    cfg: Arc<MemoryConfig>,
    policy: P,
    channel: usize,
    mapper: AddressMapper,
    bank_table: BankTable,
    command_queue: CommandQueue,

    transaction_queue: VecDeque<Transaction>,
    /// live reads from decode until their DATA packet returns, FIFO per address
    pending_reads: Vec<Transaction>,
    return_queue: VecDeque<Transaction>,
    /// write bursts waiting out their WL countdowns
    write_data: VecDeque<(BusPacket, u64)>,

    outgoing_cmd: Option<(BusPacket, u64)>,
    outgoing_data: Option<(BusPacket, u64)>,

    refresh_countdown: Vec<u64>,
    refresh_rank: usize,
    power_down: Vec<bool>,

    current_cycle: u64,
    stats: ControllerStats,

    read_done: Option<ReadCallback>,
    write_done: Option<WriteCallback>,
    report_power: Option<PowerCallback>,
}

impl<P: TimingPolicy> MemoryController<P> {
    pub fn new(cfg: Arc<MemoryConfig>, policy: P, channel: usize) -> Self {
        let period = cfg.refresh_period_cycles();
        // stagger first refreshes so the ranks never bunch up
        let refresh_countdown = (0..cfg.num_ranks)
            .map(|i| period / cfg.num_ranks as u64 * (i as u64 + 1))
            .collect();
        Self {
            channel,
            mapper: AddressMapper::new(&cfg),
            bank_table: BankTable::new(cfg.num_ranks, cfg.num_banks),
            command_queue: CommandQueue::new(&cfg),
            transaction_queue: VecDeque::with_capacity(cfg.trans_queue_depth),
            pending_reads: Vec::new(),
            return_queue: VecDeque::new(),
            write_data: VecDeque::new(),
            outgoing_cmd: None,
            outgoing_data: None,
            refresh_countdown,
            refresh_rank: 0,
            power_down: vec![false; cfg.num_ranks],
            current_cycle: 0,
            stats: ControllerStats::new(&cfg),
            read_done: None,
            write_done: None,
            report_power: None,
            policy,
            cfg,
        }
    }

    pub fn current_cycle(&self) -> u64 {
        self.current_cycle
    }

    pub fn set_read_callback(&mut self, cb: ReadCallback) {
        self.read_done = Some(cb);
    }

    pub fn set_write_callback(&mut self, cb: WriteCallback) {
        self.write_done = Some(cb);
    }

    pub fn set_power_callback(&mut self, cb: PowerCallback) {
        self.report_power = Some(cb);
    }

    pub fn will_accept_transaction(&self) -> bool {
        self.transaction_queue.len() < self.cfg.trans_queue_depth
    }

    /// admit a client transaction; `false` signals backpressure
    pub fn add_transaction(&mut self, mut trans: Transaction) -> bool {
        debug_assert!(
            trans.transaction_type != TransactionType::ReturnData,
            "clients submit reads and writes only"
        );
        if !self.will_accept_transaction() {
            return false;
        }
        trans.time_added = self.current_cycle;
        self.transaction_queue.push_back(trans);
        true
    }

    /// a DATA packet coming back from a rank over the data bus
    pub fn receive_from_bus(&mut self, pkt: BusPacket) {
        if pkt.packet_type != BusPacketType::Data {
            panic!(
                "controller received a non-DATA packet from a rank at cycle {}: {:?}",
                self.current_cycle, pkt
            );
        }
        self.stats.total_reads_per_bank[pkt.rank][pkt.bank] += 1;
        self.return_queue
            .push_back(Transaction::returned(pkt.physical_address, pkt.payload));
    }

    /// one bus-clock cycle
    pub fn update(&mut self, ranks: &mut [Rank]) {
        let cfg = self.cfg.clone();
        let now = self.current_cycle;

        // 1. bank countdowns and implicit transitions
        self.bank_table.tick(&self.policy, &cfg);

        // 2. command bus in flight
        if let Some((_, left)) = self.outgoing_cmd.as_mut() {
            *left -= 1;
            if *left == 0 {
                let (pkt, _) = self.outgoing_cmd.take().unwrap();
                ranks[pkt.rank].receive_from_bus(pkt);
            }
        }

        // 3. data bus in flight; delivery completes the write
        if let Some((_, left)) = self.outgoing_data.as_mut() {
            *left -= 1;
            if *left == 0 {
                let (pkt, _) = self.outgoing_data.take().unwrap();
                if let Some(cb) = self.write_done.as_mut() {
                    cb(self.channel, pkt.physical_address, now);
                }
                ranks[pkt.rank].receive_from_bus(pkt);
            }
        }

        // 4. write-data fifo: only the head may claim the data bus
        for (_, left) in self.write_data.iter_mut() {
            *left -= 1;
        }
        if let Some((_, 0)) = self.write_data.front() {
            let (pkt, _) = self.write_data.pop_front().unwrap();
            if self.outgoing_data.is_some() {
                panic!("data bus collision at cycle {now}: {pkt:?}");
            }
            debug!(cycle = now, addr = pkt.physical_address, "write burst on data bus");
            self.stats.total_transactions += 1;
            self.stats.total_writes_per_bank[pkt.rank][pkt.bank] += 1;
            self.outgoing_data = Some((pkt, cfg.burst_cycles()));
        }

        // 5. refresh arbitration
        if self.refresh_countdown[self.refresh_rank] == 0 {
            self.command_queue.need_refresh(self.refresh_rank);
            ranks[self.refresh_rank].refresh_waiting = true;
            self.refresh_countdown[self.refresh_rank] = cfg.refresh_period_cycles();
            self.refresh_rank = (self.refresh_rank + 1) % cfg.num_ranks;
        } else if self.power_down[self.refresh_rank]
            && self.refresh_countdown[self.refresh_rank] <= cfg.t_xp
        {
            // wake a sleeping rank early enough to meet its refresh deadline
            ranks[self.refresh_rank].refresh_waiting = true;
        }

        // 6. issue at most one command
        if let Some(pkt) = self.command_queue.pop(&self.bank_table, now) {
            self.issue_command(&cfg, now, pkt);
        }

        // 7. admit one transaction into the command queue
        self.decode_one_transaction(&cfg, now);

        // 8. low-power transitions
        if cfg.use_low_power {
            self.low_power_transitions(&cfg, now, ranks);
        }

        // 9. background energy, per rank
        for rank in 0..cfg.num_ranks {
            let idd = if self.bank_table.any_bank_open(rank) {
                cfg.idd3n
            } else if self.power_down[rank] {
                cfg.idd2p
            } else {
                cfg.idd2n
            };
            self.stats.background_energy[rank] += idd * cfg.num_devices;
        }

        // 10. hand one returning read back to the client
        if let Some(returned) = self.return_queue.pop_front() {
            self.complete_read(now, returned);
        }

        // 11. per-tick counters
        for countdown in self.refresh_countdown.iter_mut() {
            *countdown = countdown.saturating_sub(1);
        }
        self.command_queue.step();
        self.current_cycle += 1;
    }

    fn issue_command(&mut self, cfg: &MemoryConfig, now: u64, pkt: BusPacket) {
        let (rank, bank) = (pkt.rank, pkt.bank);
        match pkt.packet_type {
            BusPacketType::Read | BusPacketType::ReadP => {
                // a row-buffer hit never saw an ACTIVATE; stamp it here
                self.tag_pending_read(now, pkt.physical_address, true);
                let previous = self.bank_table.get(rank, bank).last_command;
                self.stats.actpre_energy[rank] +=
                    self.policy.column_access_energy(cfg, previous);
                self.stats.burst_energy[rank] +=
                    (cfg.idd4r - cfg.idd3n) * cfg.burst_cycles() * cfg.num_devices;

                let state = self.bank_table.get_mut(rank, bank);
                if pkt.packet_type == BusPacketType::ReadP {
                    state.push_next_activate(now + cfg.read_autopre_delay());
                    state.last_command = BusPacketType::ReadP;
                    state.state_change_countdown = cfg.read_to_pre_delay();
                } else {
                    state.push_next_precharge(now + cfg.read_to_pre_delay());
                    state.last_command = BusPacketType::Read;
                }

                for (i, j) in iproduct!(0..cfg.num_ranks, 0..cfg.num_banks) {
                    let other = self.bank_table.get_mut(i, j);
                    if i != rank {
                        if other.current_state == CurrentBankState::RowActive {
                            other.push_next_read(now + cfg.burst_cycles() + cfg.t_rtrs);
                            other.push_next_write(now + cfg.read_to_write_delay());
                        }
                    } else {
                        other.push_next_read(now + cfg.t_ccd.max(cfg.burst_cycles()));
                        other.push_next_write(now + cfg.read_to_write_delay());
                    }
                }

                if pkt.packet_type == BusPacketType::ReadP {
                    // hold column commands off until the implicit precharge
                    // has actually flipped the state machine
                    let state = self.bank_table.get_mut(rank, bank);
                    let next_activate = state.next_activate;
                    state.push_next_read(next_activate);
                    state.push_next_write(next_activate);
                }
            }
            BusPacketType::Write | BusPacketType::WriteP => {
                let previous = self.bank_table.get(rank, bank).last_command;
                self.stats.actpre_energy[rank] +=
                    self.policy.column_access_energy(cfg, previous);
                self.stats.burst_energy[rank] +=
                    (cfg.idd4w - cfg.idd3n) * cfg.burst_cycles() * cfg.num_devices;

                // the burst follows the command after WL
                self.write_data.push_back((BusPacket::data_for(&pkt), cfg.wl));

                let state = self.bank_table.get_mut(rank, bank);
                if pkt.packet_type == BusPacketType::WriteP {
                    state.push_next_activate(now + cfg.write_autopre_delay());
                    state.last_command = BusPacketType::WriteP;
                    state.state_change_countdown = cfg.write_to_pre_delay();
                } else {
                    state.push_next_precharge(now + cfg.write_to_pre_delay());
                    state.last_command = BusPacketType::Write;
                }

                for (i, j) in iproduct!(0..cfg.num_ranks, 0..cfg.num_banks) {
                    let other = self.bank_table.get_mut(i, j);
                    if i != rank {
                        if other.current_state == CurrentBankState::RowActive {
                            other.push_next_write(now + cfg.burst_cycles() + cfg.t_rtrs);
                            other.push_next_read(now + cfg.write_to_read_delay_r());
                        }
                    } else {
                        other.push_next_write(now + cfg.burst_cycles().max(cfg.t_ccd));
                        other.push_next_read(now + cfg.write_to_read_delay_b());
                    }
                }

                if pkt.packet_type == BusPacketType::WriteP {
                    let state = self.bank_table.get_mut(rank, bank);
                    let next_activate = state.next_activate;
                    state.push_next_read(next_activate);
                    state.push_next_write(next_activate);
                }
            }
            BusPacketType::Activate => {
                self.tag_pending_read(now, pkt.physical_address, false);
                let state = self.bank_table.get_mut(rank, bank);
                self.stats.actpre_energy[rank] +=
                    self.policy.issue_activate(cfg, now, state, pkt.row);
                for j in 0..cfg.num_banks {
                    if j != bank {
                        self.bank_table.get_mut(rank, j).push_next_activate(now + cfg.t_rrd);
                    }
                }
            }
            BusPacketType::Precharge => {
                let state = self.bank_table.get_mut(rank, bank);
                self.policy.issue_precharge(cfg, now, state);
            }
            BusPacketType::Refresh => {
                self.stats.refresh_energy[rank] +=
                    (cfg.idd5 - cfg.idd3n) * cfg.t_rfc * cfg.num_devices;
                self.stats.refreshes_issued[rank] += 1;
                for j in 0..cfg.num_banks {
                    let state = self.bank_table.get_mut(rank, j);
                    state.push_next_activate(now + cfg.t_rfc);
                    state.current_state = CurrentBankState::Refreshing;
                    state.last_command = BusPacketType::Refresh;
                    state.state_change_countdown = cfg.t_rfc;
                }
            }
            BusPacketType::Data => {
                panic!("popped a DATA packet from the command queue at cycle {now}: {pkt:?}")
            }
        }

        debug!(cycle = now, ?pkt.packet_type, rank, bank, row = pkt.row, "command on bus");
        if self.outgoing_cmd.is_some() {
            panic!("command bus collision at cycle {now}: {pkt:?}");
        }
        self.outgoing_cmd = Some((pkt, cfg.t_cmd));
    }

    /// stamp `time_act_issued` on the oldest matching pending read.
    /// `first_command_only` limits the stamp to reads that have not seen
    /// their opening command yet (the row-hit path).
    fn tag_pending_read(&mut self, now: u64, address: u64, first_command_only: bool) {
        if let Some(pending) = self
            .pending_reads
            .iter_mut()
            .find(|t| t.address == address && (!first_command_only || t.time_act_issued == 0))
        {
            pending.time_act_issued = now;
        }
    }

    fn decode_one_transaction(&mut self, cfg: &MemoryConfig, now: u64) {
        for i in 0..self.transaction_queue.len() {
            let decoded = self.mapper.map(self.transaction_queue[i].address);
            if !self.command_queue.has_room_for(2, decoded.rank, decoded.bank) {
                continue;
            }
            let transaction = self.transaction_queue.remove(i).unwrap();
            let column_type = match (transaction.transaction_type, cfg.row_buffer_policy) {
                (TransactionType::DataRead, RowBufferPolicy::OpenPage) => BusPacketType::Read,
                (TransactionType::DataRead, RowBufferPolicy::ClosePage) => BusPacketType::ReadP,
                (TransactionType::DataWrite, RowBufferPolicy::OpenPage) => BusPacketType::Write,
                (TransactionType::DataWrite, RowBufferPolicy::ClosePage) => BusPacketType::WriteP,
                (TransactionType::ReturnData, _) => {
                    unreachable!("return transactions never sit in the client queue")
                }
            };
            debug!(
                cycle = now,
                addr = transaction.address,
                rank = decoded.rank,
                bank = decoded.bank,
                row = decoded.row,
                column = decoded.column,
                ?column_type,
                "decoding transaction"
            );
            let activate = BusPacket::new(
                BusPacketType::Activate,
                transaction.address,
                decoded.rank,
                decoded.bank,
                decoded.row,
                decoded.column,
                0,
            );
            let column = BusPacket::new(
                column_type,
                transaction.address,
                decoded.rank,
                decoded.bank,
                decoded.row,
                decoded.column,
                transaction.payload,
            );
            // the pending entry must exist before the commands can be
            // popped, so issue-time stamping finds it
            if transaction.transaction_type == TransactionType::DataRead {
                self.pending_reads.push(transaction);
            }
            self.command_queue.enqueue(activate);
            self.command_queue.enqueue(column);
            // one decode per cycle
            break;
        }
    }

    fn low_power_transitions(&mut self, cfg: &MemoryConfig, now: u64, ranks: &mut [Rank]) {
        for rank in 0..cfg.num_ranks {
            if self.command_queue.is_empty(rank) && !ranks[rank].refresh_waiting {
                if !self.power_down[rank] && self.bank_table.all_idle(rank) {
                    self.power_down[rank] = true;
                    ranks[rank].power_down();
                    for bank in 0..cfg.num_banks {
                        let state = self.bank_table.get_mut(rank, bank);
                        state.current_state = CurrentBankState::PowerDown;
                        state.next_power_up = now + cfg.t_cke;
                    }
                }
            } else if self.power_down[rank]
                && now >= self.bank_table.get(rank, 0).next_power_up
            {
                self.power_down[rank] = false;
                ranks[rank].power_up();
                for bank in 0..cfg.num_banks {
                    let state = self.bank_table.get_mut(rank, bank);
                    state.current_state = CurrentBankState::Idle;
                    state.push_next_activate(now + cfg.t_xp);
                }
            }
        }
    }

    fn complete_read(&mut self, now: u64, returned: Transaction) {
        self.stats.total_transactions += 1;
        let position = self
            .pending_reads
            .iter()
            .position(|t| t.address == returned.address)
            .unwrap_or_else(|| {
                panic!(
                    "no pending read matches returned data for {:#x} at cycle {now}",
                    returned.address
                )
            });
        let pending = self.pending_reads.remove(position);
        let decoded = self.mapper.map(returned.address);
        self.stats
            .insert_total_latency(now - pending.time_added, decoded.rank, decoded.bank);
        self.stats.insert_access_latency(now - pending.time_act_issued);
        debug!(
            cycle = now,
            addr = returned.address,
            latency = now - pending.time_added,
            "read complete"
        );
        if let Some(cb) = self.read_done.as_mut() {
            cb(self.channel, returned.address, now);
        }
    }

    /// convert this epoch's raw counters, fire the power report, and reset
    pub fn collect_epoch(&mut self) -> EpochStats {
        let cfg = &self.cfg;
        let cycles = if self.current_cycle % cfg.epoch_length == 0 {
            cfg.epoch_length
        } else {
            self.current_cycle % cfg.epoch_length
        };
        let bytes = cfg.bytes_per_transaction();
        let seconds = cycles as f64 * cfg.tck * 1e-9;

        let mut epoch = EpochStats {
            channel: self.channel,
            cycles,
            total_transactions: self.stats.total_transactions,
            total_bytes: self.stats.total_transactions * bytes,
            ..Default::default()
        };
        for rank in 0..cfg.num_ranks {
            let mut rank_stats = RankStats {
                background_power_w: EpochStats::power_watts(
                    self.stats.background_energy[rank],
                    cycles,
                    cfg.vdd,
                ),
                burst_power_w: EpochStats::power_watts(self.stats.burst_energy[rank], cycles, cfg.vdd),
                refresh_power_w: EpochStats::power_watts(
                    self.stats.refresh_energy[rank],
                    cycles,
                    cfg.vdd,
                ),
                actpre_power_w: EpochStats::power_watts(self.stats.actpre_energy[rank], cycles, cfg.vdd),
                ..Default::default()
            };
            rank_stats.average_power_w = rank_stats.background_power_w
                + rank_stats.burst_power_w
                + rank_stats.refresh_power_w
                + rank_stats.actpre_power_w;
            for bank in 0..cfg.num_banks {
                let reads = self.stats.total_reads_per_bank[rank][bank];
                let writes = self.stats.total_writes_per_bank[rank][bank];
                rank_stats.reads += reads;
                rank_stats.writes += writes;
                let bandwidth = ((reads + writes) * bytes) as f64
                    / (1024.0 * 1024.0 * 1024.0)
                    / seconds;
                let average_latency_ns = if reads > 0 {
                    self.stats.total_epoch_latency[rank][bank] as f64 / reads as f64 * cfg.tck
                } else {
                    0.0
                };
                epoch.aggregate_bandwidth_gbps += bandwidth;
                rank_stats.banks.push(BankStats {
                    bandwidth_gbps: bandwidth,
                    average_latency_ns,
                    activates: self.command_queue.get_row_buffer_misses(rank, bank),
                    row_hits: self.command_queue.get_row_buffer_hits(rank, bank),
                });
            }
            if let Some(cb) = self.report_power.as_mut() {
                cb(
                    rank_stats.background_power_w,
                    rank_stats.burst_power_w,
                    rank_stats.refresh_power_w,
                    rank_stats.actpre_power_w,
                );
            }
            epoch.ranks.push(rank_stats);
        }
        self.stats.reset_epoch();
        self.command_queue.reset_row_buffer_stats();
        epoch
    }

    // telemetry accessors, mostly for tests and the run summary

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    pub fn pending_reads_len(&self) -> usize {
        self.pending_reads.len()
    }

    pub fn transaction_queue_len(&self) -> usize {
        self.transaction_queue.len()
    }

    pub fn is_rank_powered_down(&self, rank: usize) -> bool {
        self.power_down[rank]
    }

    pub fn refreshes_issued(&self, rank: usize) -> u64 {
        self.stats.refreshes_issued[rank]
    }

    pub fn total_row_buffer_hits(&self) -> u64 {
        iproduct!(0..self.cfg.num_ranks, 0..self.cfg.num_banks)
            .map(|(r, b)| self.command_queue.get_row_buffer_hits(r, b))
            .sum()
    }

    pub fn total_row_buffer_misses(&self) -> u64 {
        iproduct!(0..self.cfg.num_ranks, 0..self.cfg.num_banks)
            .map(|(r, b)| self.command_queue.get_row_buffer_misses(r, b))
            .sum()
    }
}
