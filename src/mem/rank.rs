//! the rank device model
//!
//! consumes commands off the bus and, for reads, produces the DATA packet
//! RL + BL/2 cycles later. the system moves matured packets back into the
//! controller; the rank never holds a reference to it.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::mem::{
    config::MemoryConfig,
    packet::{BusPacket, BusPacketType},
};

pub struct Rank {
    id: usize,
    cfg: Arc<MemoryConfig>,
    /// set by the controller when this rank must wake for a refresh
    pub refresh_waiting: bool,
    powered_down: bool,
    /// (DATA packet, cycles until it lands back at the controller)
    read_returns: VecDeque<(BusPacket, u64)>,
}

impl Rank {
    pub fn new(id: usize, cfg: Arc<MemoryConfig>) -> Self {
        Self {
            id,
            cfg,
            refresh_waiting: false,
            powered_down: false,
            read_returns: VecDeque::new(),
        }
    }

    pub fn receive_from_bus(&mut self, pkt: BusPacket) {
        assert!(
            !self.powered_down || pkt.packet_type == BusPacketType::Refresh,
            "rank {} received {:?} while powered down",
            self.id,
            pkt.packet_type
        );
        match pkt.packet_type {
            BusPacketType::Read | BusPacketType::ReadP => {
                let latency = self.cfg.read_latency() + self.cfg.burst_cycles();
                debug!(rank = self.id, row = pkt.row, column = pkt.column, "read burst scheduled");
                self.read_returns.push_back((BusPacket::data_for(&pkt), latency));
            }
            // the write burst arrives separately as DATA; the column command
            // and the burst itself are both sinks for an opaque payload
            BusPacketType::Write | BusPacketType::WriteP | BusPacketType::Data => {}
            BusPacketType::Activate | BusPacketType::Precharge => {}
            BusPacketType::Refresh => {
                self.refresh_waiting = false;
            }
        }
    }

    pub fn power_down(&mut self) {
        assert!(
            self.read_returns.is_empty(),
            "rank {} powered down with {} read returns in flight",
            self.id,
            self.read_returns.len()
        );
        debug!(rank = self.id, "entering power-down");
        self.powered_down = true;
    }

    pub fn power_up(&mut self) {
        debug!(rank = self.id, "waking from power-down");
        self.powered_down = false;
    }

    pub fn is_powered_down(&self) -> bool {
        self.powered_down
    }

    /// one device tick: age the in-flight bursts, surface at most one
    /// matured DATA packet for the controller
    pub fn update(&mut self) -> Option<BusPacket> {
        for (_, left) in self.read_returns.iter_mut() {
            *left = left.saturating_sub(1);
        }
        if let Some((_, 0)) = self.read_returns.front() {
            return self.read_returns.pop_front().map(|(pkt, _)| pkt);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rank() -> Rank {
        Rank::new(0, Arc::new(MemoryConfig::from_ddr3_1333()))
    }

    #[test]
    fn read_returns_after_rl_plus_burst() {
        let mut r = rank();
        let cfg = MemoryConfig::from_ddr3_1333();
        r.receive_from_bus(BusPacket::new(BusPacketType::Read, 0x80, 0, 1, 2, 3, 0));
        let wait = cfg.read_latency() + cfg.burst_cycles();
        for _ in 0..wait - 1 {
            assert!(r.update().is_none());
        }
        let data = r.update().expect("burst due");
        assert_eq!(data.packet_type, BusPacketType::Data);
        assert_eq!(data.physical_address, 0x80);
    }

    #[test]
    fn returns_stay_fifo() {
        let mut r = rank();
        r.receive_from_bus(BusPacket::new(BusPacketType::Read, 0x40, 0, 0, 0, 0, 0));
        r.update();
        r.receive_from_bus(BusPacket::new(BusPacketType::ReadP, 0x80, 0, 0, 0, 4, 0));
        let mut out = vec![];
        for _ in 0..40 {
            if let Some(pkt) = r.update() {
                out.push(pkt.physical_address);
            }
        }
        assert_eq!(out, vec![0x40, 0x80]);
    }

    #[test]
    #[should_panic(expected = "powered down")]
    fn commands_to_sleeping_rank_abort() {
        let mut r = rank();
        r.power_down();
        r.receive_from_bus(BusPacket::new(BusPacketType::Activate, 0, 0, 0, 0, 0, 0));
    }

    #[test]
    fn refresh_clears_waiting_flag() {
        let mut r = rank();
        r.refresh_waiting = true;
        r.receive_from_bus(BusPacket::new(BusPacketType::Refresh, 0, 0, 0, 0, 0, 0));
        assert!(!r.refresh_waiting);
    }
}
