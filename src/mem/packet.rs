//! bus packets and client transactions

use enum_as_inner::EnumAsInner;

/// command classes on the command bus, plus DATA for the data bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumAsInner)]
pub enum BusPacketType {
    Read,
    ReadP,
    Write,
    WriteP,
    Activate,
    Precharge,
    Refresh,
    Data,
}

impl BusPacketType {
    /// READ/READ_P/WRITE/WRITE_P: the commands that move a burst over the data bus
    pub fn is_column_command(&self) -> bool {
        matches!(
            self,
            BusPacketType::Read | BusPacketType::ReadP | BusPacketType::Write | BusPacketType::WriteP
        )
    }
}

/// a decoded command travelling between the controller and a rank.
/// owned by whichever queue or bus slot currently holds it.
#[derive(Debug, Clone)]
pub struct BusPacket {
    pub packet_type: BusPacketType,
    pub physical_address: u64,
    pub rank: usize,
    pub bank: usize,
    pub row: u64,
    pub column: u64,
    pub payload: u64,
}

impl BusPacket {
    pub fn new(
        packet_type: BusPacketType,
        physical_address: u64,
        rank: usize,
        bank: usize,
        row: u64,
        column: u64,
        payload: u64,
    ) -> Self {
        Self {
            packet_type,
            physical_address,
            rank,
            bank,
            row,
            column,
            payload,
        }
    }

    /// the write burst that follows a WRITE/WRITE_P command after WL cycles
    pub fn data_for(command: &BusPacket) -> Self {
        Self {
            packet_type: BusPacketType::Data,
            ..command.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumAsInner)]
pub enum TransactionType {
    DataRead,
    DataWrite,
    ReturnData,
}

/// a client request, alive from `add_transaction` until its completion
/// callback (reads) or its data-bus dispatch (writes)
#[derive(Debug, Clone)]
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub address: u64,
    pub payload: u64,
    /// cycle the client handed the transaction to the controller
    pub time_added: u64,
    /// cycle the opening command for this access went on the bus; zero until then
    pub time_act_issued: u64,
}

impl Transaction {
    pub fn read(address: u64) -> Self {
        Self::new(TransactionType::DataRead, address, 0)
    }

    pub fn write(address: u64, payload: u64) -> Self {
        Self::new(TransactionType::DataWrite, address, payload)
    }

    /// built by the controller when a DATA packet comes back from a rank
    pub fn returned(address: u64, payload: u64) -> Self {
        Self::new(TransactionType::ReturnData, address, payload)
    }

    fn new(transaction_type: TransactionType, address: u64, payload: u64) -> Self {
        Self {
            transaction_type,
            address,
            payload,
            time_added: 0,
            time_act_issued: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_packet_keeps_addressing() {
        let write = BusPacket::new(BusPacketType::Write, 0x4000, 1, 3, 17, 5, 0xdead);
        let data = BusPacket::data_for(&write);
        assert_eq!(data.packet_type, BusPacketType::Data);
        assert_eq!(data.rank, 1);
        assert_eq!(data.bank, 3);
        assert_eq!(data.physical_address, 0x4000);
        assert_eq!(data.payload, 0xdead);
    }

    #[test]
    fn column_command_classes() {
        assert!(BusPacketType::ReadP.is_column_command());
        assert!(BusPacketType::Write.is_column_command());
        assert!(!BusPacketType::Activate.is_column_command());
        assert!(!BusPacketType::Data.is_column_command());
    }
}
