//! physical address decomposition
//!
//! pure bit-slicing of a 64-bit physical address into the addressing
//! hierarchy. the low bits covering one transaction's bytes are discarded
//! first, then fields are peeled off least-significant first in the
//! reverse of the scheme's msb-to-lsb order.

use crate::mem::config::{AddressMappingScheme, MemoryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAddress {
    pub channel: usize,
    pub rank: usize,
    pub bank: usize,
    pub row: u64,
    pub column: u64,
}

#[derive(Debug, Clone)]
pub struct AddressMapper {
    scheme: AddressMappingScheme,
    chan_bits: u32,
    rank_bits: u32,
    bank_bits: u32,
    row_bits: u32,
    col_bits: u32,
    offset_bits: u32,
}

fn field_bits(count: u64) -> u32 {
    debug_assert!(count.is_power_of_two(), "geometry counts must be powers of two: {count}");
    count.trailing_zeros()
}

fn take(addr: &mut u64, bits: u32) -> u64 {
    let value = *addr & ((1u64 << bits) - 1);
    *addr >>= bits;
    value
}

impl AddressMapper {
    pub fn new(cfg: &MemoryConfig) -> Self {
        Self {
            scheme: cfg.address_scheme,
            chan_bits: field_bits(cfg.num_channels as u64),
            rank_bits: field_bits(cfg.num_ranks as u64),
            bank_bits: field_bits(cfg.num_banks as u64),
            row_bits: field_bits(cfg.num_rows as u64),
            col_bits: field_bits(cfg.num_cols as u64),
            offset_bits: field_bits(cfg.bytes_per_transaction()),
        }
    }

    pub fn map(&self, address: u64) -> DecodedAddress {
        let mut addr = address >> self.offset_bits;
        let (channel, rank, bank, row, column);
        match self.scheme {
            AddressMappingScheme::RowBankRankColChan => {
                channel = take(&mut addr, self.chan_bits);
                column = take(&mut addr, self.col_bits);
                rank = take(&mut addr, self.rank_bits);
                bank = take(&mut addr, self.bank_bits);
                row = take(&mut addr, self.row_bits);
            }
            AddressMappingScheme::RowColRankBankChan => {
                channel = take(&mut addr, self.chan_bits);
                bank = take(&mut addr, self.bank_bits);
                rank = take(&mut addr, self.rank_bits);
                column = take(&mut addr, self.col_bits);
                row = take(&mut addr, self.row_bits);
            }
            AddressMappingScheme::ChanRankBankRowCol => {
                column = take(&mut addr, self.col_bits);
                row = take(&mut addr, self.row_bits);
                bank = take(&mut addr, self.bank_bits);
                rank = take(&mut addr, self.rank_bits);
                channel = take(&mut addr, self.chan_bits);
            }
        }
        DecodedAddress {
            channel: channel as usize,
            rank: rank as usize,
            bank: bank as usize,
            row,
            column,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(scheme: AddressMappingScheme) -> AddressMapper {
        let mut cfg = MemoryConfig::from_ddr3_1333();
        cfg.address_scheme = scheme;
        AddressMapper::new(&cfg)
    }

    #[test]
    fn offset_bits_are_discarded() {
        let m = mapper(AddressMappingScheme::RowBankRankColChan);
        // 64-byte transactions: addresses within one burst map identically
        assert_eq!(m.map(0x1000), m.map(0x1004));
        assert_ne!(m.map(0x1000), m.map(0x1040));
    }

    #[test]
    fn row_bank_rank_col_layout() {
        let m = mapper(AddressMappingScheme::RowBankRankColChan);
        // one rank, 8 banks, 1024 cols, 64B offset: bank bits sit above 16 col+offset bits
        let d = m.map(3 << 16);
        assert_eq!(d.bank, 3);
        assert_eq!(d.row, 0);
        let d = m.map(5u64 << 19);
        assert_eq!(d.row, 5);
        assert_eq!(d.bank, 0);
    }

    #[test]
    fn chan_rank_bank_row_col_layout() {
        let m = mapper(AddressMappingScheme::ChanRankBankRowCol);
        let d = m.map(7u64 << (6 + 10 + 15));
        assert_eq!(d.bank, 7);
        let d = m.map(42u64 << (6 + 10));
        assert_eq!(d.row, 42);
    }

    #[test]
    fn deterministic() {
        let m = mapper(AddressMappingScheme::RowColRankBankChan);
        assert_eq!(m.map(0xdead_beef), m.map(0xdead_beef));
    }
}
