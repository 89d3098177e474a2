//! FIFO RAM partitioning
//!
//! The core shares one block of FIFO RAM between a common RX FIFO and one TX
//! FIFO per IN endpoint. Regions are packed back to back in the order
//! RX, TX0, TX1, ... so growing any region moves every region after it; the
//! whole layout is reprogrammed and both FIFO directions are flushed after
//! each change.

use crate::error::{Result, UsbError};
use crate::otg::{self, GrstCtl, RegisterBlock};
use crate::timing::PollBudget;
use heapless::Vec;

/// Minimum TX FIFO depth in words
pub const MIN_TX_FIFO_WORDS: u16 = 16;

/// Maximum number of TX FIFOs including FIFO 0
pub const MAX_TX_FIFOS: usize = 16;

/// RX FIFO overhead for SETUP packets, global OUT NAK and per-endpoint
/// transfer-complete status words
pub const fn rx_overhead_words(out_endpoints: u8) -> u16 {
    10 + 1 + 2 * (out_endpoints as u16 + 1)
}

/// FIFO depth for one endpoint: whole words per packet times the buffering
/// multiplier, at least [`MIN_TX_FIFO_WORDS`] for TX
pub const fn depth_words(max_packet_size: u16, buffering: u8, is_tx: bool) -> u16 {
    let multiplier = if buffering == 0 { 1 } else { buffering as u16 };
    let words = ((max_packet_size + 3) / 4) * multiplier;
    if is_tx && words < MIN_TX_FIFO_WORDS {
        MIN_TX_FIFO_WORDS
    } else {
        words
    }
}

/// Running FIFO allocation for device mode
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FifoAllocator {
    pool_words: u16,
    rx_words: u16,
    tx_words: Vec<u16, MAX_TX_FIFOS>,
}

impl FifoAllocator {
    /// Empty layout with the RX overhead reserved
    pub fn new(pool_words: u16, out_endpoints: u8) -> Self {
        Self {
            pool_words,
            rx_words: rx_overhead_words(out_endpoints),
            tx_words: Vec::new(),
        }
    }

    /// Words given to the shared RX FIFO
    pub fn rx_words(&self) -> u16 {
        self.rx_words
    }

    /// Depth of TX FIFO `fifo`
    pub fn tx_words(&self, fifo: u8) -> Option<u16> {
        self.tx_words.get(fifo as usize).copied()
    }

    /// TX FIFOs allocated, TX0 included
    pub fn tx_fifo_count(&self) -> usize {
        self.tx_words.len()
    }

    /// Words currently committed
    pub fn total_words(&self) -> u32 {
        self.rx_words as u32 + self.tx_words.iter().map(|w| *w as u32).sum::<u32>()
    }

    /// Size of the FIFO RAM pool in words
    pub fn pool_words(&self) -> u16 {
        self.pool_words
    }

    /// Grow the RX FIFO for an OUT endpoint
    ///
    /// Leaves the layout untouched on failure.
    pub fn add_rx(&mut self, max_packet_size: u16, buffering: u8) -> Result<u16> {
        let depth = depth_words(max_packet_size, buffering, false);
        if self.total_words() + depth as u32 > self.pool_words as u32 {
            return Err(UsbError::IllegalOperation);
        }
        self.rx_words += depth;
        Ok(depth)
    }

    /// Append a TX FIFO for an IN endpoint, returning its FIFO number and
    /// depth
    ///
    /// Leaves the layout untouched on failure.
    pub fn add_tx(&mut self, max_packet_size: u16, buffering: u8) -> Result<(u8, u16)> {
        let depth = depth_words(max_packet_size, buffering, true);
        if self.total_words() + depth as u32 > self.pool_words as u32 {
            return Err(UsbError::IllegalOperation);
        }
        self.tx_words.push(depth).map_err(|_| UsbError::IllegalOperation)?;
        Ok(((self.tx_words.len() - 1) as u8, depth))
    }

    /// Start address (in words) of TX FIFO `fifo`
    pub fn tx_start(&self, fifo: u8) -> u16 {
        self.rx_words + self.tx_words.iter().take(fifo as usize).sum::<u16>()
    }

    /// Write the layout to the FIFO size registers, then flush both FIFO
    /// directions
    ///
    /// Returns `false` if a flush did not finish within the budget.
    pub fn program<R: RegisterBlock>(&self, regs: &R, budget: u32) -> bool {
        regs.write(otg::GRXFSIZ, self.rx_words as u32);
        for (fifo, depth) in self.tx_words.iter().enumerate() {
            let start = self.tx_start(fifo as u8) as u32;
            let value = ((*depth as u32) << 16) | start;
            if fifo == 0 {
                regs.write(otg::GNPTXFSIZ, value);
            } else {
                regs.write(otg::dieptxf(fifo), value);
            }
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("FIFO layout: rx={} tx={} total={}/{}",
                      self.rx_words, self.tx_words.as_slice(), self.total_words(), self.pool_words);

        let tx = flush_tx_fifo(regs, GrstCtl::TXFNUM_ALL.bits() >> 6, budget);
        let rx = flush_rx_fifo(regs, budget);
        tx && rx
    }
}

/// Flush TX FIFO `fifo` (0x10 flushes all)
pub fn flush_tx_fifo<R: RegisterBlock>(regs: &R, fifo: u32, budget: u32) -> bool {
    regs.write(otg::GRSTCTL, GrstCtl::TXFFLSH.bits() | GrstCtl::txfnum(fifo));
    let done = PollBudget::new(budget).wait(|| regs.read(otg::GRSTCTL) & GrstCtl::TXFFLSH.bits() == 0);

    #[cfg(feature = "defmt")]
    if !done {
        defmt::warn!("TX FIFO {} flush timed out", fifo);
    }

    done
}

/// Flush the shared RX FIFO
pub fn flush_rx_fifo<R: RegisterBlock>(regs: &R, budget: u32) -> bool {
    regs.write(otg::GRSTCTL, GrstCtl::RXFFLSH.bits());
    let done = PollBudget::new(budget).wait(|| regs.read(otg::GRSTCTL) & GrstCtl::RXFFLSH.bits() == 0);

    #[cfg(feature = "defmt")]
    if !done {
        defmt::warn!("RX FIFO flush timed out");
    }

    done
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_rounding() {
        assert_eq!(depth_words(64, 1, false), 16);
        assert_eq!(depth_words(63, 1, false), 16);
        assert_eq!(depth_words(8, 1, false), 2);
        assert_eq!(depth_words(8, 1, true), MIN_TX_FIFO_WORDS);
        assert_eq!(depth_words(64, 2, true), 32);
        assert_eq!(depth_words(64, 0, true), 16);
    }

    #[test]
    fn test_rx_overhead() {
        assert_eq!(rx_overhead_words(6), 25);
    }

    #[test]
    fn test_tx_layout_is_contiguous() {
        let mut fifo = FifoAllocator::new(512, 6);
        let (n0, d0) = fifo.add_tx(64, 1).unwrap();
        let (n1, d1) = fifo.add_tx(64, 2).unwrap();
        assert_eq!((n0, d0), (0, 16));
        assert_eq!((n1, d1), (1, 32));
        assert_eq!(fifo.tx_start(0), 25);
        assert_eq!(fifo.tx_start(1), 41);
        assert_eq!(fifo.total_words(), 25 + 16 + 32);
    }

    #[test]
    fn test_overflow_leaves_layout_unchanged() {
        let mut fifo = FifoAllocator::new(64, 0);
        fifo.add_tx(64, 1).unwrap();
        let before = fifo.clone();
        assert_eq!(fifo.add_tx(64, 3), Err(UsbError::IllegalOperation));
        assert_eq!(fifo.add_rx(512, 1), Err(UsbError::IllegalOperation));
        assert_eq!(fifo, before);
    }
}
