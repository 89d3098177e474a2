//! Driver statistics
//!
//! Relaxed atomic counters updated from interrupt and call context alike.
//! Each driver instance owns one [`UsbStats`].

use core::sync::atomic::{AtomicU32, Ordering};

/// Event counters for one controller
#[derive(Debug, Default)]
pub struct UsbStats {
    /// Transfers completed successfully
    pub transfers_completed: AtomicU32,
    /// Transfers that ended with an error other than abort
    pub transfers_failed: AtomicU32,
    /// Transfers ended by an abort or bus event
    pub transfers_aborted: AtomicU32,
    /// Total payload bytes moved (saturating)
    pub bytes_transferred: AtomicU32,
    /// SETUP packets received
    pub setup_packets: AtomicU32,
    /// Control requests answered with a protocol stall
    pub control_stalls: AtomicU32,
    /// Bus resets seen
    pub bus_resets: AtomicU32,
    /// Bus suspends seen
    pub suspends: AtomicU32,
    /// Interrupt handler invocations
    pub interrupts: AtomicU32,
    /// Host transaction retries
    pub host_retries: AtomicU32,
    /// Host NAK handshakes
    pub naks: AtomicU32,
    /// Hardware handshakes that ran out of budget
    pub handshake_timeouts: AtomicU32,
}

impl UsbStats {
    /// All counters at zero
    pub const fn new() -> Self {
        Self {
            transfers_completed: AtomicU32::new(0),
            transfers_failed: AtomicU32::new(0),
            transfers_aborted: AtomicU32::new(0),
            bytes_transferred: AtomicU32::new(0),
            setup_packets: AtomicU32::new(0),
            control_stalls: AtomicU32::new(0),
            bus_resets: AtomicU32::new(0),
            suspends: AtomicU32::new(0),
            interrupts: AtomicU32::new(0),
            host_retries: AtomicU32::new(0),
            naks: AtomicU32::new(0),
            handshake_timeouts: AtomicU32::new(0),
        }
    }

    /// Record a successful transfer
    #[inline(always)]
    pub fn record_completed(&self, bytes: usize) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);

        let _ = self.bytes_transferred.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            current.checked_add(bytes as u32).or(Some(u32::MAX))
        });
    }

    /// Record a transfer ending with `status`
    #[inline(always)]
    pub fn record_outcome(&self, status: &crate::error::TransferStatus, bytes: usize) {
        use crate::error::UsbError;
        match status {
            Ok(()) => self.record_completed(bytes),
            Err(UsbError::EndpointAborted) => {
                self.transfers_aborted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_bus_event() => {
                self.transfers_aborted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.transfers_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[inline(always)]
    /// Count a SETUP packet
    pub fn record_setup(&self) {
        self.setup_packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    /// Count an EP0 protocol stall
    pub fn record_control_stall(&self) {
        self.control_stalls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    /// Count a bus reset
    pub fn record_bus_reset(&self) {
        self.bus_resets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    /// Count a suspend
    pub fn record_suspend(&self) {
        self.suspends.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    /// Count an interrupt handler pass
    pub fn record_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    /// Count a host transaction retry
    pub fn record_retry(&self) {
        self.host_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    /// Count a host NAK retry
    pub fn record_nak(&self) {
        self.naks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    /// Count an exhausted handshake budget
    pub fn record_handshake_timeout(&self) {
        self.handshake_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            transfers_aborted: self.transfers_aborted.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            setup_packets: self.setup_packets.load(Ordering::Relaxed),
            control_stalls: self.control_stalls.load(Ordering::Relaxed),
            bus_resets: self.bus_resets.load(Ordering::Relaxed),
            suspends: self.suspends.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            host_retries: self.host_retries.load(Ordering::Relaxed),
            naks: self.naks.load(Ordering::Relaxed),
            handshake_timeouts: self.handshake_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.transfers_completed,
            &self.transfers_failed,
            &self.transfers_aborted,
            &self.bytes_transferred,
            &self.setup_packets,
            &self.control_stalls,
            &self.bus_resets,
            &self.suspends,
            &self.interrupts,
            &self.host_retries,
            &self.naks,
            &self.handshake_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Immutable snapshot of [`UsbStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub transfers_completed: u32,
    pub transfers_failed: u32,
    pub transfers_aborted: u32,
    pub bytes_transferred: u32,
    pub setup_packets: u32,
    pub control_stalls: u32,
    pub bus_resets: u32,
    pub suspends: u32,
    pub interrupts: u32,
    pub host_retries: u32,
    pub naks: u32,
    pub handshake_timeouts: u32,
}

impl StatsSnapshot {
    /// Transfers that reached a final state
    pub fn transfers_total(&self) -> u32 {
        self.transfers_completed + self.transfers_failed + self.transfers_aborted
    }

    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f32 {
        let total = self.transfers_total();
        if total == 0 {
            return 100.0;
        }
        (self.transfers_completed as f32 / total as f32) * 100.0
    }
}
