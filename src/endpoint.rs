//! Endpoint registry
//!
//! Device-mode endpoints live in a fixed-capacity table. EP0 always occupies
//! slot 0 and answers to both `0x00` and `0x80`; every other endpoint is
//! keyed by its full address.

use crate::error::{Result, UsbError};
use crate::transfer::{Completion, DmaBuffer, EndpointAddress, TransferType};
use heapless::Vec;

/// Table capacity: EP0 plus 15 IN and 15 OUT endpoints
pub const MAX_ENDPOINTS: usize = 31;

/// Transfer state of one endpoint
///
/// The state is the sole arbiter of the one-outstanding-transfer rule: a
/// transfer may only be armed from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointState {
    /// Nothing armed
    Idle,
    /// OUT data (or EP0 OUT data stage) in flight
    Receiving,
    /// IN data (or EP0 IN data stage) in flight
    Transmitting,
    /// EP0 sending the zero-length status packet
    StatusIn,
    /// EP0 waiting for the host's zero-length status packet
    StatusOut,
}

/// Pending zero-length packet on an EP0 IN data stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Zlp {
    None,
    Pending,
    Sent,
}

/// Device-mode endpoint
#[derive(Clone)]
pub struct Endpoint {
    /// Address; for EP0 the direction of the current data stage
    pub address: EndpointAddress,
    /// Transfer type the endpoint was registered with
    pub transfer_type: TransferType,
    /// Negotiated max packet size
    pub max_packet_size: u16,
    /// TX FIFO number for IN endpoints (EP0 uses FIFO 0)
    pub fifo: u8,
    /// FIFO words reserved for this endpoint
    pub fifo_depth: u16,
    /// FIFO buffering multiplier requested at registration
    pub buffering: u8,
    /// Transfer state
    pub state: EndpointState,
    /// Bytes moved so far by the current transfer
    pub transferred: usize,
    /// Bytes still to move
    pub remaining: usize,
    pub(crate) buffer: DmaBuffer,
    /// Bytes armed in the hardware for the packet or transfer in flight
    pub(crate) armed: usize,
    pub(crate) zlp: Zlp,
    pub(crate) callback: Option<Completion>,
}

impl Endpoint {
    pub(crate) fn new(address: EndpointAddress, transfer_type: TransferType, max_packet_size: u16) -> Self {
        Self {
            address,
            transfer_type,
            max_packet_size,
            fifo: 0,
            fifo_depth: 0,
            buffering: 1,
            state: EndpointState::Idle,
            transferred: 0,
            remaining: 0,
            buffer: DmaBuffer::empty(),
            armed: 0,
            zlp: Zlp::None,
            callback: None,
        }
    }

    /// Endpoint number without the direction bit
    pub const fn number(&self) -> u8 {
        self.address.number()
    }

    /// Whether this is an IN endpoint
    pub const fn is_in(&self) -> bool {
        self.address.is_in()
    }

    /// Whether no transfer is in flight
    pub fn is_idle(&self) -> bool {
        self.state == EndpointState::Idle
    }

    /// Start bookkeeping for a new transfer
    pub(crate) fn begin(&mut self, state: EndpointState, buffer: DmaBuffer, len: usize, callback: Option<Completion>) {
        self.state = state;
        self.buffer = buffer;
        self.transferred = 0;
        self.remaining = len;
        self.armed = 0;
        self.zlp = Zlp::None;
        self.callback = callback;
    }

    /// Account for `count` bytes moved by the hardware
    pub(crate) fn advance(&mut self, count: usize) {
        let count = count.min(self.remaining);
        self.transferred += count;
        self.remaining -= count;
    }

    /// Return to idle and hand back the pending completion, if any
    pub(crate) fn finish(&mut self) -> Option<Completion> {
        self.state = EndpointState::Idle;
        self.armed = 0;
        self.zlp = Zlp::None;
        self.callback.take()
    }
}

impl core::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("transfer_type", &self.transfer_type)
            .field("max_packet_size", &self.max_packet_size)
            .field("fifo", &self.fifo)
            .field("state", &self.state)
            .field("transferred", &self.transferred)
            .field("remaining", &self.remaining)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Fixed-capacity endpoint table
pub struct EndpointTable {
    endpoints: Vec<Endpoint, MAX_ENDPOINTS>,
}

impl EndpointTable {
    /// Table holding only EP0
    pub fn new(ep0_max_packet: u16) -> Self {
        let mut endpoints = Vec::new();
        // Capacity is non-zero so the first push cannot fail
        let _ = endpoints.push(Endpoint::new(EndpointAddress::EP0_OUT, TransferType::Control, ep0_max_packet));
        Self { endpoints }
    }

    /// Slot index for an address
    pub fn index_of(&self, address: EndpointAddress) -> Option<usize> {
        if address.number() == 0 {
            return if address.is_valid() { Some(0) } else { None };
        }
        self.endpoints
            .iter()
            .position(|ep| ep.number() != 0 && ep.address == address)
    }

    /// Endpoint registered for `address`
    pub fn get(&self, address: EndpointAddress) -> Option<&Endpoint> {
        self.index_of(address).map(|i| &self.endpoints[i])
    }

    /// Endpoint registered for `address`, mutably
    pub fn get_mut(&mut self, address: EndpointAddress) -> Option<&mut Endpoint> {
        match self.index_of(address) {
            Some(i) => Some(&mut self.endpoints[i]),
            None => None,
        }
    }

    /// The default control endpoint
    pub fn ep0(&self) -> &Endpoint {
        &self.endpoints[0]
    }

    /// The default control endpoint, mutably
    pub fn ep0_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoints[0]
    }

    /// Endpoint in table slot `index`
    pub fn by_index(&self, index: usize) -> &Endpoint {
        &self.endpoints[index]
    }

    /// Endpoint in table slot `index`, mutably
    pub fn by_index_mut(&mut self, index: usize) -> &mut Endpoint {
        &mut self.endpoints[index]
    }

    /// Register a data endpoint
    pub fn insert(&mut self, endpoint: Endpoint) -> Result<usize> {
        if endpoint.number() == 0 || self.index_of(endpoint.address).is_some() {
            return Err(UsbError::IllegalOperation);
        }
        self.endpoints.push(endpoint).map_err(|_| UsbError::IllegalOperation)?;
        Ok(self.endpoints.len() - 1)
    }

    /// Registered endpoints, EP0 included
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false: EP0 is always present
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Registered IN data endpoints
    pub fn in_count(&self) -> usize {
        self.data().filter(|ep| ep.is_in()).count()
    }

    /// Registered OUT data endpoints
    pub fn out_count(&self) -> usize {
        self.data().filter(|ep| !ep.is_in()).count()
    }

    /// All endpoints in table order
    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    /// Data endpoints, EP0 excluded
    pub fn data(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().skip(1)
    }

    /// All endpoints in table order, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Endpoint> {
        self.endpoints.iter_mut()
    }

    /// Drop every data endpoint, keeping EP0
    pub fn clear_data(&mut self) {
        self.endpoints.truncate(1);
    }
}
