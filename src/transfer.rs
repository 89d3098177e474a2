//! Transfer primitives shared by device and host mode
//!
//! Endpoint addressing, the SETUP packet, DMA buffer handles and the
//! completion callback contract.

use crate::error::{Result, TransferStatus, UsbError};
use core::ptr::NonNull;

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    /// Control transfers (EP0)
    Control,
    /// Isochronous transfers
    Isochronous,
    /// Bulk transfers
    Bulk,
    /// Interrupt transfers
    Interrupt,
}

impl TransferType {
    /// Hardware EPTYPE encoding
    pub const fn eptype(self) -> u32 {
        match self {
            Self::Control => crate::otg::eptype::CONTROL,
            Self::Isochronous => crate::otg::eptype::ISOCHRONOUS,
            Self::Bulk => crate::otg::eptype::BULK,
            Self::Interrupt => crate::otg::eptype::INTERRUPT,
        }
    }

    /// Decode the bmAttributes transfer type field
    pub const fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x3 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Endpoint address as it appears in descriptors (bit 7 set for IN)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    /// EP0, OUT direction
    pub const EP0_OUT: Self = Self(0x00);
    /// EP0, IN direction
    pub const EP0_IN: Self = Self(0x80);

    /// Address from an endpoint number and direction
    pub const fn new(number: u8, direction: Direction) -> Self {
        match direction {
            Direction::In => Self(0x80 | (number & 0x0F)),
            Direction::Out => Self(number & 0x0F),
        }
    }

    /// Wrap a raw address; reserved bits 4-6 are preserved so that
    /// validation can reject them
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw address byte
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Endpoint number without the direction bit
    pub const fn number(self) -> u8 {
        self.0 & 0x0F
    }

    /// Whether the direction bit is set
    pub const fn is_in(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Transfer direction
    pub const fn direction(self) -> Direction {
        if self.is_in() {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Address has no reserved bits set
    pub const fn is_valid(self) -> bool {
        self.0 & 0x70 == 0
    }
}

impl From<u8> for EndpointAddress {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

/// Standard request codes
#[allow(missing_docs)]
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
    pub const SYNCH_FRAME: u8 = 0x0C;
}

/// Standard feature selectors
#[allow(missing_docs)]
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
}

/// Descriptor type codes
#[allow(missing_docs)]
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
}

/// Request type field of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestType {
    /// Standard request
    Standard,
    /// Class request
    Class,
    /// Vendor request
    Vendor,
    /// Reserved type
    Reserved,
}

/// Recipient field of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    /// Addressed to the device
    Device,
    /// Addressed to an interface
    Interface,
    /// Addressed to an endpoint
    Endpoint,
    /// Other recipient
    Other,
}

/// USB SETUP packet
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Size of a SETUP packet in bytes
    pub const SIZE: usize = 8;

    /// Decode the little-endian wire form
    pub const fn from_bytes(raw: &[u8; 8]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    /// Encode to the little-endian wire form
    pub const fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Data stage flows device to host
    pub const fn is_in(&self) -> bool {
        (self.request_type & 0x80) != 0
    }

    /// Request type field of bmRequestType
    pub const fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0x3 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    /// Recipient field of bmRequestType
    pub const fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }

    /// GET_DESCRIPTOR request
    pub const fn get_descriptor(desc_type: u8, desc_index: u8, language_id: u16, length: u16) -> Self {
        Self {
            request_type: 0x80, // Device-to-host, standard, device
            request: request::GET_DESCRIPTOR,
            value: ((desc_type as u16) << 8) | (desc_index as u16),
            index: language_id,
            length,
        }
    }

    /// SET_ADDRESS request
    pub const fn set_address(address: u8) -> Self {
        Self {
            request_type: 0x00,
            request: request::SET_ADDRESS,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    /// SET_CONFIGURATION request
    pub const fn set_configuration(configuration: u8) -> Self {
        Self {
            request_type: 0x00,
            request: request::SET_CONFIGURATION,
            value: configuration as u16,
            index: 0,
            length: 0,
        }
    }
}

/// Word-aligned storage for DMA buffers and descriptor blobs
#[repr(C, align(4))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aligned<const N: usize>(pub [u8; N]);

impl<const N: usize> Aligned<N> {
    /// Wrap `bytes`
    pub const fn new(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    /// All zero bytes
    pub const fn zeroed() -> Self {
        Self([0; N])
    }
}

/// Memory region handed to the controller's DMA engine
///
/// The handle is `Copy`; while a transfer is armed the controller owns the
/// bytes and the caller must not touch them until the completion callback
/// has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    writable: bool,
}

impl DmaBuffer {
    /// Buffer the controller may read and write
    pub fn from_static(buf: &'static mut [u8]) -> Self {
        let capacity = buf.len();
        Self {
            ptr: NonNull::from(buf).cast(),
            capacity,
            writable: true,
        }
    }

    /// Read-only buffer, for IN data such as descriptors
    pub fn from_static_ref(buf: &'static [u8]) -> Self {
        Self {
            ptr: NonNull::from(buf).cast(),
            capacity: buf.len(),
            writable: false,
        }
    }

    /// Wrap raw memory
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `capacity` bytes for as
    /// long as any transfer using this handle is armed.
    pub const unsafe fn from_raw_parts(ptr: NonNull<u8>, capacity: usize) -> Self {
        Self { ptr, capacity, writable: true }
    }

    /// Zero-length buffer for status stages and empty packets
    pub const fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            capacity: 0,
            writable: false,
        }
    }

    /// Bytes available
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the controller may write into the buffer
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    /// Start address for DMA
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Address of byte `offset`, for advancing a transfer packet by packet
    pub fn address_at(&self, offset: usize) -> *const u8 {
        self.ptr.as_ptr().wrapping_add(offset)
    }

    /// DMA requires word alignment
    pub fn is_aligned(&self) -> bool {
        self.capacity == 0 || (self.ptr.as_ptr() as usize) & 0x3 == 0
    }

    /// Check the buffer can carry `len` bytes to the controller
    pub fn check_source(&self, len: usize) -> Result<()> {
        if len > self.capacity || !self.is_aligned() {
            return Err(UsbError::IllegalOperation);
        }
        Ok(())
    }

    /// Check the buffer can receive `span` bytes from the controller
    pub fn check_sink(&self, span: usize) -> Result<()> {
        if span == 0 {
            return Ok(());
        }
        if !self.writable || span > self.capacity || !self.is_aligned() {
            return Err(UsbError::IllegalOperation);
        }
        Ok(())
    }
}

/// Transfer completion handler
///
/// Called exactly once per accepted transfer with the final status, the
/// byte count moved and the byte count left over. Runs in interrupt context
/// (or in the caller's context for an abort) and must not block. The return
/// value is only consulted for control data stages, where an error stalls
/// EP0.
pub trait TransferComplete {
    /// Report the final status and byte counts
    fn complete(&self, status: TransferStatus, transferred: usize, remaining: usize) -> Result<()>;
}

impl<F> TransferComplete for F
where
    F: Fn(TransferStatus, usize, usize) -> Result<()>,
{
    fn complete(&self, status: TransferStatus, transferred: usize, remaining: usize) -> Result<()> {
        self(status, transferred, remaining)
    }
}

/// Completion handle stored with an armed transfer
pub type Completion = &'static dyn TransferComplete;

/// Ceiling division in packets, at least one packet
#[inline]
pub(crate) const fn packet_count(len: usize, max_packet_size: usize) -> usize {
    if len == 0 || max_packet_size == 0 {
        1
    } else {
        len.div_ceil(max_packet_size)
    }
}
