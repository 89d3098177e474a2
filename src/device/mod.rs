//! Device-mode controller
//!
//! [`UsbDevice`] owns the peripheral, the endpoint table and the device
//! state. Call-context API functions run with the USB interrupt masked
//! through a [`CriticalSection`]; the interrupt handler
//! ([`UsbDevice::on_interrupt`]) feeds the EP0 control state machine, the
//! data endpoint engine and the power controller.
//!
//! The protocol state lives in an inner engine that is handed to the SETUP
//! callback as a [`ControlEndpoint`], so a request handler can start the
//! data stage without re-entering the driver.

mod ch9;
mod control;
mod interrupt;
mod transfer;

use crate::config::DeviceConfig;
use crate::critical::{CriticalSection, InterruptGate, NoGate};
use crate::endpoint::{Endpoint, EndpointTable};
use crate::error::{Result, UsbError};
use crate::fifo::FifoAllocator;
use crate::otg::{
    self, dcfg, Ctrl, DepCtl, DiepInt, DoepInt, Dctl, GahbCfg, Gint, GusbCfg, RegisterBlock, Route,
    WrapperIf, WrapperStatus,
};
use crate::power::{NoPowerHooks, PowerController, PowerHooks, PowerState};
use crate::stats::UsbStats;
use crate::timing::PollBudget;
use crate::transfer::{Completion, DmaBuffer, EndpointAddress, SetupPacket, TransferType};
use core::ptr::NonNull;

/// USB device state (chapter 9 visible states plus NONE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    /// No VBUS
    None,
    /// VBUS present before the pull-up is released
    Attached,
    /// VBUS present, no bus reset yet
    Powered,
    /// Reset, address 0
    Default,
    /// Address assigned, not configured
    Addressed,
    /// Configuration selected; data endpoints active
    Configured,
    /// Bus suspended; the previous state is kept for resume
    Suspended,
}

/// Outcome of a SETUP request handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SetupResult {
    /// Request taken; the handler has started the data stage, or there is
    /// none and the engine proceeds to STATUS
    Accepted,
    /// Request not recognised; standard requests fall through to the
    /// built-in chapter 9 handler, anything else is stalled
    Unhandled,
    /// Request recognised but refused; EP0 is stalled
    Rejected,
}

/// Application capabilities
///
/// Every method has a default, so an application implements only the
/// capabilities it has. An absent self-powered answer is `None`.
pub trait DeviceCallbacks {
    /// Bus reset seen
    fn on_reset(&mut self) {}

    /// Device state changed
    fn on_state_change(&mut self, _old: DeviceState, _new: DeviceState) {}

    /// SETUP packet received
    ///
    /// Runs in interrupt context. Use `ep0` to start the data stage.
    fn on_setup(&mut self, _setup: &SetupPacket, _ep0: &mut dyn ControlEndpoint) -> SetupResult {
        SetupResult::Unhandled
    }

    /// Power source for GET_STATUS
    fn is_self_powered(&mut self) -> Option<bool> {
        None
    }

    /// Whether start-of-frame interrupts should be enabled
    fn wants_start_of_frame(&self) -> bool {
        false
    }

    /// Start of frame with the current frame number
    fn on_start_of_frame(&mut self, _frame: u16) {}
}

/// Application with no capabilities
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallbacks;

impl DeviceCallbacks for NoCallbacks {}

/// EP0 access from inside a SETUP handler
pub trait ControlEndpoint {
    /// SETUP packet being served
    fn setup(&self) -> SetupPacket;

    /// Device state
    fn device_state(&self) -> DeviceState;

    /// Start an IN data stage; `len` is clipped to wLength
    fn write(&mut self, buffer: DmaBuffer, len: usize, callback: Option<Completion>) -> Result<()>;

    /// Start an OUT data stage
    fn read(&mut self, buffer: DmaBuffer, len: usize, callback: Option<Completion>) -> Result<()>;

    /// Halt a data endpoint
    fn stall(&mut self, address: EndpointAddress) -> Result<()>;

    /// Clear a halt
    fn unstall(&mut self, address: EndpointAddress) -> Result<()>;
}

/// SETUP packets the core can store before software drains them
pub const SETUP_RING_SLOTS: usize = 3;

/// DMA memory for EP0: the SETUP ring and a small response scratch area
///
/// Must outlive the driver, so it is handed over as `&'static mut`.
#[repr(C, align(4))]
pub struct ControlBuffer {
    setup: [[u8; 8]; SETUP_RING_SLOTS],
    scratch: [u8; 8],
}

impl ControlBuffer {
    /// Zeroed buffer
    pub const fn new() -> Self {
        Self {
            setup: [[0; 8]; SETUP_RING_SLOTS],
            scratch: [0; 8],
        }
    }
}

impl Default for ControlBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupts enabled while the bus is being enumerated
pub(crate) const ENUMERATION_MASK: Gint = Gint::USBRST
    .union(Gint::ENUMDONE)
    .union(Gint::USBSUSP)
    .union(Gint::WKUPINT)
    .union(Gint::RESETDET);

/// Protocol state shared by the API and the interrupt handler
pub(crate) struct Engine<R: RegisterBlock> {
    pub(crate) regs: R,
    pub(crate) config: DeviceConfig,
    pub(crate) endpoints: EndpointTable,
    pub(crate) fifo: FifoAllocator,
    pub(crate) state: DeviceState,
    pub(crate) last_state: DeviceState,
    pub(crate) saved_state: DeviceState,
    /// SETUP packet currently being served
    pub(crate) setup: SetupPacket,
    pub(crate) control: NonNull<ControlBuffer>,
    pub(crate) address: u8,
    pub(crate) configuration: u8,
    pub(crate) remote_wakeup_enabled: bool,
    pub(crate) sof_enabled: bool,
    pub(crate) power: PowerController,
    pub(crate) stats: UsbStats,
}

impl<R: RegisterBlock> Engine<R> {
    fn new(regs: R, config: DeviceConfig, control: &'static mut ControlBuffer, sof_enabled: bool) -> Self {
        let limits = config.limits;
        Self {
            regs,
            endpoints: EndpointTable::new(config.ep0_max_packet),
            fifo: FifoAllocator::new(limits.fifo_words, limits.out_endpoints),
            config,
            state: DeviceState::None,
            last_state: DeviceState::None,
            saved_state: DeviceState::None,
            setup: SetupPacket::default(),
            control: NonNull::from(control),
            address: 0,
            configuration: 0,
            remote_wakeup_enabled: false,
            sof_enabled,
            power: PowerController::new(),
            stats: UsbStats::new(),
        }
    }

    pub(crate) fn budget(&self) -> PollBudget {
        PollBudget::new(self.config.handshake_budget)
    }

    /// Poll `done` within the handshake budget, counting a timeout
    pub(crate) fn handshake<F: FnMut(&R) -> bool>(&self, mut done: F) -> bool {
        let regs = &self.regs;
        let ok = self.budget().wait(|| done(regs));
        if !ok {
            self.stats.record_handshake_timeout();

            #[cfg(feature = "defmt")]
            defmt::warn!("USB handshake budget exhausted");
        }
        ok
    }

    /// Interrupt mask for normal operation
    pub(crate) fn standard_mask(&self) -> u32 {
        let mut mask = ENUMERATION_MASK | Gint::IEPINT | Gint::OEPINT;
        if self.sof_enabled {
            mask |= Gint::SOF;
        }
        mask.bits()
    }

    fn core_reset(&mut self) -> Result<()> {
        if !otg::core_soft_reset(&self.regs, self.config.handshake_budget) {
            self.stats.record_handshake_timeout();

            #[cfg(feature = "defmt")]
            defmt::error!("USB core did not leave soft reset");

            return Err(UsbError::DeviceMalfunction);
        }
        Ok(())
    }

    /// Bring the core up in device mode, disconnected from the bus
    fn init(&mut self) -> Result<()> {
        let mps_code = self.config.ep0_mps_code().ok_or(UsbError::IllegalOperation)?;
        let ep0_mps = self.config.ep0_max_packet;
        let ep0_buffering = self.config.ep0_buffering;
        let limits = self.config.limits;

        self.regs.write(otg::ROUTE, Route::PHYPEN.bits());
        self.regs.write(otg::CTRL, Ctrl::VREGOSEN.bits());

        self.core_reset()?;

        self.regs.write(otg::GAHBCFG, (GahbCfg::DMAEN | GahbCfg::HBSTLEN_INCR).bits());
        self.regs.modify(otg::GUSBCFG, |v| {
            (v & !(GusbCfg::FORCEHSTMODE | GusbCfg::USBTRDTIM_MASK | GusbCfg::TOUTCAL_MASK).bits())
                | (GusbCfg::FORCEDEVMODE | GusbCfg::USBTRDTIM_FS).bits()
                | 5
        });
        self.regs.modify(otg::DCFG, |v| (v & !(dcfg::DEVSPD_MASK | dcfg::DAD_MASK)) | dcfg::DEVSPD_FS);
        self.regs.set_bits(otg::DCTL, Dctl::SFTDISCON.bits());

        // EP0 takes TX FIFO 0 and its share of the RX FIFO
        let mut fifo = FifoAllocator::new(limits.fifo_words, limits.out_endpoints);
        fifo.add_rx(ep0_mps, ep0_buffering)?;
        let (tx_fifo, depth) = fifo.add_tx(ep0_mps, ep0_buffering)?;
        self.fifo = fifo;
        self.endpoints = EndpointTable::new(ep0_mps);
        {
            let ep0 = self.endpoints.ep0_mut();
            ep0.fifo = tx_fifo;
            ep0.fifo_depth = depth;
            ep0.buffering = ep0_buffering;
        }
        if !self.fifo.program(&self.regs, self.config.handshake_budget) {
            self.stats.record_handshake_timeout();
        }

        self.regs.write(otg::diepctl(0), mps_code | DepCtl::SNAK.bits());
        self.regs.write(otg::doepctl(0), mps_code | DepCtl::SNAK.bits());
        self.regs.write(otg::DIEPMSK, DiepInt::XFERCOMPL.bits());
        self.regs.write(otg::DOEPMSK, (DoepInt::XFERCOMPL | DoepInt::SETUP).bits());
        self.regs.write(otg::DAINTMSK, 0);

        self.regs.write(otg::GINTSTS, 0xFFFF_FFFF);
        self.regs.write(otg::GINTMSK, ENUMERATION_MASK.bits());

        let vbus_events = (WrapperIf::VREGOSH | WrapperIf::VREGOSL).bits();
        self.regs.write(otg::IFC, vbus_events);
        self.regs.write(otg::IEN, vbus_events);

        self.regs.set_bits(otg::GAHBCFG, GahbCfg::GLBLINTRMSK.bits());

        self.power.reset();
        self.state = DeviceState::None;
        self.last_state = DeviceState::None;
        self.saved_state = DeviceState::None;
        self.address = 0;
        self.configuration = 0;
        self.remote_wakeup_enabled = false;

        #[cfg(feature = "defmt")]
        defmt::info!("USB device initialized, EP0 mps={}", ep0_mps);

        Ok(())
    }

    /// Move to `new`, applying the endpoint activation rules
    ///
    /// Leaving CONFIGURED for anything but SUSPENDED deactivates the data
    /// endpoints; entering CONFIGURED from anything but SUSPENDED activates
    /// them.
    pub(crate) fn set_state(&mut self, new: DeviceState, callbacks: &mut dyn DeviceCallbacks) {
        let current = self.state;
        if new == current {
            return;
        }

        if new == DeviceState::Suspended {
            self.saved_state = current;
        }
        self.last_state = current;
        self.state = new;

        #[cfg(feature = "defmt")]
        defmt::debug!("USB state {} -> {}", current, new);

        if current == DeviceState::Configured && new != DeviceState::Suspended {
            self.deactivate_all(UsbError::DeviceUnconfigured);
        } else if new == DeviceState::Configured && current != DeviceState::Suspended {
            self.activate_all();
        }

        callbacks.on_state_change(current, new);
    }

    /// Register a data endpoint and repartition the FIFOs
    fn add_endpoint(
        &mut self,
        address: EndpointAddress,
        transfer_type: TransferType,
        max_packet_size: u16,
        buffering: u8,
    ) -> Result<()> {
        let limits = self.config.limits;
        if !address.is_valid() || address.number() == 0 || transfer_type == TransferType::Control {
            return Err(UsbError::IllegalOperation);
        }

        let max_allowed = match transfer_type {
            TransferType::Isochronous => 1023,
            _ => 64,
        };
        if max_packet_size == 0 || max_packet_size > max_allowed {
            return Err(UsbError::IllegalOperation);
        }

        let mut fifo = self.fifo.clone();
        let mut endpoint = Endpoint::new(address, transfer_type, max_packet_size);
        endpoint.buffering = buffering.max(1);

        if address.is_in() {
            if address.number() > limits.in_endpoints
                || self.endpoints.in_count() >= limits.in_endpoints as usize
                || fifo.tx_fifo_count() > limits.tx_fifos as usize
            {
                return Err(UsbError::IllegalOperation);
            }
            let (tx_fifo, depth) = fifo.add_tx(max_packet_size, buffering)?;
            endpoint.fifo = tx_fifo;
            endpoint.fifo_depth = depth;
        } else {
            if address.number() > limits.out_endpoints
                || self.endpoints.out_count() >= limits.out_endpoints as usize
            {
                return Err(UsbError::IllegalOperation);
            }
            endpoint.fifo_depth = fifo.add_rx(max_packet_size, buffering)?;
        }

        let index = self.endpoints.insert(endpoint)?;
        self.fifo = fifo;
        if !self.fifo.program(&self.regs, self.config.handshake_budget) {
            self.stats.record_handshake_timeout();
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("Added endpoint {=u8:#x} mps={}", address.raw(), max_packet_size);

        if self.state == DeviceState::Configured {
            self.activate(index);
        }
        Ok(())
    }

    /// Stall both EP0 directions until the next SETUP
    pub(crate) fn stall_ep0(&mut self) {
        let mask = !DepCtl::ONE_SHOT.bits();
        self.regs.modify(otg::diepctl(0), |v| (v & mask) | DepCtl::STALL.bits());
        self.regs.modify(otg::doepctl(0), |v| (v & mask) | DepCtl::STALL.bits());
        self.stats.record_control_stall();
    }

    /// Pointer handed to the DMA engine for SETUP reception
    pub(crate) fn setup_ring_address(&self) -> *const u8 {
        self.control.as_ptr() as *const u8
    }

    /// Read ring slot `slot`
    pub(crate) fn read_setup_slot(&self, slot: usize) -> SetupPacket {
        let slot = slot.min(SETUP_RING_SLOTS - 1);
        // SAFETY: `control` came from a &'static mut ControlBuffer owned by
        // this engine; the DMA engine writes it only while OUT EP0 is armed
        // for SETUP, and the SETUP event says that write has finished
        let raw = unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*self.control.as_ptr()).setup[slot])) };
        SetupPacket::from_bytes(&raw)
    }

    /// Copy a short response into the scratch area and return it as a
    /// DMA buffer
    pub(crate) fn scratch(&mut self, bytes: &[u8]) -> DmaBuffer {
        let len = bytes.len().min(8);
        // SAFETY: as for read_setup_slot; EP0 IN is idle whenever a
        // response is being prepared
        unsafe {
            let base = core::ptr::addr_of_mut!((*self.control.as_ptr()).scratch) as *mut u8;
            for (i, byte) in bytes.iter().take(len).enumerate() {
                core::ptr::write_volatile(base.add(i), *byte);
            }
            DmaBuffer::from_raw_parts(NonNull::new_unchecked(base), 8)
        }
    }
}

/// USB device controller
pub struct UsbDevice<R, C, P = NoPowerHooks, G = NoGate>
where
    R: RegisterBlock,
    C: DeviceCallbacks,
    P: PowerHooks,
    G: InterruptGate,
{
    engine: Engine<R>,
    callbacks: C,
    hooks: P,
    gate: G,
}

impl<R, C> UsbDevice<R, C, NoPowerHooks, NoGate>
where
    R: RegisterBlock,
    C: DeviceCallbacks,
{
    /// Create a controller; call [`UsbDevice::init`] before use
    pub fn new(regs: R, config: DeviceConfig, callbacks: C, control: &'static mut ControlBuffer) -> Self {
        let sof_enabled = callbacks.wants_start_of_frame();
        Self {
            engine: Engine::new(regs, config, control, sof_enabled),
            callbacks,
            hooks: NoPowerHooks,
            gate: NoGate,
        }
    }
}

impl<R, C, P, G> UsbDevice<R, C, P, G>
where
    R: RegisterBlock,
    C: DeviceCallbacks,
    P: PowerHooks,
    G: InterruptGate,
{
    /// Replace the power hooks
    pub fn with_power_hooks<P2: PowerHooks>(self, hooks: P2) -> UsbDevice<R, C, P2, G> {
        UsbDevice {
            engine: self.engine,
            callbacks: self.callbacks,
            hooks,
            gate: self.gate,
        }
    }

    /// Replace the interrupt gate used for call-context exclusion
    pub fn with_gate<G2: InterruptGate>(self, gate: G2) -> UsbDevice<R, C, P, G2> {
        UsbDevice {
            engine: self.engine,
            callbacks: self.callbacks,
            hooks: self.hooks,
            gate,
        }
    }

    /// Reset the core into device mode
    ///
    /// Fails with `IllegalOperation` for an unsupported EP0 packet size or
    /// an EP0 FIFO that does not fit, and with `DeviceMalfunction` if the
    /// core never leaves soft reset. The device starts disconnected; call
    /// [`UsbDevice::connect`] once endpoints are registered.
    pub fn init(&mut self) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.init()?;
        if self.engine.regs.read(otg::STATUS) & WrapperStatus::VREGOS.bits() != 0 {
            self.engine.set_state(DeviceState::Powered, &mut self.callbacks);
        }
        Ok(())
    }

    /// Register a data endpoint
    ///
    /// `buffering` multiplies the FIFO space reserved for the endpoint.
    /// Fails with `IllegalOperation` (and changes nothing) if the address is
    /// invalid or taken, the hardware has no endpoint left in that
    /// direction, or the FIFO pool would overflow.
    pub fn add_endpoint(
        &mut self,
        address: EndpointAddress,
        transfer_type: TransferType,
        max_packet_size: u16,
        buffering: u8,
    ) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.add_endpoint(address, transfer_type, max_packet_size, buffering)
    }

    /// Look up a registered endpoint
    pub fn endpoint(&self, address: EndpointAddress) -> Option<&Endpoint> {
        self.engine.endpoints.get(address)
    }

    /// Activate a registered data endpoint outside of SET_CONFIGURATION,
    /// for example when the host selects an alternate setting
    pub fn activate_endpoint(&mut self, address: EndpointAddress) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.activate_endpoint(address)
    }

    /// Deactivate a data endpoint
    ///
    /// A transfer in flight is aborted first and its callback reports
    /// `EndpointAborted`. Reads and writes are refused until the endpoint is
    /// activated again.
    pub fn deactivate_endpoint(&mut self, address: EndpointAddress) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.deactivate_endpoint(address)
    }

    /// Attach to the bus (release soft disconnect)
    pub fn connect(&mut self) {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.regs.clear_bits(otg::DCTL, Dctl::SFTDISCON.bits());

        #[cfg(feature = "defmt")]
        defmt::info!("USB connect");
    }

    /// Detach from the bus (soft disconnect)
    pub fn disconnect(&mut self) {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.regs.set_bits(otg::DCTL, Dctl::SFTDISCON.bits());

        #[cfg(feature = "defmt")]
        defmt::info!("USB disconnect");
    }

    /// Start reading `len` bytes on an OUT endpoint
    ///
    /// The buffer must hold `len` rounded up to whole packets.
    pub fn read(
        &mut self,
        address: EndpointAddress,
        buffer: DmaBuffer,
        len: usize,
        callback: Option<Completion>,
    ) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.read(address, buffer, len, callback)
    }

    /// Start writing `len` bytes on an IN endpoint
    pub fn write(
        &mut self,
        address: EndpointAddress,
        buffer: DmaBuffer,
        len: usize,
        callback: Option<Completion>,
    ) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.write(address, buffer, len, callback)
    }

    /// Cancel the transfer on `address`
    ///
    /// Returns once the pending callback has run with `EndpointAborted`.
    /// Succeeds without side effects if the endpoint is idle.
    pub fn abort_transfer(&mut self, address: EndpointAddress) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.abort(address)
    }

    /// Cancel every outstanding transfer, reporting `EndpointAborted`
    pub fn abort_all_transfers(&mut self) {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.abort_many(UsbError::EndpointAborted, true);
    }

    /// Halt an endpoint
    pub fn stall_endpoint(&mut self, address: EndpointAddress) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.stall(address)
    }

    /// Clear an endpoint halt and reset its data toggle
    pub fn unstall_endpoint(&mut self, address: EndpointAddress) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        self.engine.unstall(address)
    }

    /// Signal remote wakeup to the host
    ///
    /// Only valid while suspended and after the host enabled the feature.
    pub fn remote_wakeup(&mut self) -> Result<()> {
        let _cs = CriticalSection::enter(&self.gate);
        let engine = &mut self.engine;
        if engine.state != DeviceState::Suspended || !engine.remote_wakeup_enabled {
            return Err(UsbError::IllegalOperation);
        }

        engine.power.exit_power_down(&engine.regs, &mut self.hooks);
        engine.regs.set_bits(otg::DCTL, Dctl::RMTWKUPSIG.bits());
        self.hooks.delay_ms(REMOTE_WAKEUP_SIGNAL_MS);
        engine.regs.clear_bits(otg::DCTL, Dctl::RMTWKUPSIG.bits());
        engine.power.resume();

        let resumed = engine.saved_state;
        engine.set_state(resumed, &mut self.callbacks);

        #[cfg(feature = "defmt")]
        defmt::info!("USB remote wakeup");

        Ok(())
    }

    /// Device state
    pub fn state(&self) -> DeviceState {
        self.engine.state
    }

    /// State before the most recent change
    pub fn last_state(&self) -> DeviceState {
        self.engine.last_state
    }

    /// Controller power state
    pub fn power_state(&self) -> PowerState {
        self.engine.power.state()
    }

    /// Most recent SETUP packet
    pub fn last_setup(&self) -> SetupPacket {
        self.engine.setup
    }

    /// Bus address assigned by the host
    pub fn address(&self) -> u8 {
        self.engine.address
    }

    /// Whether the host enabled remote wakeup
    pub fn remote_wakeup_enabled(&self) -> bool {
        self.engine.remote_wakeup_enabled
    }

    /// FIFO layout
    pub fn fifo(&self) -> &FifoAllocator {
        &self.engine.fifo
    }

    /// Transfer and event counters
    pub fn stats(&self) -> &UsbStats {
        &self.engine.stats
    }

    /// Configuration the device was built with
    pub fn config(&self) -> &DeviceConfig {
        &self.engine.config
    }

    /// Register interface
    pub fn registers(&self) -> &R {
        &self.engine.regs
    }

    /// Application callbacks
    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    /// Application callbacks, mutably
    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }
}

/// Remote wakeup K-state duration
pub const REMOTE_WAKEUP_SIGNAL_MS: u32 = 10;
