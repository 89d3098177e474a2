//! Shared test utilities for efm32-usb tests
//!
//! The simulated peripheral and its collaborators live in
//! [`mock_hardware`]; this module adds the bring-up sequences most tests
//! start from.

#![allow(dead_code)]

pub mod mock_hardware;

pub use mock_hardware::*;

use efm32_usb::critical::InterruptGate;
use efm32_usb::otg::Gint;
use efm32_usb::{
    DeviceCallbacks, DeviceConfig, DeviceState, HostConfig, PortState, PowerHooks, SetupPacket, UsbDevice, UsbHost,
};

/// Device under test with the default hooks and gate
pub type TestDevice<'a> = UsbDevice<&'a MockUsb, TestApp>;

/// Host under test
pub type TestHost<'a> = UsbHost<&'a MockUsb, MockVbus, &'a ManualClock>;

/// Configuration served by the test device
pub fn device_config() -> DeviceConfig {
    DeviceConfig::new(&DEVICE_DESCRIPTOR.0, &CONFIG_DESCRIPTOR.0)
        .strings(&STRINGS)
        .handshake_budget(1_000)
}

/// Device initialised with VBUS present
pub fn new_device(mock: &MockUsb, app: TestApp) -> TestDevice<'_> {
    new_device_with(mock, device_config(), app)
}

pub fn new_device_with(mock: &MockUsb, config: DeviceConfig, app: TestApp) -> TestDevice<'_> {
    mock.vbus_on();
    let mut device = UsbDevice::new(mock, config, app, control_buffer());
    device.init().expect("device init");
    device
}

/// Bus reset followed by enumeration done
pub fn bus_reset<C, P, G>(device: &mut UsbDevice<&MockUsb, C, P, G>)
where
    C: DeviceCallbacks,
    P: PowerHooks,
    G: InterruptGate,
{
    let mock = *device.registers();
    mock.raise(Gint::USBRST);
    device.on_interrupt();
    mock.raise(Gint::ENUMDONE);
    device.on_interrupt();
}

/// Run a control request without data stage; returns once the status
/// stage has been taken by the host
pub fn control_no_data<C, P, G>(device: &mut UsbDevice<&MockUsb, C, P, G>, setup: &SetupPacket)
where
    C: DeviceCallbacks,
    P: PowerHooks,
    G: InterruptGate,
{
    let mock = *device.registers();
    mock.deliver_setup(setup);
    device.on_interrupt();
    if mock.in_enabled(0) {
        mock.complete_in(0);
        device.on_interrupt();
    }
}

/// Run a control read: collect every IN packet the device sends, then send
/// the status ZLP
pub fn control_in<C, P, G>(device: &mut UsbDevice<&MockUsb, C, P, G>, setup: &SetupPacket) -> Vec<u8>
where
    C: DeviceCallbacks,
    P: PowerHooks,
    G: InterruptGate,
{
    let mock = *device.registers();
    mock.deliver_setup(setup);
    device.on_interrupt();

    let mut data = Vec::new();
    for _ in 0..64 {
        if !mock.in_enabled(0) {
            break;
        }
        data.extend(mock.complete_in(0));
        device.on_interrupt();
    }
    mock.complete_out(0, &[]);
    device.on_interrupt();
    data
}

/// Reset, address 5, configuration 1
pub fn configure<C, P, G>(device: &mut UsbDevice<&MockUsb, C, P, G>)
where
    C: DeviceCallbacks,
    P: PowerHooks,
    G: InterruptGate,
{
    bus_reset(device);
    control_no_data(device, &SetupPacket::set_address(5));
    control_no_data(device, &SetupPacket::set_configuration(1));
    assert_eq!(device.state(), DeviceState::Configured);
}

/// Host initialised with port power on
pub fn new_host<'a>(mock: &'a MockUsb, clock: &'a ManualClock) -> TestHost<'a> {
    new_host_with(mock, clock, HostConfig::default())
}

pub fn new_host_with<'a>(mock: &'a MockUsb, clock: &'a ManualClock, config: HostConfig) -> TestHost<'a> {
    let mut host = UsbHost::new(mock, config, MockVbus::default(), clock, channel_scratch());
    host.init().expect("host init");
    host
}

/// Attach a device and walk the port through debounce and reset
pub fn connect_device(host: &mut TestHost<'_>, clock: &ManualClock, low_speed: bool) {
    let mock = *host.registers();
    let debounce = host.config().debounce_ms;
    let reset = host.config().reset_ms;

    mock.attach();
    host.on_interrupt();
    assert_eq!(host.port_state(), PortState::Debouncing);

    clock.advance(debounce);
    host.poll();
    assert_eq!(host.port_state(), PortState::Resetting);

    clock.advance(reset);
    host.poll();
    mock.enable_port(low_speed);
    host.on_interrupt();
    assert_eq!(host.port_state(), PortState::Connected);
}
