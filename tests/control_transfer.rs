//! EP0 control transfer tests
//!
//! Drive the control state machine through the simulated core: SETUP
//! packets land in the SETUP ring, IN packets are taken from the DMA
//! address the driver programmed, and status stages are acknowledged the
//! way a host would.

mod common;

use common::*;
use efm32_usb::endpoint::EndpointState;
use efm32_usb::otg::{self, dcfg, deptsiz, DepCtl};
use efm32_usb::transfer::{descriptor_type, feature, request, RequestType};
use efm32_usb::{
    ControlEndpoint, DeviceState, DmaBuffer, EndpointAddress, SetupPacket, SetupResult, TransferType, UsbError,
};

const VENDOR_OUT: u8 = 0x40;
const VENDOR_IN: u8 = 0xC0;
const VENDOR_WRITE: u8 = 0x01;
const VENDOR_READ: u8 = 0x02;
const VENDOR_READ_REFUSED: u8 = 0x03;
const VENDOR_READ_EMPTY: u8 = 0x04;

thread_local! {
    static OUT_STAGE: TestBuffer = TestBuffer::new(64);
    static IN_STAGE: TestBuffer = TestBuffer::with_data(&pattern(100));
    static DONE: &'static Recorder = Recorder::new();
    static REFUSED: &'static Recorder = Recorder::refusing();
}

fn vendor(request_type: u8, request: u8, length: u16) -> SetupPacket {
    SetupPacket {
        request_type,
        request,
        value: 0,
        index: 0,
        length,
    }
}

fn standard(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
    SetupPacket {
        request_type,
        request,
        value,
        index,
        length,
    }
}

/// Vendor requests served through the control endpoint interface
fn vendor_handler(setup: &SetupPacket, ep0: &mut dyn ControlEndpoint) -> SetupResult {
    if setup.kind() != RequestType::Vendor {
        return SetupResult::Unhandled;
    }
    let result = match setup.request {
        VENDOR_WRITE => {
            let buffer = OUT_STAGE.with(|b| *b);
            ep0.read(buffer.dma(), setup.length as usize, DONE.with(|r| r.callback()))
        }
        VENDOR_READ => {
            let buffer = IN_STAGE.with(|b| *b);
            ep0.write(buffer.read_only(), 100, DONE.with(|r| r.callback()))
        }
        VENDOR_READ_REFUSED => {
            let buffer = IN_STAGE.with(|b| *b);
            ep0.write(buffer.read_only(), 4, REFUSED.with(|r| r.callback()))
        }
        VENDOR_READ_EMPTY => ep0.write(DmaBuffer::empty(), 0, DONE.with(|r| r.callback())),
        _ => return SetupResult::Unhandled,
    };
    match result {
        Ok(()) => SetupResult::Accepted,
        Err(_) => SetupResult::Rejected,
    }
}

fn reject_everything(_setup: &SetupPacket, _ep0: &mut dyn ControlEndpoint) -> SetupResult {
    SetupResult::Rejected
}

fn ep0_stalled(mock: &MockUsb) -> bool {
    mock.in_stalled(0) && mock.out_stalled(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Device descriptor fits one packet and the host asked for more
    #[test]
    fn test_get_device_descriptor() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::default());
        bus_reset(&mut device);

        let data = control_in(
            &mut device,
            &SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 0, 64),
        );

        assert_eq!(data, DEVICE_DESCRIPTOR.0.to_vec());
        assert_eq!(device.state(), DeviceState::Default);
        assert_eq!(device.endpoint(EndpointAddress::EP0_IN).map(|e| e.state), Some(EndpointState::Idle));
        assert_eq!(device.stats().snapshot().setup_packets, 1);
    }

    /// The response is cut to wLength
    #[test]
    fn test_descriptor_truncated_to_request() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::default());
        bus_reset(&mut device);

        let data = control_in(
            &mut device,
            &SetupPacket::get_descriptor(descriptor_type::CONFIGURATION, 0, 0, 9),
        );
        assert_eq!(data, CONFIG_DESCRIPTOR.0[..9].to_vec());
    }

    /// EP0 moves one packet per arm
    #[test]
    fn test_multi_packet_data_stage() {
        let mock = MockUsb::new();
        let config = device_config().ep0_max_packet(8);
        let mut device = new_device_with(&mock, config, TestApp::default());
        bus_reset(&mut device);
        mock.clear_write_log();

        let data = control_in(
            &mut device,
            &SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 0, 18),
        );

        assert_eq!(data, DEVICE_DESCRIPTOR.0.to_vec());
        let sizes: Vec<u32> = mock
            .writes_to(otg::dieptsiz(0))
            .iter()
            .map(|v| v & deptsiz::EP0_XFERSIZE_MASK)
            .collect();
        assert_eq!(sizes, vec![8, 8, 2]);
    }

    /// A response that ends on a packet boundary short of wLength is
    /// terminated with a zero-length packet
    #[test]
    fn test_zero_length_packet_terminates_short_response() {
        let mock = MockUsb::new();
        let config = device_config().ep0_max_packet(32);
        let mut device = new_device_with(&mock, config, TestApp::default());
        bus_reset(&mut device);
        mock.clear_write_log();

        let data = control_in(
            &mut device,
            &SetupPacket::get_descriptor(descriptor_type::CONFIGURATION, 0, 0, 255),
        );

        assert_eq!(data.len(), 32);
        let sizes: Vec<u32> = mock
            .writes_to(otg::dieptsiz(0))
            .iter()
            .map(|v| v & deptsiz::EP0_XFERSIZE_MASK)
            .collect();
        assert_eq!(sizes, vec![32, 0]);
    }

    /// No zero-length packet when the response fills wLength exactly
    #[test]
    fn test_no_zlp_when_request_is_filled() {
        let mock = MockUsb::new();
        let config = device_config().ep0_max_packet(32);
        let mut device = new_device_with(&mock, config, TestApp::default());
        bus_reset(&mut device);
        mock.clear_write_log();

        let data = control_in(
            &mut device,
            &SetupPacket::get_descriptor(descriptor_type::CONFIGURATION, 0, 0, 32),
        );

        assert_eq!(data.len(), 32);
        assert_eq!(mock.writes_to(otg::dieptsiz(0)).len(), 1);
    }

    #[test]
    fn test_string_descriptors() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::default());
        bus_reset(&mut device);

        let languages = control_in(
            &mut device,
            &SetupPacket::get_descriptor(descriptor_type::STRING, 0, 0, 255),
        );
        assert_eq!(languages, LANGUAGES.0.to_vec());

        let manufacturer = control_in(
            &mut device,
            &SetupPacket::get_descriptor(descriptor_type::STRING, 1, 0x0409, 255),
        );
        assert_eq!(manufacturer, MANUFACTURER.0.to_vec());

        // Index past the table
        mock.deliver_setup(&SetupPacket::get_descriptor(descriptor_type::STRING, 7, 0x0409, 255));
        device.on_interrupt();
        assert!(ep0_stalled(&mock));
    }

    #[test]
    fn test_set_address() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::default());
        bus_reset(&mut device);

        control_no_data(&mut device, &SetupPacket::set_address(5));

        assert_eq!(device.address(), 5);
        assert_eq!(device.state(), DeviceState::Addressed);
        assert_eq!((mock.peek(otg::DCFG) & dcfg::DAD_MASK) >> dcfg::DAD_SHIFT, 5);
        // The status stage went out as a zero-length IN packet
        assert_eq!(mock.writes_to(otg::dieptsiz(0)).last().map(|v| v & 0x7F), Some(0));
    }

    #[test]
    fn test_set_configuration() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::default());
        configure(&mut device);

        assert_eq!(device.last_state(), DeviceState::Addressed);
        assert!(device
            .callbacks()
            .transitions
            .contains(&(DeviceState::Addressed, DeviceState::Configured)));

        let value = control_in(&mut device, &standard(0x80, request::GET_CONFIGURATION, 0, 0, 1));
        assert_eq!(value, vec![1]);

        // Configuration 0 goes back to ADDRESSED
        control_no_data(&mut device, &SetupPacket::set_configuration(0));
        assert_eq!(device.state(), DeviceState::Addressed);
    }

    /// Unknown configuration values are refused with a protocol stall
    #[test]
    fn test_bad_configuration_stalls() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::default());
        bus_reset(&mut device);
        control_no_data(&mut device, &SetupPacket::set_address(5));

        mock.deliver_setup(&SetupPacket::set_configuration(9));
        device.on_interrupt();

        assert!(ep0_stalled(&mock));
        assert_eq!(device.state(), DeviceState::Addressed);
        assert_eq!(device.stats().snapshot().control_stalls, 1);
    }

    /// The next SETUP clears a protocol stall
    #[test]
    fn test_setup_clears_protocol_stall() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::default());
        bus_reset(&mut device);

        mock.deliver_setup(&vendor(VENDOR_IN, 0x55, 4));
        device.on_interrupt();
        assert!(ep0_stalled(&mock));

        control_no_data(&mut device, &SetupPacket::set_address(3));
        assert!(!mock.in_stalled(0));
        assert!(!mock.out_stalled(0));
        assert_eq!(device.address(), 3);
    }

    /// Class and vendor requests nobody claims are stalled
    #[test]
    fn test_unhandled_vendor_request_stalls() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::default());
        bus_reset(&mut device);

        mock.deliver_setup(&vendor(VENDOR_OUT, 0x42, 0));
        device.on_interrupt();

        assert!(ep0_stalled(&mock));
        assert_eq!(device.callbacks().setups.len(), 1);
        assert_eq!(device.last_setup().request, 0x42);
    }

    /// The application sees standard requests first and may refuse them
    #[test]
    fn test_application_rejects_standard_request() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::with_handler(reject_everything));
        bus_reset(&mut device);

        mock.deliver_setup(&SetupPacket::set_address(5));
        device.on_interrupt();

        assert!(ep0_stalled(&mock));
        assert_eq!(device.address(), 0);
        assert_eq!(device.state(), DeviceState::Default);
    }

    /// OUT data stage through the control endpoint interface
    #[test]
    fn test_vendor_out_data_stage() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::with_handler(vendor_handler));
        bus_reset(&mut device);
        let payload = [0xDE, 0xAD, 0xBE, 0xEF, 1, 2, 3, 4, 5, 6, 7, 8];

        mock.deliver_setup(&vendor(VENDOR_OUT, VENDOR_WRITE, payload.len() as u16));
        device.on_interrupt();
        assert!(mock.out_enabled(0));
        assert_eq!(mock.armed_out(0), 64);

        mock.complete_out(0, &payload);
        device.on_interrupt();
        // Short packet ends the data stage; status goes IN
        assert!(mock.in_enabled(0));
        assert_eq!(mock.armed_in(0), 0);

        mock.complete_in(0);
        device.on_interrupt();

        let done = DONE.with(|r| *r);
        assert_eq!(done.last(), Some((Ok(()), payload.len(), 0)));
        assert_eq!(OUT_STAGE.with(|b| b.bytes())[..payload.len()], payload);
    }

    /// IN data stage with a completion callback
    #[test]
    fn test_vendor_in_data_stage() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::with_handler(vendor_handler));
        bus_reset(&mut device);

        let data = control_in(&mut device, &vendor(VENDOR_IN, VENDOR_READ, 100));

        assert_eq!(data, pattern(100));
        let done = DONE.with(|r| *r);
        assert_eq!(done.last(), Some((Ok(()), 100, 0)));
    }

    /// An empty response goes straight to the status stage
    #[test]
    fn test_empty_in_response() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::with_handler(vendor_handler));
        bus_reset(&mut device);

        mock.deliver_setup(&vendor(VENDOR_IN, VENDOR_READ_EMPTY, 64));
        device.on_interrupt();
        assert!(mock.in_enabled(0));
        assert_eq!(mock.armed_in(0), 0);

        assert!(mock.complete_in(0).is_empty());
        device.on_interrupt();

        let done = DONE.with(|r| *r);
        assert_eq!(done.calls(), vec![(Ok(()), 0, 0)]);
        assert!(device.endpoint(EndpointAddress::EP0_IN).is_some_and(|e| e.is_idle()));
    }

    /// A completion callback reporting failure stalls EP0
    #[test]
    fn test_callback_error_stalls() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::with_handler(vendor_handler));
        bus_reset(&mut device);

        let data = control_in(&mut device, &vendor(VENDOR_IN, VENDOR_READ_REFUSED, 4));

        assert_eq!(data, pattern(4));
        assert!(ep0_stalled(&mock));
        assert_eq!(REFUSED.with(|r| r.count()), 1);
    }

    /// A new SETUP aborts the control transfer in progress
    #[test]
    fn test_new_setup_cancels_data_stage() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::with_handler(vendor_handler));
        bus_reset(&mut device);

        mock.deliver_setup(&vendor(VENDOR_IN, VENDOR_READ, 100));
        device.on_interrupt();
        assert_eq!(mock.armed_in(0), 64);
        let flushes = mock.tx_flushes();
        mock.clear_write_log();

        control_no_data(&mut device, &SetupPacket::set_address(9));

        let done = DONE.with(|r| *r);
        assert_eq!(done.last(), Some((Err(UsbError::EndpointAborted), 0, 100)));
        assert!(mock.tx_flushes() > flushes);
        // The stale IN packet was NAKed and disabled before the flush
        let ctl_writes = mock.writes_to(otg::diepctl(0));
        let nak = ctl_writes.iter().position(|v| v & DepCtl::SNAK.bits() != 0);
        let disable = ctl_writes.iter().position(|v| v & DepCtl::EPDIS.bits() != 0);
        assert!(matches!((nak, disable), (Some(n), Some(d)) if n <= d));
        assert_eq!(device.address(), 9);
    }

    /// Back-to-back SETUPs: only the newest in the ring is served
    #[test]
    fn test_newest_setup_in_ring_wins() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::default());
        bus_reset(&mut device);

        mock.deliver_setup(&SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 0, 18));
        mock.deliver_setup(&SetupPacket::set_address(7));
        device.on_interrupt();

        assert_eq!(device.last_setup(), SetupPacket::set_address(7));
        mock.complete_in(0);
        device.on_interrupt();
        assert_eq!(device.address(), 7);
    }

    #[test]
    fn test_get_status_device() {
        let mock = MockUsb::new();
        let app = TestApp {
            self_powered: Some(true),
            ..TestApp::default()
        };
        let mut device = new_device(&mock, app);
        configure(&mut device);

        let status = control_in(&mut device, &standard(0x80, request::GET_STATUS, 0, 0, 2));
        assert_eq!(status, vec![0x01, 0x00]);

        control_no_data(
            &mut device,
            &standard(0x00, request::SET_FEATURE, feature::DEVICE_REMOTE_WAKEUP, 0, 0),
        );
        assert!(device.remote_wakeup_enabled());

        let status = control_in(&mut device, &standard(0x80, request::GET_STATUS, 0, 0, 2));
        assert_eq!(status, vec![0x03, 0x00]);

        control_no_data(
            &mut device,
            &standard(0x00, request::CLEAR_FEATURE, feature::DEVICE_REMOTE_WAKEUP, 0, 0),
        );
        assert!(!device.remote_wakeup_enabled());
    }

    /// Self-powered falls back to the configuration when the application
    /// has no answer
    #[test]
    fn test_get_status_uses_config_fallback() {
        let mock = MockUsb::new();
        let config = device_config().self_powered(true);
        let mut device = new_device_with(&mock, config, TestApp::default());
        bus_reset(&mut device);

        let status = control_in(&mut device, &standard(0x80, request::GET_STATUS, 0, 0, 2));
        assert_eq!(status, vec![0x01, 0x00]);
    }

    /// ENDPOINT_HALT through SET_FEATURE, GET_STATUS and CLEAR_FEATURE
    #[test]
    fn test_endpoint_halt_requests() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::default());
        let ep = EndpointAddress::from_raw(0x81);
        device.add_endpoint(ep, TransferType::Bulk, 64, 1).unwrap();
        configure(&mut device);

        control_no_data(
            &mut device,
            &standard(0x02, request::SET_FEATURE, feature::ENDPOINT_HALT, 0x81, 0),
        );
        assert!(mock.in_stalled(1));

        let status = control_in(&mut device, &standard(0x82, request::GET_STATUS, 0, 0x81, 2));
        assert_eq!(status, vec![0x01, 0x00]);

        control_no_data(
            &mut device,
            &standard(0x02, request::CLEAR_FEATURE, feature::ENDPOINT_HALT, 0x81, 0),
        );
        assert!(!mock.in_stalled(1));

        let status = control_in(&mut device, &standard(0x82, request::GET_STATUS, 0, 0x81, 2));
        assert_eq!(status, vec![0x00, 0x00]);
    }

    /// Endpoint requests before configuration are refused
    #[test]
    fn test_endpoint_status_requires_configuration() {
        let mock = MockUsb::new();
        let mut device = new_device(&mock, TestApp::default());
        device
            .add_endpoint(EndpointAddress::from_raw(0x81), TransferType::Bulk, 64, 1)
            .unwrap();
        bus_reset(&mut device);

        mock.deliver_setup(&standard(0x82, request::GET_STATUS, 0, 0x81, 2));
        device.on_interrupt();
        assert!(ep0_stalled(&mock));
    }
}
