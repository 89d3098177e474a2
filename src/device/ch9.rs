//! Standard (chapter 9) requests not taken by the application

use super::{DeviceCallbacks, DeviceState, Engine, SetupResult};
use crate::otg::{self, dcfg, RegisterBlock};
use crate::transfer::{descriptor_type, feature, request, DmaBuffer, EndpointAddress, Recipient, SetupPacket};

pub(super) fn handle<R: RegisterBlock>(
    engine: &mut Engine<R>,
    setup: &SetupPacket,
    callbacks: &mut dyn DeviceCallbacks,
) -> SetupResult {
    match (setup.request, setup.is_in()) {
        (request::GET_STATUS, true) => get_status(engine, setup, callbacks),
        (request::CLEAR_FEATURE, false) => set_feature(engine, setup, false),
        (request::SET_FEATURE, false) => set_feature(engine, setup, true),
        (request::SET_ADDRESS, false) => set_address(engine, setup, callbacks),
        (request::GET_DESCRIPTOR, true) => get_descriptor(engine, setup),
        (request::GET_CONFIGURATION, true) => {
            let value = engine.configuration;
            reply(engine, &[value])
        }
        (request::SET_CONFIGURATION, false) => set_configuration(engine, setup, callbacks),
        (request::GET_INTERFACE, true) if engine.state == DeviceState::Configured => reply(engine, &[0]),
        (request::SET_INTERFACE, false) if engine.state == DeviceState::Configured && setup.value == 0 => {
            SetupResult::Accepted
        }
        _ => SetupResult::Rejected,
    }
}

/// Answer with a short response from the scratch area
fn reply<R: RegisterBlock>(engine: &mut Engine<R>, bytes: &[u8]) -> SetupResult {
    let buffer = engine.scratch(bytes);
    match engine.ep0_write(buffer, bytes.len(), None) {
        Ok(()) => SetupResult::Accepted,
        Err(_) => SetupResult::Rejected,
    }
}

fn get_status<R: RegisterBlock>(
    engine: &mut Engine<R>,
    setup: &SetupPacket,
    callbacks: &mut dyn DeviceCallbacks,
) -> SetupResult {
    let status: u16 = match setup.recipient() {
        Recipient::Device => {
            let self_powered = callbacks.is_self_powered().unwrap_or(engine.config.self_powered);
            u16::from(self_powered) | (u16::from(engine.remote_wakeup_enabled) << 1)
        }
        Recipient::Interface if engine.state == DeviceState::Configured => 0,
        Recipient::Endpoint => {
            let address = EndpointAddress::from_raw(setup.index as u8);
            if address.number() != 0 && engine.state != DeviceState::Configured {
                return SetupResult::Rejected;
            }
            match engine.is_stalled(address) {
                Some(halted) => u16::from(halted),
                None => return SetupResult::Rejected,
            }
        }
        _ => return SetupResult::Rejected,
    };
    reply(engine, &status.to_le_bytes())
}

fn set_feature<R: RegisterBlock>(engine: &mut Engine<R>, setup: &SetupPacket, set: bool) -> SetupResult {
    match (setup.recipient(), setup.value) {
        (Recipient::Device, feature::DEVICE_REMOTE_WAKEUP) => {
            engine.remote_wakeup_enabled = set;
            SetupResult::Accepted
        }
        (Recipient::Endpoint, feature::ENDPOINT_HALT) => {
            let address = EndpointAddress::from_raw(setup.index as u8);
            if address.number() == 0 {
                return SetupResult::Accepted;
            }
            if engine.state != DeviceState::Configured {
                return SetupResult::Rejected;
            }
            let result = if set {
                engine.abort(address).and_then(|()| engine.stall(address))
            } else {
                engine.unstall(address)
            };
            match result {
                Ok(()) => SetupResult::Accepted,
                Err(_) => SetupResult::Rejected,
            }
        }
        _ => SetupResult::Rejected,
    }
}

fn set_address<R: RegisterBlock>(
    engine: &mut Engine<R>,
    setup: &SetupPacket,
    callbacks: &mut dyn DeviceCallbacks,
) -> SetupResult {
    if setup.value > 127 || engine.state == DeviceState::Configured {
        return SetupResult::Rejected;
    }
    let address = setup.value as u8;

    // The core applies the address itself once the status stage completes
    engine
        .regs
        .modify(otg::DCFG, |v| (v & !dcfg::DAD_MASK) | ((address as u32) << dcfg::DAD_SHIFT));
    engine.address = address;

    let state = if address == 0 { DeviceState::Default } else { DeviceState::Addressed };
    engine.set_state(state, callbacks);

    #[cfg(feature = "defmt")]
    defmt::debug!("USB address {}", address);

    SetupResult::Accepted
}

fn get_descriptor<R: RegisterBlock>(engine: &mut Engine<R>, setup: &SetupPacket) -> SetupResult {
    let kind = (setup.value >> 8) as u8;
    let index = (setup.value & 0xFF) as usize;
    let config = &engine.config;

    let descriptor = match kind {
        descriptor_type::DEVICE => Some(config.device_descriptor),
        descriptor_type::CONFIGURATION if index == 0 => Some(config.config_descriptor),
        descriptor_type::STRING => config.strings.get(index).copied(),
        _ => None,
    };

    match descriptor {
        Some(bytes) if !bytes.is_empty() => {
            match engine.ep0_write(DmaBuffer::from_static_ref(bytes), bytes.len(), None) {
                Ok(()) => SetupResult::Accepted,
                Err(_) => SetupResult::Rejected,
            }
        }
        _ => SetupResult::Rejected,
    }
}

fn set_configuration<R: RegisterBlock>(
    engine: &mut Engine<R>,
    setup: &SetupPacket,
    callbacks: &mut dyn DeviceCallbacks,
) -> SetupResult {
    if !matches!(engine.state, DeviceState::Addressed | DeviceState::Configured) {
        return SetupResult::Rejected;
    }

    let value = setup.value;
    if value == 0 {
        engine.configuration = 0;
        engine.set_state(DeviceState::Addressed, callbacks);
        return SetupResult::Accepted;
    }
    if value != engine.config.configuration_value as u16 {
        return SetupResult::Rejected;
    }

    // Selecting the active configuration again resets every data endpoint
    if engine.state == DeviceState::Configured {
        engine.set_state(DeviceState::Addressed, callbacks);
    }
    engine.configuration = value as u8;
    engine.set_state(DeviceState::Configured, callbacks);
    SetupResult::Accepted
}
