use usb_link_model::usb::engine::{Endpoint, Pipe, Status};
use usb_link_model::usb::error::TransferError;
use usb_link_model::usb::packet::Packet;
use usb_link_model::usb::request::{
    Direction, Recipient, RequestType, SetupPacket, DEVICE_DESCRIPTOR,
};
use usb_link_model::usb::session::BusSession;
use usb_link_model::usb::sim::{Reply, ScriptedDevice, SimBus, Source};
use usb_link_model::usb::timing::BusConfig;
use usb_link_model::usb::types::{Data, DataPID, HandShake};

const ADDRESS: u8 = 3;

fn session<I: IntoIterator<Item = Reply>>(replies: I) -> BusSession<SimBus<ScriptedDevice>> {
    let config = BusConfig::default().with_max_packet_size(8);
    let bus = SimBus::new(ScriptedDevice::new(replies), config.speed);
    BusSession::new(bus, config)
}

fn host_data(s: &BusSession<SimBus<ScriptedDevice>>) -> Vec<Data> {
    s.transport()
        .packets()
        .into_iter()
        .filter_map(|(source, p)| match (source, p) {
            (Source::Host, Packet::Data(data)) => Some(data),
            _ => None,
        })
        .collect()
}

#[test]
fn descriptor_read_spans_several_packets() {
    let descriptor: Vec<u8> = (1..=18).collect();
    let mut s = session(vec![
        Reply::ack(),
        Reply::data(DataPID::Data1, &descriptor[..8]),
        Reply::data(DataPID::Data0, &descriptor[8..16]),
        Reply::data(DataPID::Data1, &descriptor[16..]),
        Reply::ack(),
    ]);
    let setup = SetupPacket::get_descriptor(DEVICE_DESCRIPTOR, 0, 64);
    let outcome = s.control_read(ADDRESS, &setup);

    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(outcome.received_data, descriptor);
    assert_eq!(outcome.attempts, 5);

    let sent = host_data(&s);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].payload, setup.to_bytes().to_vec());
    assert_eq!(
        sent[1],
        Data {
            pid: DataPID::Data1,
            payload: vec![]
        }
    );
    assert_eq!(s.transport().device().pending(), 0);
}

#[test]
fn read_stops_at_the_requested_length() {
    let mut s = session(vec![
        Reply::ack(),
        Reply::nak(),
        Reply::data(DataPID::Data1, &[0x01, 0x00]),
        Reply::ack(),
    ]);
    let setup = SetupPacket::new(
        Direction::In,
        RequestType::Standard,
        Recipient::Device,
        0,
    )
    .with_length(2);
    let outcome = s.control_read(ADDRESS, &setup);
    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(outcome.received_data, vec![0x01, 0x00]);
    assert_eq!(outcome.attempts, 4);
}

#[test]
fn read_longer_than_requested_is_refused() {
    let mut s = session(vec![
        Reply::ack(),
        Reply::data(DataPID::Data1, &[1, 2, 3, 4]),
        Reply::ack(),
    ]);
    let setup = SetupPacket::get_descriptor(DEVICE_DESCRIPTOR, 0, 2);
    let outcome = s.control_read(ADDRESS, &setup);
    assert_eq!(outcome.status, Status::Error);
    assert!(matches!(
        outcome.error,
        Some(TransferError::ProtocolViolation(_))
    ));
    assert!(outcome.received_data.is_empty());
    assert_eq!(outcome.attempts, 2);
    // No status stage.
    assert_eq!(host_data(&s).len(), 1);
    assert_eq!(s.transport().device().pending(), 1);
}

#[test]
fn stall_in_the_data_stage_ends_the_read() {
    let mut s = session(vec![Reply::ack(), Reply::stall()]);
    let outcome = s.control_read(ADDRESS, &SetupPacket::get_descriptor(DEVICE_DESCRIPTOR, 0, 18));
    assert_eq!(outcome.status, Status::Stalled);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(host_data(&s).len(), 1);
}

#[test]
fn write_without_data_goes_straight_to_status() {
    let mut s = session(vec![Reply::ack(), Reply::data(DataPID::Data1, &[])]);
    let outcome = s.control_write(ADDRESS, &SetupPacket::set_configuration(1), None);
    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(
        s.transport().packets().last(),
        Some(&(Source::Host, Packet::HandShake(HandShake::Ack)))
    );
    let ep = Endpoint::control(ADDRESS);
    assert_eq!(s.endpoint_state(ep, Pipe::Control).toggle, DataPID::Data0);
}

#[test]
fn write_data_stage_starts_at_data1() {
    let payload = [0x80, 0x25, 0x00, 0x00, 0x00, 0x00, 0x08];
    let mut s = session(vec![
        Reply::ack(),
        Reply::ack(),
        Reply::data(DataPID::Data1, &[]),
    ]);
    let setup = SetupPacket::new(
        Direction::Out,
        RequestType::Class,
        Recipient::Interface,
        0x20,
    )
    .with_length(payload.len() as u16);
    let outcome = s.control_write(ADDRESS, &setup, Some(&payload));
    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(outcome.attempts, 3);

    let sent = host_data(&s);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].pid, DataPID::Data0);
    assert_eq!(
        sent[1],
        Data {
            pid: DataPID::Data1,
            payload: payload.to_vec()
        }
    );
}

#[test]
fn status_stage_must_be_empty() {
    let mut s = session(vec![Reply::ack(), Reply::data(DataPID::Data1, &[0])]);
    let outcome = s.control_write(ADDRESS, &SetupPacket::set_address(9), None);
    assert_eq!(outcome.status, Status::Error);
    assert!(matches!(
        outcome.error,
        Some(TransferError::ProtocolViolation(_))
    ));
}

#[test]
fn mismatched_requests_are_refused_before_touching_the_bus() {
    let mut s = session(vec![]);
    let outcome = s.control_write(ADDRESS, &SetupPacket::set_configuration(1), Some(&[1]));
    assert!(matches!(
        outcome.error,
        Some(TransferError::InvalidRequest(_))
    ));
    let outcome = s.control_read(ADDRESS, &SetupPacket::set_configuration(1));
    assert!(matches!(
        outcome.error,
        Some(TransferError::InvalidRequest(_))
    ));
    assert_eq!(outcome.attempts, 0);
    assert!(s.transport().traffic().is_empty());
}
