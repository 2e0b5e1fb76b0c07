// crates/bacnet-rs/tests/segmentation_test.rs
//! Windowed segmentation end to end: segmented requests, segmented
//! responses, lost acknowledgements and out-of-order segments.

mod support;

use bacnet_rs::apdu::{Apdu, ConfirmedRequest};
use bacnet_rs::app::{read_property_iocb, write_property_iocb, BacnetObject};
use bacnet_rs::iocb::IoState;
use bacnet_rs::primitives::{object_type, ObjectId};
use bacnet_rs::services::{property_id, PropertyValue, ServiceBody};
use bacnet_rs::types::{confirmed_service, Segmentation};
use support::{apdu_of, TestNet};

const PAYLOAD_LEN: usize = 4096;

fn segmented_pair(
    net: &mut TestNet,
    client_tweak: impl FnOnce(&mut bacnet_rs::device::DeviceConfig),
) -> (usize, usize) {
    let client = net.add_device(900, 1, |config| {
        config.segmentation_supported = Segmentation::SegmentedBoth;
        config.proposed_window_size = 4;
        config.max_segments_accepted = Some(64);
        config.max_apdu_length_accepted = 480;
        client_tweak(config);
    });
    let server = net.add_device(901, 2, |config| {
        config.segmentation_supported = Segmentation::SegmentedBoth;
        config.proposed_window_size = 4;
        config.max_segments_accepted = Some(64);
        config.max_apdu_length_accepted = 480;
    });
    net.devices[server].with_app(0, |app, _| {
        app.add_object(
            BacnetObject::new(ObjectId::new(object_type::OCTETSTRING_VALUE, 2), "blob-2")
                .with_property(
                    property_id::PRESENT_VALUE,
                    PropertyValue::OctetString(vec![0x5A; PAYLOAD_LEN]),
                ),
        )
        .unwrap();
    });

    // discovery primes the client's capability record for the server
    net.devices[client].with_app(0, |app, ctx| app.who_is(None, None, None, ctx));
    net.exchange();
    net.history.clear();
    (client, server)
}

fn segment_sequence_numbers(net: &TestNet) -> (Vec<u8>, Vec<u8>) {
    let mut segments = Vec::new();
    let mut acks = Vec::new();
    for (_, apdu) in net.apdu_history() {
        match apdu {
            Apdu::ConfirmedRequest(request) if request.segmented => {
                segments.push(request.sequence_number.unwrap());
            }
            Apdu::SegmentAck(ack) => acks.push(ack.sequence_number),
            _ => {}
        }
    }
    (segments, acks)
}

#[test]
fn test_segmented_write_runs_the_window_protocol() {
    let mut net = TestNet::new();
    let (client, server) = segmented_pair(&mut net, |_| {});
    let server_address = net.devices[server].address.clone();

    let payload = vec![0xC3u8; PAYLOAD_LEN];
    let iocb = write_property_iocb(
        server_address,
        ObjectId::new(object_type::OCTETSTRING_VALUE, 2),
        property_id::PRESENT_VALUE,
        PropertyValue::OctetString(payload.clone()),
    );
    net.devices[client]
        .with_app(0, |app, ctx| app.request_io(iocb.clone(), None, ctx))
        .unwrap();
    net.exchange();

    assert_eq!(iocb.io_state(), IoState::Completed);

    // nine segments at 480 octets each, acknowledged at the window
    // boundaries and at the end
    let (segments, acks) = segment_sequence_numbers(&net);
    assert_eq!(segments, vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(acks, vec![0, 4, 8]);

    // the reassembled value matches what was sent
    net.devices[server].with_app(0, |app, _| {
        let object = app
            .object(ObjectId::new(object_type::OCTETSTRING_VALUE, 2))
            .unwrap();
        assert_eq!(
            object.read(property_id::PRESENT_VALUE),
            Some(PropertyValue::OctetString(payload.clone()))
        );
    });
}

#[test]
fn test_segmented_write_survives_a_lost_segment_ack() {
    let mut net = TestNet::new();
    // retransmit comfortably before the server abandons the transfer
    let (client, server) = segmented_pair(&mut net, |config| {
        config.segment_timeout_ms = 1000;
    });
    let server_address = net.devices[server].address.clone();

    // lose the mid-window acknowledgement exactly once
    let mut dropped = false;
    net.drop_filter = Some(Box::new(move |packet| {
        if dropped {
            return false;
        }
        match apdu_of(packet) {
            Some(Apdu::SegmentAck(ack)) if ack.server && ack.sequence_number == 4 => {
                dropped = true;
                true
            }
            _ => false,
        }
    }));

    let payload = vec![0x17u8; PAYLOAD_LEN];
    let iocb = write_property_iocb(
        server_address,
        ObjectId::new(object_type::OCTETSTRING_VALUE, 2),
        property_id::PRESENT_VALUE,
        PropertyValue::OctetString(payload.clone()),
    );
    net.devices[client]
        .with_app(0, |app, ctx| app.request_io(iocb.clone(), None, ctx))
        .unwrap();
    net.exchange();

    // stalled: the client never saw the ack for the second window
    assert_eq!(iocb.io_state(), IoState::Active);

    // the segment timer retransmits the unacknowledged window; the
    // server's negative acks resynchronise the exchange
    net.advance(2_000);
    assert_eq!(iocb.io_state(), IoState::Completed);

    let retransmitted = net
        .apdu_history()
        .iter()
        .filter(|(_, apdu)| {
            matches!(apdu, Apdu::ConfirmedRequest(request) if request.sequence_number == Some(1))
        })
        .count();
    assert_eq!(retransmitted, 2);

    net.devices[server].with_app(0, |app, _| {
        let object = app
            .object(ObjectId::new(object_type::OCTETSTRING_VALUE, 2))
            .unwrap();
        assert_eq!(
            object.read(property_id::PRESENT_VALUE),
            Some(PropertyValue::OctetString(payload.clone()))
        );
    });
}

#[test]
fn test_segmented_read_reassembles_the_response() {
    let mut net = TestNet::new();
    let (client, server) = segmented_pair(&mut net, |_| {});
    let server_address = net.devices[server].address.clone();

    let iocb = read_property_iocb(
        server_address,
        ObjectId::new(object_type::OCTETSTRING_VALUE, 2),
        property_id::PRESENT_VALUE,
    );
    net.devices[client]
        .with_app(0, |app, ctx| app.request_io(iocb.clone(), None, ctx))
        .unwrap();
    net.exchange();

    assert_eq!(iocb.io_state(), IoState::Completed);
    let response = iocb.response().expect("response delivered");
    match response.body {
        ServiceBody::ReadPropertyAck(ack) => {
            assert_eq!(ack.value, PropertyValue::OctetString(vec![0x5A; PAYLOAD_LEN]));
        }
        other => panic!("unexpected response {:?}", other),
    }

    // the response went out in segments and every segment arrived
    let segmented_acks = net
        .apdu_history()
        .iter()
        .filter(|(_, apdu)| matches!(apdu, Apdu::ComplexAck(ack) if ack.segmented))
        .count();
    assert_eq!(segmented_acks, 9);
}

#[test]
fn test_out_of_order_segment_draws_a_negative_ack() {
    let mut net = TestNet::new();
    let client = net.add_device(900, 1, |_| {});
    let server = net.add_device(901, 2, |config| {
        config.segmentation_supported = Segmentation::SegmentedBoth;
        config.proposed_window_size = 4;
    });
    let client_address = net.devices[client].address.clone();

    let segment = |sequence_number: u8| {
        let mut request = ConfirmedRequest::new(confirmed_service::WRITE_PROPERTY, vec![0xAB; 16]);
        request.invoke_id = Some(9);
        request.segmented = true;
        request.more_follows = true;
        request.segmented_response_accepted = true;
        request.sequence_number = Some(sequence_number);
        request.window_size = Some(4);
        Apdu::ConfirmedRequest(request)
    };

    net.inject_apdu(server, &client_address, &segment(0));
    net.exchange();
    let (_, acks) = segment_sequence_numbers(&net);
    assert_eq!(acks, vec![0]);

    // sequence number 1 goes missing; 2 arrives instead
    net.inject_apdu(server, &client_address, &segment(2));
    net.exchange();

    let nak = net
        .apdu_history()
        .into_iter()
        .rev()
        .find_map(|(_, apdu)| match apdu {
            Apdu::SegmentAck(ack) => Some(ack),
            _ => None,
        })
        .expect("segment ack present");
    assert!(nak.negative_ack);
    assert!(nak.server);
    // the negative ack names the last in-order segment
    assert_eq!(nak.sequence_number, 0);
    assert_eq!(nak.actual_window_size, 4);
}
