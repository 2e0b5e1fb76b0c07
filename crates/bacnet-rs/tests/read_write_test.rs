// crates/bacnet-rs/tests/read_write_test.rs
//! Confirmed request round trips: ReadProperty and WriteProperty,
//! per-peer serialisation, communication control, and retry exhaustion.

mod support;

use bacnet_rs::apdu::Apdu;
use bacnet_rs::app::{read_property_iocb, BacnetObject};
use bacnet_rs::device::CommunicationControl;
use bacnet_rs::iocb::{Iocb, IocbError, IoState};
use bacnet_rs::pdu::Address;
use bacnet_rs::primitives::{object_type, ObjectId};
use bacnet_rs::services::{
    property_id, DccEnableDisable, DccRequest, PropertyValue, ServiceBody, ServiceMessage,
};
use bacnet_rs::types::{confirmed_service, error_class, error_code, AbortReason, RejectReason};
use support::TestNet;

fn analog_input() -> BacnetObject {
    BacnetObject::new(ObjectId::new(object_type::ANALOG_INPUT, 1), "ai-1")
        .with_property(property_id::PRESENT_VALUE, PropertyValue::Real(20.5))
}

#[test]
fn test_small_read_property_round_trip() {
    let mut net = TestNet::new();
    let client = net.add_device(900, 1, |_| {});
    let server = net.add_device(901, 2, |_| {});
    net.devices[server].with_app(0, |app, _| {
        app.add_object(analog_input()).unwrap();
    });
    let server_address = net.devices[server].address.clone();

    let iocb = read_property_iocb(
        server_address,
        ObjectId::new(object_type::ANALOG_INPUT, 1),
        property_id::PRESENT_VALUE,
    );
    net.devices[client]
        .with_app(0, |app, ctx| app.request_io(iocb.clone(), None, ctx))
        .unwrap();
    net.exchange();

    // one unsegmented request with the first invoke ID
    let apdus = net.apdu_history();
    let request = apdus
        .iter()
        .find_map(|(_, apdu)| match apdu {
            Apdu::ConfirmedRequest(request) => Some(request.clone()),
            _ => None,
        })
        .expect("request on the wire");
    assert!(!request.segmented);
    assert!(!request.more_follows);
    assert_eq!(request.invoke_id, Some(1));
    assert_eq!(request.service, confirmed_service::READ_PROPERTY);

    assert_eq!(iocb.io_state(), IoState::Completed);
    let response = iocb.response().expect("response delivered");
    match response.body {
        ServiceBody::ReadPropertyAck(ack) => {
            assert_eq!(ack.value, PropertyValue::Real(20.5));
            assert_eq!(ack.property_identifier, property_id::PRESENT_VALUE);
        }
        other => panic!("unexpected response {:?}", other),
    }
}

#[test]
fn test_read_of_unknown_object_returns_an_error() {
    let mut net = TestNet::new();
    let client = net.add_device(900, 1, |_| {});
    let server = net.add_device(901, 2, |_| {});
    let server_address = net.devices[server].address.clone();

    let iocb = read_property_iocb(
        server_address,
        ObjectId::new(object_type::ANALOG_INPUT, 7),
        property_id::PRESENT_VALUE,
    );
    net.devices[client]
        .with_app(0, |app, ctx| app.request_io(iocb.clone(), None, ctx))
        .unwrap();
    net.exchange();

    assert_eq!(iocb.io_state(), IoState::Aborted);
    match iocb.error().expect("error recorded") {
        IocbError::Response(message) => match message.body {
            ServiceBody::ErrorResponse { error, .. } => {
                assert_eq!(error.class, error_class::OBJECT);
                assert_eq!(error.code, error_code::UNKNOWN_OBJECT);
            }
            other => panic!("unexpected error body {:?}", other),
        },
        other => panic!("unexpected error kind {:?}", other),
    }
}

#[test]
fn test_write_property_updates_the_object() {
    let mut net = TestNet::new();
    let client = net.add_device(900, 1, |_| {});
    let server = net.add_device(901, 2, |_| {});
    net.devices[server].with_app(0, |app, _| {
        app.add_object(analog_input()).unwrap();
    });
    let server_address = net.devices[server].address.clone();

    let iocb = bacnet_rs::app::write_property_iocb(
        server_address,
        ObjectId::new(object_type::ANALOG_INPUT, 1),
        property_id::PRESENT_VALUE,
        PropertyValue::Real(-3.25),
    );
    net.devices[client]
        .with_app(0, |app, ctx| app.request_io(iocb.clone(), None, ctx))
        .unwrap();
    net.exchange();

    assert_eq!(iocb.io_state(), IoState::Completed);
    net.devices[server].with_app(0, |app, _| {
        let object = app.object(ObjectId::new(object_type::ANALOG_INPUT, 1)).unwrap();
        assert_eq!(
            object.read(property_id::PRESENT_VALUE),
            Some(PropertyValue::Real(-3.25))
        );
    });
}

#[test]
fn test_per_peer_requests_are_serialised() {
    let mut net = TestNet::new();
    let client = net.add_device(900, 1, |_| {});
    let server = net.add_device(901, 2, |_| {});
    net.devices[server].with_app(0, |app, _| {
        app.add_object(analog_input()).unwrap();
    });
    let server_address = net.devices[server].address.clone();

    let first = read_property_iocb(
        server_address.clone(),
        ObjectId::new(object_type::ANALOG_INPUT, 1),
        property_id::PRESENT_VALUE,
    );
    let second = read_property_iocb(
        server_address,
        ObjectId::new(object_type::ANALOG_INPUT, 1),
        property_id::OBJECT_NAME,
    );
    net.devices[client].with_app(0, |app, ctx| {
        app.request_io(first.clone(), None, ctx).unwrap();
        app.request_io(second.clone(), None, ctx).unwrap();
    });
    net.exchange();

    assert_eq!(first.io_state(), IoState::Completed);
    assert_eq!(second.io_state(), IoState::Completed);

    // the second request must not hit the wire before the first one's
    // response came back
    let apdus = net.apdu_history();
    let mut first_response_seen = false;
    let mut request_count = 0;
    for (_, apdu) in &apdus {
        match apdu {
            Apdu::ConfirmedRequest(_) => {
                request_count += 1;
                if request_count == 2 {
                    assert!(first_response_seen, "second request overtook the first");
                }
            }
            Apdu::ComplexAck(_) => first_response_seen = true,
            _ => {}
        }
    }
    assert_eq!(request_count, 2);
}

#[test]
fn test_requests_to_different_peers_overlap() {
    let mut net = TestNet::new();
    let client = net.add_device(900, 1, |_| {});
    let server_b = net.add_device(901, 2, |_| {});
    let server_c = net.add_device(902, 3, |_| {});
    let address_b = net.devices[server_b].address.clone();
    let address_c = net.devices[server_c].address.clone();

    // swallow all frames so completions never arrive
    net.drop_filter = Some(Box::new(|_| true));

    let to_b = read_property_iocb(
        address_b,
        ObjectId::new(object_type::ANALOG_INPUT, 1),
        property_id::PRESENT_VALUE,
    );
    let to_c = read_property_iocb(
        address_c,
        ObjectId::new(object_type::ANALOG_INPUT, 1),
        property_id::PRESENT_VALUE,
    );
    net.devices[client].with_app(0, |app, ctx| {
        app.request_io(to_b, None, ctx).unwrap();
        app.request_io(to_c, None, ctx).unwrap();
    });
    net.exchange();

    // both requests were transmitted although neither completed
    let request_count = net
        .apdu_history()
        .iter()
        .filter(|(_, apdu)| matches!(apdu, Apdu::ConfirmedRequest(_)))
        .count();
    assert_eq!(request_count, 2);
}

#[test]
fn test_device_communication_control_disable() {
    let mut net = TestNet::new();
    let client = net.add_device(900, 1, |_| {});
    let server = net.add_device(901, 2, |_| {});
    net.devices[server].with_app(0, |app, _| {
        app.add_object(analog_input()).unwrap();
    });
    let server_address = net.devices[server].address.clone();
    let client_address = net.devices[client].address.clone();

    // disable communication on the server over the wire
    let dcc = Iocb::new(
        server_address.clone(),
        ServiceMessage::request(
            server_address.clone(),
            ServiceBody::DeviceCommunicationControl(DccRequest {
                time_duration_minutes: None,
                enable_disable: DccEnableDisable::Disable,
                password: None,
            }),
        ),
    );
    net.devices[client]
        .with_app(0, |app, ctx| app.request_io(dcc.clone(), None, ctx))
        .unwrap();
    net.exchange();
    assert_eq!(dcc.io_state(), IoState::Completed);
    assert_eq!(
        net.devices[server].stack.shared().dcc,
        CommunicationControl::Disable
    );
    let marker = net.history.len();

    // a read is dropped without any response
    let read = read_property_iocb(
        server_address.clone(),
        ObjectId::new(object_type::ANALOG_INPUT, 1),
        property_id::PRESENT_VALUE,
    );
    net.devices[client]
        .with_app(0, |app, ctx| app.request_io(read.clone(), None, ctx))
        .unwrap();
    net.exchange();
    assert_eq!(read.io_state(), IoState::Active);
    let responses = net.history[marker..]
        .iter()
        .filter(|packet| packet.source == server_address)
        .count();
    assert_eq!(responses, 0);

    // a Who-Is is still processed, but the I-Am initiation is suppressed
    let marker = net.history.len();
    net.devices[client].with_app(0, |app, ctx| app.who_is(None, None, None, ctx));
    net.exchange();
    let responses = net.history[marker..]
        .iter()
        .filter(|packet| packet.source == server_address)
        .count();
    assert_eq!(responses, 0);

    // the server's own initiations are dropped locally
    let marker = net.history.len();
    let outbound = read_property_iocb(
        client_address,
        ObjectId::new(object_type::ANALOG_INPUT, 1),
        property_id::PRESENT_VALUE,
    );
    net.devices[server]
        .with_app(0, |app, ctx| app.request_io(outbound, None, ctx))
        .unwrap();
    net.exchange();
    let sent = net.history[marker..]
        .iter()
        .filter(|packet| packet.source == server_address)
        .count();
    assert_eq!(sent, 0);
}

#[test]
fn test_dcc_duration_restores_communication() {
    let mut net = TestNet::new();
    let client = net.add_device(900, 1, |_| {});
    let server = net.add_device(901, 2, |_| {});
    let server_address = net.devices[server].address.clone();

    let dcc = Iocb::new(
        server_address.clone(),
        ServiceMessage::request(
            server_address,
            ServiceBody::DeviceCommunicationControl(DccRequest {
                time_duration_minutes: Some(1),
                enable_disable: DccEnableDisable::Disable,
                password: None,
            }),
        ),
    );
    net.devices[client]
        .with_app(0, |app, ctx| app.request_io(dcc, None, ctx))
        .unwrap();
    net.exchange();
    assert_eq!(
        net.devices[server].stack.shared().dcc,
        CommunicationControl::Disable
    );

    net.advance(61_000);
    assert_eq!(
        net.devices[server].stack.shared().dcc,
        CommunicationControl::Enable
    );
}

#[test]
fn test_unrecognized_confirmed_service_is_rejected() {
    let mut net = TestNet::new();
    let client = net.add_device(900, 1, |_| {});
    let server = net.add_device(901, 2, |_| {});
    let client_address = net.devices[client].address.clone();

    let mut request = bacnet_rs::apdu::ConfirmedRequest::new(99, vec![]);
    request.invoke_id = Some(7);
    net.inject_apdu(server, &client_address, &Apdu::ConfirmedRequest(request));
    net.exchange();

    let reject = net
        .apdu_history()
        .into_iter()
        .find_map(|(_, apdu)| match apdu {
            Apdu::Reject(reject) => Some(reject),
            _ => None,
        })
        .expect("reject on the wire");
    assert_eq!(reject.invoke_id, 7);
    assert_eq!(reject.reason, RejectReason::UnrecognizedService);
}

#[test]
fn test_retry_exhaustion_aborts_the_request() {
    let mut net = TestNet::new();
    let client = net.add_device(900, 1, |_| {});
    // nobody answers at this address
    let silent = Address::local_station_ip([10, 0, 0, 99], 47808);

    let iocb = read_property_iocb(
        silent,
        ObjectId::new(object_type::ANALOG_INPUT, 1),
        property_id::PRESENT_VALUE,
    );
    net.devices[client]
        .with_app(0, |app, ctx| app.request_io(iocb.clone(), None, ctx))
        .unwrap();
    net.exchange();

    // original attempt plus three retries, then a local abort
    net.advance(3_000 * 4 + 100);
    let attempts = net
        .apdu_history()
        .iter()
        .filter(|(_, apdu)| matches!(apdu, Apdu::ConfirmedRequest(_)))
        .count();
    assert_eq!(attempts, 4);

    assert_eq!(iocb.io_state(), IoState::Aborted);
    match iocb.error().expect("abort recorded") {
        IocbError::Response(message) => match message.body {
            ServiceBody::Abort { reason, .. } => assert_eq!(reason, AbortReason::NoResponse),
            other => panic!("unexpected body {:?}", other),
        },
        other => panic!("unexpected error kind {:?}", other),
    }
}
