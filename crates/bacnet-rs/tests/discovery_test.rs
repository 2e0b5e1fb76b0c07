// crates/bacnet-rs/tests/discovery_test.rs
//! Who-Is / I-Am discovery across the virtual network.

mod support;

use bacnet_rs::apdu::Apdu;
use bacnet_rs::types::{unconfirmed_service, Segmentation};
use support::TestNet;

#[test]
fn test_who_is_draws_an_i_am_from_every_device() {
    let mut net = TestNet::new();
    let asker = net.add_device(900, 1, |_| {});
    net.add_device(901, 2, |_| {});
    net.add_device(902, 3, |_| {});

    net.devices[asker].with_app(0, |app, ctx| app.who_is(None, None, None, ctx));
    net.exchange();

    let apdus = net.apdu_history();
    let who_is_count = apdus
        .iter()
        .filter(|(_, apdu)| matches!(apdu, Apdu::UnconfirmedRequest(r) if r.service == unconfirmed_service::WHO_IS))
        .count();
    let i_am_count = apdus
        .iter()
        .filter(|(_, apdu)| matches!(apdu, Apdu::UnconfirmedRequest(r) if r.service == unconfirmed_service::I_AM))
        .count();
    assert_eq!(who_is_count, 1);
    assert_eq!(i_am_count, 2);
}

#[test]
fn test_i_am_populates_the_device_cache() {
    let mut net = TestNet::new();
    let asker = net.add_device(900, 1, |_| {});
    let peer = net.add_device(901, 2, |config| {
        config.max_apdu_length_accepted = 480;
        config.segmentation_supported = Segmentation::SegmentedBoth;
        config.vendor_identifier = 42;
    });
    let peer_address = net.devices[peer].address.clone();

    net.devices[asker].with_app(0, |app, ctx| app.who_is(None, None, None, ctx));
    net.exchange();

    let cache = &mut net.devices[asker].stack.shared().device_info;
    let record = cache
        .lookup_id(901)
        .and_then(|id| cache.get(id))
        .expect("peer learned from I-Am");
    assert_eq!(record.address, peer_address);
    assert_eq!(record.max_apdu_length_accepted, 480);
    assert_eq!(record.segmentation_supported, Segmentation::SegmentedBoth);
    assert_eq!(record.vendor_id, Some(42));

    // both indices resolve to the same record
    assert_eq!(cache.lookup_address(&peer_address), cache.lookup_id(901));
}

#[test]
fn test_who_is_range_filter_is_honoured() {
    let mut net = TestNet::new();
    let asker = net.add_device(900, 1, |_| {});
    net.add_device(901, 2, |_| {});
    net.add_device(950, 3, |_| {});

    // only instances 940..=960 should answer
    net.devices[asker].with_app(0, |app, ctx| {
        app.who_is(None, Some(940), Some(960), ctx)
    });
    net.exchange();

    let apdus = net.apdu_history();
    let i_am_count = apdus
        .iter()
        .filter(|(_, apdu)| matches!(apdu, Apdu::UnconfirmedRequest(r) if r.service == unconfirmed_service::I_AM))
        .count();
    assert_eq!(i_am_count, 1);

    let cache = &mut net.devices[asker].stack.shared().device_info;
    assert!(cache.lookup_id(950).is_some());
    assert!(cache.lookup_id(901).is_none());
}
