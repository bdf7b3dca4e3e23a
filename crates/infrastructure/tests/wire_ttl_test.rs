use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, NS, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};

use conduit_dns_infrastructure::dns::wire::{
    extract_ttl_offsets, min_ttl, min_ttl_wire, subtract_ttls,
};

fn sample_response() -> Message {
    let name = Name::from_ascii("example.com.").unwrap();
    let mut r = Message::new();
    r.set_id(0x4242)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    r.add_query(Query::query(name.clone(), RecordType::A));
    r.add_answer(Record::from_rdata(
        name.clone(),
        300,
        RData::A(A::new(93, 184, 216, 34)),
    ));
    r.add_answer(Record::from_rdata(
        name.clone(),
        120,
        RData::TXT(TXT::new(vec!["v=spf1 -all".to_string()])),
    ));
    r.add_name_server(Record::from_rdata(
        name.clone(),
        900,
        RData::NS(NS(Name::from_ascii("ns1.example.com.").unwrap())),
    ));
    r
}

/// Patching TTLs through the offset table must agree with parsing,
/// rewriting and repacking.
#[test]
fn offset_patching_matches_parsed_patching() {
    let response = sample_response();
    let mut wire = response.to_vec().unwrap();
    let offsets = extract_ttl_offsets(&wire);
    assert_eq!(offsets.len(), 3);

    let overflowed = subtract_ttls(&mut wire, &offsets, 60);
    assert!(!overflowed);

    let patched = Message::from_vec(&wire).unwrap();
    assert_eq!(patched.answers()[0].ttl(), 240);
    assert_eq!(patched.answers()[1].ttl(), 60);
    assert_eq!(patched.name_servers()[0].ttl(), 840);

    // Every other field survives the in-place rewrite.
    assert_eq!(patched.id(), response.id());
    assert_eq!(patched.response_code(), response.response_code());
    assert_eq!(patched.queries(), response.queries());
    assert_eq!(patched.answers()[0].data(), response.answers()[0].data());
}

#[test]
fn subtraction_floors_at_one_and_flags() {
    let mut wire = sample_response().to_vec().unwrap();
    let offsets = extract_ttl_offsets(&wire);

    // 120 < 200: the TXT record bottoms out at 1.
    let overflowed = subtract_ttls(&mut wire, &offsets, 200);
    assert!(overflowed);

    let patched = Message::from_vec(&wire).unwrap();
    assert_eq!(patched.answers()[0].ttl(), 100);
    assert_eq!(patched.answers()[1].ttl(), 1);
    assert_eq!(patched.name_servers()[0].ttl(), 700);
}

#[test]
fn round_trip_preserves_message() {
    let response = sample_response();
    let wire = response.to_vec().unwrap();
    let reparsed = Message::from_vec(&wire).unwrap();

    assert_eq!(reparsed.id(), response.id());
    assert_eq!(reparsed.queries(), response.queries());
    assert_eq!(reparsed.answers(), response.answers());
    assert_eq!(reparsed.name_servers(), response.name_servers());
}

#[test]
fn min_ttl_agrees_between_parsed_and_wire() {
    let response = sample_response();
    let wire = response.to_vec().unwrap();
    assert_eq!(min_ttl(&response), 120);
    assert_eq!(min_ttl_wire(&wire), 120);
}

#[test]
fn min_ttl_of_empty_message_is_zero() {
    let mut empty = Message::new();
    empty.set_message_type(MessageType::Response);
    assert_eq!(min_ttl(&empty), 0);
    assert_eq!(min_ttl_wire(&empty.to_vec().unwrap()), 0);
}
