use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::rr::{Name, RecordType};

use conduit_dns_infrastructure::dns::wire::build_key;

fn query(name: &str, qtype: RecordType, id: u16) -> Message {
    let mut q = Message::new();
    q.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    q.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
    q
}

fn add_option(msg: &mut Message, code: u16, data: Vec<u8>) {
    let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
    edns.options_mut().insert(EdnsOption::Unknown(code, data));
}

#[test]
fn key_ignores_identifier() {
    let a = build_key(&query("example.com.", RecordType::A, 0x0001)).unwrap();
    let b = build_key(&query("example.com.", RecordType::A, 0xFFFE)).unwrap();
    assert_eq!(a, b);
}

#[test]
fn key_layout_is_name_qtype_qclass() {
    let key = build_key(&query("example.com.", RecordType::A, 0x1234)).unwrap();
    let mut expected = b"example.com.".to_vec();
    expected.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    assert_eq!(key, expected);
}

#[test]
fn key_lowercases_the_name() {
    let upper = build_key(&query("ExAmPlE.CoM.", RecordType::A, 1)).unwrap();
    let lower = build_key(&query("example.com.", RecordType::A, 1)).unwrap();
    assert_eq!(upper, lower);
}

#[test]
fn key_distinguishes_qtype() {
    let a = build_key(&query("example.com.", RecordType::A, 1)).unwrap();
    let aaaa = build_key(&query("example.com.", RecordType::AAAA, 1)).unwrap();
    assert_ne!(a, aaaa);
}

#[test]
fn key_ignores_edns_padding() {
    let plain = build_key(&query("example.com.", RecordType::A, 1)).unwrap();

    let mut padded = query("example.com.", RecordType::A, 1);
    // Option 12 = Padding (RFC 7830).
    add_option(&mut padded, 12, vec![0; 32]);
    assert_eq!(build_key(&padded).unwrap(), plain);
}

#[test]
fn key_includes_normalized_ecs() {
    let plain = build_key(&query("example.com.", RecordType::A, 1)).unwrap();

    let mut with_ecs = query("example.com.", RecordType::A, 1);
    // family 1, /24, scope 0, 192.0.2.0
    add_option(&mut with_ecs, 8, vec![0, 1, 24, 0, 192, 0, 2]);
    let ecs_key = build_key(&with_ecs).unwrap();

    assert_ne!(ecs_key, plain);
    assert!(ecs_key.ends_with(&[0u8, 1, 24, 192, 0, 2]));
}

#[test]
fn key_masks_ecs_address_bytes() {
    // A sloppy /20 with host bits set must produce the same key as its
    // canonical form.
    let mut sloppy = query("example.com.", RecordType::A, 1);
    add_option(&mut sloppy, 8, vec![0, 1, 20, 0, 10, 1, 0xFF]);

    let mut canonical = query("example.com.", RecordType::A, 1);
    add_option(&mut canonical, 8, vec![0, 1, 20, 0, 10, 1, 0xF0]);

    assert_eq!(build_key(&sloppy).unwrap(), build_key(&canonical).unwrap());
}

#[test]
fn key_ignores_zero_prefix_ecs() {
    let plain = build_key(&query("example.com.", RecordType::A, 1)).unwrap();

    let mut zero = query("example.com.", RecordType::A, 1);
    add_option(&mut zero, 8, vec![0, 1, 0, 0]);
    assert_eq!(build_key(&zero).unwrap(), plain);
}

#[test]
fn no_question_means_no_key() {
    let mut q = Message::new();
    q.set_id(7);
    assert!(build_key(&q).is_none());
}
