use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{HINFO, SOA};
use hickory_proto::rr::{DNSClass, Name, RData, Record};

/// TTL carried by the HINFO answer to an ANY query, per RFC 8482.
pub const ANY_OBSOLETED_TTL: u32 = 8482;

/// Starts a response for `q`: id, opcode and RD copied, question echoed.
pub fn reply_from_query(q: &Message, rcode: ResponseCode) -> Message {
    let mut r = Message::new();
    r.set_id(q.id())
        .set_message_type(MessageType::Response)
        .set_op_code(q.op_code())
        .set_recursion_desired(q.recursion_desired())
        .set_response_code(rcode);
    for query in q.queries() {
        r.add_query(query.clone());
    }
    r
}

/// An answerless reply with a synthetic SOA in the authority section so
/// resolvers have something to negative-cache against.
pub fn empty_reply(q: &Message, rcode: ResponseCode) -> Message {
    let mut r = reply_from_query(q, rcode);
    r.set_recursion_available(true);

    let name = q
        .queries()
        .first()
        .map(|question| question.name().clone())
        .unwrap_or_else(Name::root);
    r.add_name_server(fake_soa(name));
    r
}

/// The RFC 8482 answer to an ANY query: a single HINFO record.
pub fn any_obsoleted_reply(q: &Message) -> Message {
    let mut r = reply_from_query(q, ResponseCode::NoError);
    r.set_recursion_available(true);

    let name = q
        .queries()
        .first()
        .map(|question| question.name().clone())
        .unwrap_or_else(Name::root);
    let hinfo = HINFO::new("ANY obsoleted".to_string(), "See RFC 8482".to_string());
    let mut record = Record::from_rdata(name, ANY_OBSOLETED_TTL, RData::HINFO(hinfo));
    record.set_dns_class(DNSClass::IN);
    r.add_answer(record);
    r
}

fn fake_soa(name: Name) -> Record {
    let soa = SOA::new(
        Name::from_ascii("fake-ns.conduit.invalid.").expect("static name"),
        Name::from_ascii("fake-mbox.conduit.invalid.").expect("static name"),
        2024010100,
        1800,
        900,
        604800,
        86400,
    );
    let mut record = Record::from_rdata(name, 300, RData::SOA(soa));
    record.set_dns_class(DNSClass::IN);
    record
}
