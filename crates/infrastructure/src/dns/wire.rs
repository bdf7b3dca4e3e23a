//! Helpers over packed DNS wire data.
//!
//! The cache hot path never unpacks a message: a stored response is served by
//! copying its bytes, rewriting the identifier and rewriting each TTL through
//! a table of byte offsets computed once at store time. Everything here is
//! bounds-checked and returns best-effort partial results instead of failing;
//! a short or malformed entry simply degrades to a cache miss at the caller.

use hickory_proto::op::Message;
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::RecordType;

pub const HEADER_LEN: usize = 12;

/// Minimum UDP payload size every client must accept (RFC 1035).
pub const MIN_UDP_SIZE: usize = 512;

/// At most this many TTL positions are remembered per cached response.
pub const MAX_TTL_OFFSETS: usize = 8;

const TYPE_OPT: u16 = 41;

/// Byte positions of the TTL fields of a packed response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TtlOffsets {
    offsets: [u16; MAX_TTL_OFFSETS],
    count: u8,
}

impl TtlOffsets {
    pub fn from_parts(offsets: [u16; MAX_TTL_OFFSETS], count: u8) -> Self {
        Self {
            offsets,
            count: count.min(MAX_TTL_OFFSETS as u8),
        }
    }

    pub fn as_parts(&self) -> ([u16; MAX_TTL_OFFSETS], u8) {
        (self.offsets, self.count)
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.offsets[..self.count as usize]
            .iter()
            .map(|&o| o as usize)
    }
}

/// Advances past a wire-format name starting at `offset`.
///
/// Accepts plain labels (length 1..=63) and a two-byte compression pointer;
/// the 01/10 label-type bits are invalid and abort the walk.
pub fn skip_name(wire: &[u8], mut offset: usize) -> Option<usize> {
    while offset < wire.len() {
        let b = wire[offset];
        if b == 0 {
            return Some(offset + 1);
        }
        if b & 0xC0 == 0xC0 {
            // Compression pointer: two bytes, ends the name.
            return if offset + 2 <= wire.len() {
                Some(offset + 2)
            } else {
                None
            };
        }
        if b & 0xC0 != 0 || b > 63 {
            return None;
        }
        offset += 1 + b as usize;
    }
    None
}

/// One forward parse of a packed response, recording where every non-OPT
/// TTL lives. Malformed data terminates the scan with whatever was gathered.
pub fn extract_ttl_offsets(wire: &[u8]) -> TtlOffsets {
    let mut table = TtlOffsets::default();
    if wire.len() < HEADER_LEN {
        return table;
    }

    let qdcount = u16::from_be_bytes([wire[4], wire[5]]) as usize;
    let total_rr = u16::from_be_bytes([wire[6], wire[7]]) as usize
        + u16::from_be_bytes([wire[8], wire[9]]) as usize
        + u16::from_be_bytes([wire[10], wire[11]]) as usize;

    let mut offset = HEADER_LEN;

    // Question section: name + type(2) + class(2).
    for _ in 0..qdcount {
        offset = match skip_name(wire, offset) {
            Some(o) => o + 4,
            None => return table,
        };
        if offset > wire.len() {
            return table;
        }
    }

    // Answer + Authority + Additional.
    for _ in 0..total_rr {
        if offset >= wire.len() {
            break;
        }
        offset = match skip_name(wire, offset) {
            Some(o) => o,
            None => break,
        };
        // type(2) + class(2) + ttl(4) + rdlength(2)
        if offset + 10 > wire.len() {
            break;
        }

        let rrtype = u16::from_be_bytes([wire[offset], wire[offset + 1]]);
        if rrtype != TYPE_OPT && (table.count as usize) < MAX_TTL_OFFSETS {
            let ttl_at = offset + 4;
            if ttl_at > u16::MAX as usize {
                break;
            }
            table.offsets[table.count as usize] = ttl_at as u16;
            table.count += 1;
        }

        let rdlen = u16::from_be_bytes([wire[offset + 8], wire[offset + 9]]) as usize;
        offset += 10 + rdlen;
    }

    table
}

/// Subtracts `delta` seconds from each recorded TTL in place, flooring at
/// one second. Returns true when any record hit the floor.
pub fn subtract_ttls(buf: &mut [u8], offsets: &TtlOffsets, delta: u32) -> bool {
    let mut overflowed = false;
    for at in offsets.iter() {
        if at + 4 > buf.len() {
            continue;
        }
        let old = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let new = if old > delta {
            old - delta
        } else {
            overflowed = true;
            1
        };
        buf[at..at + 4].copy_from_slice(&new.to_be_bytes());
    }
    overflowed
}

/// Overwrites each recorded TTL with `ttl` (the lazy-serve path).
pub fn set_ttls(buf: &mut [u8], offsets: &TtlOffsets, ttl: u32) {
    for at in offsets.iter() {
        if at + 4 > buf.len() {
            continue;
        }
        buf[at..at + 4].copy_from_slice(&ttl.to_be_bytes());
    }
}

pub fn patch_id(buf: &mut [u8], id: u16) {
    if buf.len() >= 2 {
        buf[0..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Sets the TC bit (byte 2, bit 1 counting from the top).
pub fn set_tc(buf: &mut [u8]) {
    if buf.len() >= 3 {
        buf[2] |= 0x02;
    }
}

/// Minimum TTL across Answer + Authority + Additional of a parsed message,
/// ignoring the OPT pseudo-record. 0 when there is no record.
pub fn min_ttl(msg: &Message) -> u32 {
    let mut min = u32::MAX;
    let mut has_record = false;
    for record in msg
        .answers()
        .iter()
        .chain(msg.name_servers())
        .chain(msg.additionals())
    {
        if record.record_type() == RecordType::OPT {
            continue;
        }
        has_record = true;
        min = min.min(record.ttl());
    }
    if has_record {
        min
    } else {
        0
    }
}

/// Minimum TTL of a packed response, read through a fresh offset scan.
/// 0 when no non-OPT record is found.
pub fn min_ttl_wire(wire: &[u8]) -> u32 {
    let table = extract_ttl_offsets(wire);
    let mut min = u32::MAX;
    let mut seen = false;
    for at in table.iter() {
        if at + 4 > wire.len() {
            continue;
        }
        seen = true;
        min = min.min(u32::from_be_bytes([
            wire[at],
            wire[at + 1],
            wire[at + 2],
            wire[at + 3],
        ]));
    }
    if seen {
        min
    } else {
        0
    }
}

/// The UDP payload limit a query declares: its EDNS0 size, floored at 512.
pub fn declared_udp_size(query: &Message) -> usize {
    let declared = query
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload() as usize)
        .unwrap_or(0);
    declared.max(MIN_UDP_SIZE)
}

/// EDNS Client Subnet option carried by a message, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubnet {
    pub family: u16,
    pub source_prefix: u8,
    pub scope_prefix: u8,
    pub address: Vec<u8>,
}

impl ClientSubnet {
    /// Option payload per RFC 7871 §6, address truncated to the prefix.
    pub fn to_option_bytes(&self) -> Vec<u8> {
        let n = prefix_bytes(self.source_prefix).min(self.address.len());
        let mut out = Vec::with_capacity(4 + n);
        out.extend_from_slice(&self.family.to_be_bytes());
        out.push(self.source_prefix);
        out.push(self.scope_prefix);
        out.extend_from_slice(&self.address[..n]);
        out
    }
}

/// Reads the ECS option off a message's OPT record, if present.
pub fn client_subnet(msg: &Message) -> Option<ClientSubnet> {
    let edns = msg.extensions().as_ref()?;
    // Client Subnet has no typed variant in the codec; it round-trips as an
    // unknown option with its raw RFC 7871 payload.
    let EdnsOption::Unknown(_, data) = edns.options().get(EdnsCode::Subnet)? else {
        return None;
    };
    if data.len() < 4 {
        return None;
    }
    Some(ClientSubnet {
        family: u16::from_be_bytes([data[0], data[1]]),
        source_prefix: data[2],
        scope_prefix: data[3],
        address: data[4..].to_vec(),
    })
}

/// Builds the canonical cache key for the current query:
/// lowercased FQDN question name, qtype, qclass, then (only when the query
/// carries a normalized ECS option) family, source netmask and the masked
/// address bytes. The identifier never participates.
pub fn build_key(query: &Message) -> Option<Vec<u8>> {
    let question = query.queries().first()?;

    let name = question.name().to_lowercase().to_utf8();
    let qtype: u16 = question.query_type().into();
    let qclass: u16 = question.query_class().into();

    let mut key = Vec::with_capacity(name.len() + 5 + 12);
    key.extend_from_slice(name.as_bytes());
    if !name.ends_with('.') {
        key.push(b'.');
    }
    key.extend_from_slice(&qtype.to_be_bytes());
    key.extend_from_slice(&qclass.to_be_bytes());

    if let Some(ecs) = client_subnet(query) {
        if ecs.source_prefix > 0 {
            key.extend_from_slice(&ecs.family.to_be_bytes());
            key.push(ecs.source_prefix);

            let n = prefix_bytes(ecs.source_prefix).min(ecs.address.len());
            for (i, &byte) in ecs.address[..n].iter().enumerate() {
                let mut val = byte;
                if i == n - 1 {
                    let rem = ecs.source_prefix % 8;
                    if rem != 0 {
                        val &= 0xFFu8 << (8 - rem);
                    }
                }
                key.push(val);
            }
        }
    }

    Some(key)
}

pub fn prefix_bytes(prefix: u8) -> usize {
    (prefix as usize + 7) / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2-answer response: example.com A 1.2.3.4 / 5.6.7.8, TTL 300 each.
    fn sample_response() -> Vec<u8> {
        let mut w = Vec::new();
        w.extend_from_slice(&0x1234u16.to_be_bytes()); // id
        w.extend_from_slice(&0x8180u16.to_be_bytes()); // QR|RD|RA
        w.extend_from_slice(&1u16.to_be_bytes()); // qd
        w.extend_from_slice(&2u16.to_be_bytes()); // an
        w.extend_from_slice(&0u16.to_be_bytes()); // ns
        w.extend_from_slice(&0u16.to_be_bytes()); // ar
        // question: example.com A IN
        w.extend_from_slice(b"\x07example\x03com\x00");
        w.extend_from_slice(&1u16.to_be_bytes());
        w.extend_from_slice(&1u16.to_be_bytes());
        for ip in [[1u8, 2, 3, 4], [5, 6, 7, 8]] {
            w.extend_from_slice(&[0xC0, 0x0C]); // pointer to question name
            w.extend_from_slice(&1u16.to_be_bytes()); // type A
            w.extend_from_slice(&1u16.to_be_bytes()); // class IN
            w.extend_from_slice(&300u32.to_be_bytes()); // ttl
            w.extend_from_slice(&4u16.to_be_bytes()); // rdlength
            w.extend_from_slice(&ip);
        }
        w
    }

    fn read_ttl(buf: &[u8], at: usize) -> u32 {
        u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    #[test]
    fn skip_name_plain_and_pointer() {
        let wire = sample_response();
        // question name starts at 12, ends before type at 12+13
        assert_eq!(skip_name(&wire, 12), Some(25));
        // first answer name is a pointer at 29
        assert_eq!(skip_name(&wire, 29), Some(31));
    }

    #[test]
    fn skip_name_rejects_bad_label_type() {
        // 0x40 = label-type bits 01
        let wire = [0x40u8, b'a', 0x00];
        assert!(skip_name(&wire, 0).is_none());
    }

    #[test]
    fn skip_name_rejects_truncation() {
        let wire = [0x07u8, b'e', b'x'];
        assert!(skip_name(&wire, 0).is_none());
    }

    #[test]
    fn extracts_both_answer_ttls() {
        let wire = sample_response();
        let table = extract_ttl_offsets(&wire);
        assert_eq!(table.len(), 2);
        let offsets: Vec<usize> = table.iter().collect();
        for at in &offsets {
            assert_eq!(read_ttl(&wire, *at), 300);
        }
    }

    #[test]
    fn opt_record_is_skipped() {
        let mut wire = sample_response();
        // append an OPT RR in additionals
        wire[11] = 1; // arcount = 1
        wire.extend_from_slice(&[0x00]); // root name
        wire.extend_from_slice(&41u16.to_be_bytes()); // OPT
        wire.extend_from_slice(&1232u16.to_be_bytes()); // class = udp size
        wire.extend_from_slice(&0u32.to_be_bytes()); // "ttl"
        wire.extend_from_slice(&0u16.to_be_bytes()); // rdlength
        let table = extract_ttl_offsets(&wire);
        assert_eq!(table.len(), 2, "OPT TTL field must not be recorded");
    }

    #[test]
    fn offset_cap_keeps_first_eight() {
        let mut w = Vec::new();
        w.extend_from_slice(&0u16.to_be_bytes());
        w.extend_from_slice(&0x8180u16.to_be_bytes());
        w.extend_from_slice(&0u16.to_be_bytes()); // qd = 0
        w.extend_from_slice(&10u16.to_be_bytes()); // an = 10
        w.extend_from_slice(&0u16.to_be_bytes());
        w.extend_from_slice(&0u16.to_be_bytes());
        for _ in 0..10 {
            w.extend_from_slice(b"\x01a\x00");
            w.extend_from_slice(&1u16.to_be_bytes());
            w.extend_from_slice(&1u16.to_be_bytes());
            w.extend_from_slice(&60u32.to_be_bytes());
            w.extend_from_slice(&4u16.to_be_bytes());
            w.extend_from_slice(&[0, 0, 0, 0]);
        }
        let table = extract_ttl_offsets(&w);
        assert_eq!(table.len(), MAX_TTL_OFFSETS);
    }

    #[test]
    fn malformed_tail_returns_partial() {
        let mut wire = sample_response();
        wire.truncate(40); // cut inside the first answer's rdata
        let table = extract_ttl_offsets(&wire);
        assert!(table.len() <= 1);
    }

    #[test]
    fn subtract_floors_at_one() {
        let mut wire = sample_response();
        let table = extract_ttl_offsets(&wire);

        let overflowed = subtract_ttls(&mut wire, &table, 60);
        assert!(!overflowed);
        for at in table.iter() {
            assert_eq!(read_ttl(&wire, at), 240);
        }

        let overflowed = subtract_ttls(&mut wire, &table, 1000);
        assert!(overflowed);
        for at in table.iter() {
            assert_eq!(read_ttl(&wire, at), 1);
        }
    }

    #[test]
    fn set_ttls_overwrites() {
        let mut wire = sample_response();
        let table = extract_ttl_offsets(&wire);
        set_ttls(&mut wire, &table, 5);
        for at in table.iter() {
            assert_eq!(read_ttl(&wire, at), 5);
        }
    }

    #[test]
    fn id_and_tc_patching() {
        let mut wire = sample_response();
        patch_id(&mut wire, 0xBEEF);
        assert_eq!(&wire[0..2], &[0xBE, 0xEF]);
        assert_eq!(wire[2] & 0x02, 0);
        set_tc(&mut wire);
        assert_eq!(wire[2] & 0x02, 0x02);
    }
}
