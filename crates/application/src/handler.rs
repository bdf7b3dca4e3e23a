use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::opt::EdnsCode;
use hickory_proto::rr::{DNSClass, RecordType};
use tracing::{debug, error, warn};

use conduit_dns_domain::DnsError;

use crate::context::QueryContext;
use crate::executable::{exec_chain, ChainNode};
use crate::meta::RequestMeta;
use crate::replies::{any_obsoleted_reply, empty_reply, reply_from_query};

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Queries advertising a larger EDNS0 payload are clamped here to avoid
/// fragmented upstream replies.
const MAX_QUERY_UDP_SIZE: u16 = 1232;

/// Early-reject toggles, per listener.
#[derive(Debug, Clone, Default)]
pub struct GateOpts {
    pub block_aaaa: bool,
    pub block_ptr: bool,
    pub block_https: bool,
    pub block_no_dot: bool,
    pub strip_edns0: bool,
}

pub struct EntryHandlerOpts {
    pub entry: Arc<ChainNode>,
    pub query_timeout: Duration,
    pub recursion_available: bool,
    pub gate: GateOpts,
}

impl EntryHandlerOpts {
    pub fn new(entry: Arc<ChainNode>) -> Self {
        Self {
            entry,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            recursion_available: true,
            gate: GateOpts::default(),
        }
    }
}

/// The gatekeeper between listeners and the plugin graph.
///
/// Validates (or rewrites) the incoming query so every downstream plugin can
/// assume a well-formed single-question INET query, runs the graph under the
/// per-query deadline, and finalizes the outgoing reply. Listeners read the
/// result from the returned context: raw slot first, then parsed.
pub struct EntryHandler {
    opts: EntryHandlerOpts,
}

impl EntryHandler {
    pub fn new(opts: EntryHandlerOpts) -> Self {
        Self { opts }
    }

    pub async fn handle(&self, mut query: Message, meta: RequestMeta) -> QueryContext {
        let orig_id = query.id();

        if let Some(reply) = self.gatekeep(&mut query) {
            let mut qctx = QueryContext::new(query, meta);
            qctx.set_response(reply);
            self.finalize(&mut qctx, orig_id, None);
            return qctx;
        }

        let mut qctx = QueryContext::new(query, meta);
        let cancel = qctx.cancellation().clone();

        let result = match tokio::time::timeout(
            self.opts.query_timeout,
            exec_chain(&mut qctx, Some(&self.opts.entry)),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => {
                // The chain future is already dropped; fire the request
                // token so fan-out work it spawned stops too.
                cancel.cancel();
                Err(DnsError::QueryTimeout)
            }
        };

        let err = result.err();
        self.finalize(&mut qctx, orig_id, err);
        qctx
    }

    /// Returns an immediate reply when the query must not reach the graph.
    fn gatekeep(&self, query: &mut Message) -> Option<Message> {
        // Exactly one question.
        if query.queries().len() != 1 {
            debug!(count = query.queries().len(), "query question count not 1");
            return Some(reply_from_query(query, ResponseCode::Refused));
        }

        // Standard queries only.
        if query.op_code() != OpCode::Query {
            debug!(opcode = ?query.op_code(), "non-standard opcode");
            return Some(reply_from_query(query, ResponseCode::Refused));
        }

        let question = &query.queries()[0];
        let qtype = question.query_type();

        // ANY died with RFC 8482.
        if qtype == RecordType::ANY {
            return Some(any_obsoleted_reply(query));
        }

        let gate = &self.opts.gate;
        let blocked = (gate.block_aaaa && qtype == RecordType::AAAA)
            || (gate.block_ptr && qtype == RecordType::PTR)
            || (gate.block_https
                && (qtype == RecordType::HTTPS || qtype == RecordType::SVCB));
        if blocked {
            return Some(empty_reply(query, ResponseCode::NoError));
        }

        // Domain hygiene. Characters outside [A-Za-z0-9._-] and (optionally)
        // dotless names are answered NXDOMAIN without touching an upstream.
        let name = question.name().to_utf8();
        let stem = name.strip_suffix('.').unwrap_or(&name);
        let mut has_upper = false;
        let mut has_dot = false;
        for b in stem.bytes() {
            match b {
                b'.' => has_dot = true,
                b'-' | b'_' | b'0'..=b'9' | b'a'..=b'z' => {}
                b'A'..=b'Z' => has_upper = true,
                _ => {
                    debug!(name = %name, "rejecting name with invalid character");
                    return Some(empty_reply(query, ResponseCode::NXDomain));
                }
            }
        }
        if gate.block_no_dot && !has_dot {
            return Some(empty_reply(query, ResponseCode::NXDomain));
        }

        // Lowercase the question name, but only when something is uppercase.
        if has_upper {
            let lowered = question.name().to_lowercase();
            let mut queries = query.take_queries();
            queries[0].set_name(lowered);
            for q in queries {
                query.add_query(q);
            }
        }

        if query.queries()[0].query_class() != DNSClass::IN {
            return Some(reply_from_query(query, ResponseCode::Refused));
        }

        // Header sanity: a query must look like one.
        if query.message_type() != MessageType::Query
            || query.authoritative()
            || query.truncated()
            || query.recursion_available()
            || !query.answers().is_empty()
            || !query.name_servers().is_empty()
        {
            debug!("query with response-side header flags or sections");
            return Some(reply_from_query(query, ResponseCode::Refused));
        }

        if gate.strip_edns0 {
            *query.extensions_mut() = None;
        } else if let Some(edns) = query.extensions_mut() {
            if edns.max_payload() > MAX_QUERY_UDP_SIZE {
                edns.set_max_payload(MAX_QUERY_UDP_SIZE);
            }
        }

        None
    }

    /// Guarantees the context leaves with a reply: synthesizes one when the
    /// graph produced nothing, restores the incoming identifier, sets RA and
    /// scrubs response-side EDNS0 back into agreement with the query.
    fn finalize(&self, qctx: &mut QueryContext, orig_id: u16, err: Option<DnsError>) {
        if let Some(e) = &err {
            if e.is_cancellation() {
                debug!(query = %qctx.summary(), error = %e, "query interrupted");
            } else {
                warn!(query = %qctx.summary(), error = %e, "plugin graph returned an error");
            }
        }

        // The zero-unpack fast path already patched the identifier into its
        // owned buffer; raw bytes go out as-is.
        if qctx.raw_response().is_some() {
            return;
        }

        if qctx.response().is_none() {
            if err.is_none() {
                error!(query = %qctx.summary(), "plugin graph finished with no response");
            }
            let rcode = if err.is_some() {
                ResponseCode::ServFail
            } else {
                ResponseCode::Refused
            };
            let reply = reply_from_query(qctx.query(), rcode);
            qctx.set_response(reply);
        }

        let ra = self.opts.recursion_available;
        let query_has_edns = qctx.query().extensions().is_some();
        if let Some(r) = qctx.response_mut() {
            if ra {
                r.set_recursion_available(true);
            }
            r.set_id(orig_id);

            // A client that sent no OPT must not receive one, and Padding
            // only wastes bytes on the way back.
            if !query_has_edns {
                *r.extensions_mut() = None;
            } else if let Some(edns) = r.extensions_mut() {
                edns.options_mut().remove(EdnsCode::Padding);
            }
        }
    }
}
