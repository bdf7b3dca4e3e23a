//! The DoH request handler shared by the HTTP/1.1+HTTP/2 and HTTP/3
//! listeners (RFC 8484): GET with a base64url `dns` parameter, POST with an
//! `application/dns-message` body, a health endpoint, and redirect-or-404
//! for everything else.

use std::net::IpAddr;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use hickory_proto::op::Message;
use http::{HeaderMap, Method, Response, StatusCode};
use tracing::{debug, warn};

use conduit_dns_application::meta::{RequestMeta, TransportProtocol};

use crate::dns::wire;

use super::Server;

pub const DNS_CONTENT_TYPE: &str = "application/dns-message";

/// RFC 8484 queries are tiny; anything larger is abuse.
pub const MAX_REQUEST_BODY: usize = 64 * 1024;

/// Proxy headers consulted for the client address, in order.
const PROXY_HEADERS: [&str; 3] = ["True-Client-IP", "X-Real-IP", "X-Forwarded-For"];

pub struct DohHandlerOpts {
    pub path: String,
    pub health_path: String,
    pub redirect_url: String,
    pub src_ip_header: String,
}

impl Default for DohHandlerOpts {
    fn default() -> Self {
        Self {
            path: "/dns-query".to_string(),
            health_path: "/health".to_string(),
            redirect_url: String::new(),
            src_ip_header: String::new(),
        }
    }
}

pub struct DohHandler {
    server: Arc<Server>,
    opts: DohHandlerOpts,
}

/// One HTTP request, reduced to what the DoH handler needs.
pub struct DohRequest {
    pub method: Method,
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer: IpAddr,
    pub server_name: String,
    pub protocol: TransportProtocol,
}

impl DohHandler {
    pub fn new(server: Arc<Server>, opts: DohHandlerOpts) -> Self {
        Self { server, opts }
    }

    pub async fn handle(&self, req: DohRequest) -> Response<Bytes> {
        if !self.opts.health_path.is_empty() && req.path == self.opts.health_path {
            return respond(StatusCode::OK, Bytes::from_static(b"OK"));
        }

        if req.path != self.opts.path || req.path == "/" {
            return self.reject_path();
        }

        let wire_query = match req.method {
            Method::GET => {
                if !accepts_dns_message(&req.headers) {
                    return self.reject_path();
                }
                let Some(encoded) = dns_param(req.query.as_deref()) else {
                    return respond(StatusCode::BAD_REQUEST, Bytes::new());
                };
                match URL_SAFE_NO_PAD.decode(encoded.as_bytes()) {
                    Ok(b) if b.len() <= MAX_REQUEST_BODY => b,
                    Ok(_) => {
                        return respond(StatusCode::PAYLOAD_TOO_LARGE, Bytes::new());
                    }
                    Err(e) => {
                        debug!(from = %req.peer, error = %e, "bad base64 in dns parameter");
                        return respond(StatusCode::BAD_REQUEST, Bytes::new());
                    }
                }
            }
            Method::POST => {
                let content_type = req
                    .headers
                    .get(http::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                if content_type != DNS_CONTENT_TYPE {
                    return respond(StatusCode::BAD_REQUEST, Bytes::new());
                }
                if req.body.len() > MAX_REQUEST_BODY {
                    return respond(StatusCode::PAYLOAD_TOO_LARGE, Bytes::new());
                }
                req.body.to_vec()
            }
            _ => return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()),
        };

        let query = match Message::from_vec(&wire_query) {
            Ok(q) => q,
            Err(e) => {
                warn!(from = %req.peer, error = %e, "failed to unpack DoH query");
                return respond(StatusCode::BAD_REQUEST, Bytes::new());
            }
        };

        let client = self.client_addr(&req.headers, req.peer);
        let meta =
            RequestMeta::new(client, req.protocol).with_server_name(req.server_name.clone());

        let mut qctx = self.server.handler().handle(query, meta).await;

        let (body, max_age) = if let Some(raw) = qctx.take_raw_response() {
            let body = Bytes::copy_from_slice(raw.bytes());
            let max_age = wire::min_ttl_wire(&body);
            raw.release();
            (body, max_age)
        } else if let Some(r) = qctx.response() {
            match r.to_vec() {
                Ok(packed) => {
                    let max_age = wire::min_ttl(r);
                    (Bytes::from(packed), max_age)
                }
                Err(e) => {
                    warn!(error = %e, "failed to pack DoH response");
                    return respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new());
                }
            }
        } else {
            return respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new());
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, DNS_CONTENT_TYPE)
            .header(http::header::CACHE_CONTROL, format!("max-age={}", max_age))
            .body(body)
            .unwrap_or_else(|_| respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new()))
    }

    fn reject_path(&self) -> Response<Bytes> {
        if !self.opts.redirect_url.is_empty() {
            return Response::builder()
                .status(StatusCode::FOUND)
                .header(http::header::LOCATION, self.opts.redirect_url.clone())
                .body(Bytes::new())
                .unwrap_or_else(|_| respond(StatusCode::NOT_FOUND, Bytes::new()));
        }
        respond(StatusCode::NOT_FOUND, Bytes::new())
    }

    /// True-Client-IP, X-Real-IP, then the first element of X-Forwarded-For,
    /// then the configured header, then the socket peer.
    fn client_addr(&self, headers: &HeaderMap, peer: IpAddr) -> IpAddr {
        for name in PROXY_HEADERS {
            if let Some(ip) = header_ip(headers, name) {
                return ip;
            }
        }
        if !self.opts.src_ip_header.is_empty()
            && !PROXY_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(&self.opts.src_ip_header))
        {
            if let Some(ip) = header_ip(headers, &self.opts.src_ip_header) {
                return ip;
            }
        }
        peer
    }
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    let value = headers.get(name)?.to_str().ok()?;
    let first = value.split(',').next()?.trim();
    first.parse().ok()
}

fn dns_param(query: Option<&str>) -> Option<&str> {
    for pair in query?.split('&') {
        if let Some(value) = pair.strip_prefix("dns=") {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

fn accepts_dns_message(headers: &HeaderMap) -> bool {
    let Some(accept) = headers
        .get(http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    accept
        .split(',')
        .map(|v| v.split(';').next().unwrap_or_default().trim())
        .any(|media| media == DNS_CONTENT_TYPE)
}

fn respond(status: StatusCode, body: Bytes) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_param_extraction() {
        assert_eq!(dns_param(Some("dns=AAAA")), Some("AAAA"));
        assert_eq!(dns_param(Some("x=1&dns=abc&y=2")), Some("abc"));
        assert_eq!(dns_param(Some("dns=")), None);
        assert_eq!(dns_param(Some("other=1")), None);
        assert_eq!(dns_param(None), None);
    }

    #[test]
    fn accept_header_matching() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_dns_message(&headers));

        headers.insert(
            http::header::ACCEPT,
            "application/dns-message".parse().unwrap(),
        );
        assert!(accepts_dns_message(&headers));

        headers.insert(
            http::header::ACCEPT,
            "text/html, application/dns-message;q=0.9".parse().unwrap(),
        );
        assert!(accepts_dns_message(&headers));

        headers.insert(http::header::ACCEPT, "text/html".parse().unwrap());
        assert!(!accepts_dns_message(&headers));
    }

    #[test]
    fn forwarded_for_takes_first() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Forwarded-For",
            "198.51.100.7, 10.0.0.1".parse().unwrap(),
        );
        assert_eq!(
            header_ip(&headers, "X-Forwarded-For"),
            Some("198.51.100.7".parse().unwrap())
        );
    }
}
