use std::sync::Arc;

use hickory_proto::op::{Message, ResponseCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use conduit_dns_domain::DnsError;

use super::upstream::{Reply, Upstream};

/// Fans a query out to every upstream and picks the winner by meaning, not
/// arrival order.
///
/// A NOERROR response with answers wins immediately and cancels the rest.
/// Otherwise the drain keeps the best non-answer response by priority
/// (NXDOMAIN over NODATA over other rcodes over SERVFAIL); when the caller's
/// token fired the race reports cancellation, and only when no upstream
/// produced a response at all does the aggregated transport error surface.
///
/// The race runs on a child of `cancel`, held by a drop guard: if this
/// future is dropped mid-flight (the per-query deadline passed), every
/// upstream task it spawned stops with it. Tasks go on `tracker` so server
/// shutdown waits for them.
pub async fn exchange_parallel(
    query: &Message,
    upstreams: &[Arc<dyn Upstream>],
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) -> Result<Reply, DnsError> {
    match upstreams.len() {
        0 => return Err(DnsError::AllUpstreamsFailed("no upstream".to_string())),
        1 => {
            return tokio::select! {
                result = upstreams[0].exchange(query) => result,
                _ = cancel.cancelled() => Err(DnsError::Canceled),
            }
        }
        _ => {}
    }

    let race = cancel.child_token();
    let _guard = race.clone().drop_guard();
    let (tx, mut rx) = mpsc::channel::<(Result<Reply, DnsError>, String)>(upstreams.len());

    for upstream in upstreams {
        let upstream = Arc::clone(upstream);
        let query = query.clone();
        let race = race.clone();
        let tx = tx.clone();
        tracker.spawn(async move {
            tokio::select! {
                result = upstream.exchange(&query) => {
                    let _ = tx.send((result, upstream.address().to_string())).await;
                }
                _ = race.cancelled() => {
                    debug!(addr = %upstream.address(), "upstream exchange canceled (racing loser)");
                }
            }
        });
    }
    // The channel closes once every task has reported or been canceled.
    drop(tx);

    let mut best: Option<(Reply, u8)> = None;
    let mut errors: Vec<String> = Vec::new();

    while let Some((result, addr)) = rx.recv().await {
        let reply = match result {
            Ok(r) => r,
            Err(e) if e.is_cancellation() => {
                debug!(addr = %addr, error = %e, "upstream exchange timed out");
                errors.push(format!("[{}: {}]", addr, e));
                continue;
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "upstream exchange failed");
                errors.push(format!("[{}: {}]", addr, e));
                continue;
            }
        };

        if reply.msg.response_code() == ResponseCode::NoError && !reply.msg.answers().is_empty() {
            race.cancel();
            return Ok(reply);
        }

        let p = priority(&reply.msg);
        match &best {
            Some((_, held)) if *held >= p => {}
            _ => best = Some((reply, p)),
        }
    }

    if let Some((reply, _)) = best {
        return Ok(reply);
    }

    // The caller's deadline passing is its own outcome, not an upstream
    // failure.
    if cancel.is_cancelled() {
        return Err(DnsError::Canceled);
    }

    let detail = if errors.is_empty() {
        "no upstream responded".to_string()
    } else {
        errors.join(", ")
    };
    Err(DnsError::AllUpstreamsFailed(detail))
}

/// Fallback ordering for responses without answers.
fn priority(msg: &Message) -> u8 {
    match msg.response_code() {
        ResponseCode::NXDomain => 3,
        ResponseCode::NoError => 2,
        ResponseCode::ServFail => 0,
        _ => 1,
    }
}
