//! Integration tests for the JSON-RPC pump over in-memory streams:
//! correlation, out-of-order responses, inbound classification,
//! cancellation, and close behavior.

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use agent_switchboard::acp::transport::Inbound;
use agent_switchboard::AppError;

use super::test_helpers::wire_transport;

/// An outbound call resolves with the result correlated by id.
#[tokio::test]
async fn request_resolves_with_result() {
    let (transport, _inbound, mut agent) = wire_transport("t");

    let agent_task = tokio::spawn(async move {
        let request = agent.recv().await;
        assert_eq!(request["method"], "initialize");
        assert_eq!(request["jsonrpc"], "2.0");
        agent
            .respond(&request["id"], json!({ "protocolVersion": 1 }))
            .await;
        agent
    });

    let result = transport
        .request("initialize", json!({ "protocolVersion": 1 }))
        .await
        .expect("request must resolve");
    assert_eq!(result["protocolVersion"], 1);

    agent_task.await.expect("agent task");
}

/// Responses may return out of call order; each resolves its own waiter.
#[tokio::test]
async fn out_of_order_responses_correlate() {
    let (transport, _inbound, mut agent) = wire_transport("t");

    let agent_task = tokio::spawn(async move {
        let first = agent.recv().await;
        let second = agent.recv().await;
        // Answer in reverse order.
        agent.respond(&second["id"], json!({ "tag": "second" })).await;
        agent.respond(&first["id"], json!({ "tag": "first" })).await;
        agent
    });

    let (first, second) = tokio::join!(
        transport.request("one", json!({})),
        transport.request("two", json!({})),
    );
    assert_eq!(first.expect("first")["tag"], "first");
    assert_eq!(second.expect("second")["tag"], "second");

    agent_task.await.expect("agent task");
}

/// A JSON-RPC error response surfaces as a protocol error.
#[tokio::test]
async fn error_response_is_protocol_error() {
    let (transport, _inbound, mut agent) = wire_transport("t");

    let agent_task = tokio::spawn(async move {
        let request = agent.recv().await;
        agent
            .respond_error(&request["id"], -32000, "model overloaded")
            .await;
        agent
    });

    match transport.request("session/prompt", json!({})).await {
        Err(AppError::Protocol(msg)) => {
            assert!(msg.contains("model overloaded"), "got: {msg}");
            assert!(msg.contains("-32000"), "code must be included: {msg}");
        }
        other => panic!("expected Protocol error, got {other:?}"),
    }

    agent_task.await.expect("agent task");
}

/// Notifications arrive on the inbound channel without a reply path.
#[tokio::test]
async fn notification_is_classified() {
    let (_transport, mut inbound, mut agent) = wire_transport("t");

    agent
        .notify("session/update", json!({ "sessionId": "s" }))
        .await;

    match inbound.recv().await.expect("inbound frame") {
        Inbound::Notification { method, params } => {
            assert_eq!(method, "session/update");
            assert_eq!(params["sessionId"], "s");
        }
        other => panic!("expected a notification, got {other:?}"),
    }
}

/// An agent-initiated request is classified and its responder routes the
/// reply back with the same id.
#[tokio::test]
async fn inbound_request_round_trips() {
    let (_transport, mut inbound, mut agent) = wire_transport("t");

    agent
        .request("perm-1", "session/request_permission", json!({ "x": 1 }))
        .await;

    let responder = match inbound.recv().await.expect("inbound frame") {
        Inbound::Request {
            id,
            method,
            params,
            responder,
        } => {
            assert_eq!(id, "perm-1");
            assert_eq!(method, "session/request_permission");
            assert_eq!(params["x"], 1);
            responder
        }
        other => panic!("expected a request, got {other:?}"),
    };

    responder
        .ok(json!({ "outcome": { "outcome": "cancelled" } }))
        .await;

    let reply = agent.recv().await;
    assert_eq!(reply["id"], "perm-1");
    assert_eq!(reply["result"]["outcome"]["outcome"], "cancelled");
}

/// Dropping the agent side closes the transport: pending calls fail and
/// `Closed` is delivered.
#[tokio::test]
async fn eof_fails_pending_and_closes() {
    let (transport, mut inbound, agent) = wire_transport("t");

    let pending = {
        let transport = std::sync::Arc::clone(&transport);
        tokio::spawn(async move { transport.request("session/prompt", json!({})).await })
    };

    // Give the call time to enter the pending table, then hang up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(agent);

    let outcome = pending.await.expect("task");
    assert!(
        matches!(outcome, Err(AppError::Acp(_))),
        "pending call must fail on close, got {outcome:?}"
    );

    let saw_closed = loop {
        match inbound.recv().await {
            Some(Inbound::Closed { .. }) => break true,
            Some(_) => continue,
            None => break false,
        }
    };
    assert!(saw_closed, "Closed frame must be delivered");
    assert!(!transport.is_running(), "transport must mark itself down");
}

/// A frame that is not JSON closes the transport (spec: malformed frames
/// are transport errors, not skippable noise).
#[tokio::test]
async fn malformed_frame_closes_transport() {
    let (transport, mut inbound, mut agent) = wire_transport("t");

    agent.send(&json!({ "jsonrpc": "2.0", "method": "ok", "params": {} })).await;
    agent.send_raw(b"this is not json\n").await;

    let mut saw_closed = false;
    while let Some(frame) = inbound.recv().await {
        if let Inbound::Closed { reason } = frame {
            assert!(reason.contains("malformed"), "got reason: {reason}");
            saw_closed = true;
            break;
        }
    }
    assert!(saw_closed, "malformed frame must close the transport");
    assert!(!transport.is_running());
}

/// Cancelling a call releases the waiter; the late response is dropped and
/// the transport keeps working.
#[tokio::test]
async fn cancelled_call_abandons_id() {
    let (transport, _inbound, mut agent) = wire_transport("t");

    let cancel = CancellationToken::new();
    let first = agent.recv();

    let call = transport.request_with_cancel("session/prompt", json!({}), &cancel);
    cancel.cancel();
    let outcome = call.await;
    assert!(
        matches!(outcome, Err(AppError::Cancelled(_))),
        "got {outcome:?}"
    );

    // The request was written before cancellation; answer it late.
    let request = first.await;
    agent.respond(&request["id"], json!({ "tag": "late" })).await;

    // A fresh call still works — the late response did not poison the pump.
    let agent_task = tokio::spawn(async move {
        let request = agent.recv().await;
        agent.respond(&request["id"], json!({ "tag": "fresh" })).await;
    });
    let fresh = transport
        .request("session/new", json!({}))
        .await
        .expect("fresh call");
    assert_eq!(fresh["tag"], "fresh");
    agent_task.await.expect("agent task");
}
