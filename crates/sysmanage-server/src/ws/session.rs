//! Agent session loop.
//!
//! One task per connection drives both halves cooperatively with `select!`:
//! the inbound reader (frame → integrity check → handler dispatch →
//! synchronous response) and the outbound drainer (1 s tick or enqueue
//! notification → dequeue batch → send → ack). A single writer means
//! outbound order is exactly dequeue order: strict priority, FIFO within
//! priority.
//!
//! Closing the session never loses commands — undelivered `in_flight`
//! entries are swept back to `pending` on the way out, and the next
//! connection resumes them.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use sysmanage_core::audit::AuditContext;
use sysmanage_core::queue::DRAIN_BATCH;
use sysmanage_db::models::{AuditResult, Host};

use crate::handlers::{self, AgentSession, Envelope};
use crate::state::AppContext;

/// Outbound write timeout.
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Drainer tick when no notification arrives.
const DRAIN_TICK: Duration = Duration::from_secs(1);

/// Drive one authenticated agent session until either side closes.
pub async fn run(
    mut socket: WebSocket,
    ctx: Arc<AppContext>,
    host: Host,
    connection_id: String,
    client_ip: String,
) {
    let session = AgentSession {
        ctx: Arc::clone(&ctx),
        host_id: host.id,
        fqdn: host.fqdn.clone(),
        connection_id: connection_id.clone(),
        client_ip,
    };

    let close_signal = ctx.sessions.attach(host.id, &connection_id).await;
    let notify = ctx.notifier.subscribe(host.id).await;
    let mut tick = tokio::time::interval(DRAIN_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let Some(response) = process_frame(&session, text.as_str()).await else {
                            continue;
                        };
                        if send_json(&mut socket, &response).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary frames are ignored
                }
            }
            () = notify.notified() => {
                if drain_outbound(&session, &mut socket).await.is_err() {
                    break;
                }
            }
            _ = tick.tick() => {
                if drain_outbound(&session, &mut socket).await.is_err() {
                    break;
                }
            }
            () = close_signal.notified() => {
                debug!(host_id = %host.id, "session superseded by newer connection");
                break;
            }
        }
    }

    // Recovery sweep: whatever we claimed but did not deliver goes back to
    // pending for the next connection.
    if let Err(e) = ctx.queue.recover_in_flight(host.id).await {
        warn!(host_id = %host.id, error = %e, "in-flight recovery failed at session end");
    }
    ctx.sessions.detach(host.id, &connection_id).await;

    info!(host_id = %host.id, fqdn = %host.fqdn, "agent session closed");
}

/// Handle one inbound frame; returns the response to send, if any.
async fn process_frame(session: &AgentSession, text: &str) -> Option<serde_json::Value> {
    let ctx = &session.ctx;

    let Ok(raw) = serde_json::from_str::<serde_json::Value>(text) else {
        return Some(json!({
            "message_type": "error",
            "error_type": "invalid_json",
            "message": "frame is not valid JSON",
            "data": {},
        }));
    };

    if let Err(violation) = ctx
        .comsec
        .validate_message_integrity(&raw, &session.connection_id, Utc::now())
        .await
    {
        warn!(
            connection_id = %session.connection_id,
            %violation,
            "message failed integrity validation"
        );
        return Some(json!({
            "message_type": "error",
            "error_type": "integrity_violation",
            "message": violation.to_string(),
            "data": {},
        }));
    }

    let Some(envelope) = Envelope::parse(raw) else {
        return Some(json!({
            "message_type": "error",
            "error_type": "invalid_envelope",
            "message": "missing message_type",
            "data": {},
        }));
    };

    let message_type = envelope.message_type.clone();
    let Some(handler) = ctx.handlers.get(&message_type) else {
        audit_failure(
            session,
            &message_type,
            &format!("Unknown agent message type '{message_type}'"),
            None,
        )
        .await;
        return Some(handlers::unknown_type_response(&message_type));
    };

    let mut tx = match ctx.pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            warn!(error = %e, "failed to open handler transaction");
            return Some(handlers::handler_error_response(&e.into()));
        }
    };

    match handler(&mut tx, session, envelope).await {
        Ok(response) => match tx.commit().await {
            Ok(()) => response,
            Err(e) => {
                warn!(error = %e, message_type, "handler commit failed");
                Some(handlers::handler_error_response(&e.into()))
            }
        },
        Err(error) => {
            // Roll back, audit the failure outside the dead transaction,
            // answer with an error frame, keep the session open.
            drop(tx);
            warn!(message_type, error = %error, "handler failed; transaction rolled back");
            audit_failure(
                session,
                &message_type,
                &format!("Handler for '{message_type}' failed"),
                Some(error.to_string()),
            )
            .await;
            Some(handlers::handler_error_response(&error))
        }
    }
}

/// Drain due outbound entries to the socket, acking each outcome.
///
/// A write failure marks the entry for retry and returns `Err` so the
/// caller closes the session; the reconnect resumes delivery.
async fn drain_outbound(session: &AgentSession, socket: &mut WebSocket) -> Result<(), ()> {
    let ctx = &session.ctx;
    let entries = match ctx.queue.dequeue_outbound(session.host_id, DRAIN_BATCH).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(host_id = %session.host_id, error = %e, "outbound dequeue failed");
            return Ok(());
        }
    };

    for entry in entries {
        match send_json(socket, &entry.payload).await {
            Ok(()) => {
                if let Err(e) = ctx.queue.ack_delivered(entry.id).await {
                    warn!(entry_id = %entry.id, error = %e, "delivered ack failed");
                }
            }
            Err(write_error) => {
                if let Err(e) = ctx
                    .queue
                    .ack_failed(entry.id, &write_error, true)
                    .await
                {
                    warn!(entry_id = %entry.id, error = %e, "failure ack failed");
                }
                return Err(());
            }
        }
    }
    Ok(())
}

/// Serialize and send one JSON frame with the write timeout.
async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), String> {
    let text = value.to_string();
    match tokio::time::timeout(WRITE_TIMEOUT, socket.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("websocket write failed: {e}")),
        Err(_) => Err("websocket write timed out".to_owned()),
    }
}

/// Record a handler/dispatch failure in its own transaction (the handler's
/// transaction, if any, is already rolled back).
async fn audit_failure(
    session: &AgentSession,
    message_type: &str,
    description: &str,
    error_message: Option<String>,
) {
    let ctx = &session.ctx;
    let result: Result<(), crate::error::ApiError> = async {
        let mut tx = ctx.pool.begin().await?;
        ctx.audit
            .log_agent_message(
                &mut tx,
                &session.fqdn,
                message_type,
                description,
                AuditResult::Failure,
                AuditContext {
                    entity_id: Some(session.host_id.to_string()),
                    ip_address: Some(session.client_ip.clone()),
                    error_message,
                    ..AuditContext::default()
                },
            )
            .await?;
        tx.commit().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        warn!(error = %e, "failed to audit handler failure");
    }
}
