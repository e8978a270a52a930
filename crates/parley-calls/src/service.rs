//! Call signaling service.
//!
//! Every mutation follows the same shape: load the call inside a
//! `BEGIN IMMEDIATE` transaction, check participant and role, consult
//! [`transition`], write the new row, commit, and only then push the
//! resulting event through the [`EventSink`]. Pushes are best-effort and
//! never fail the operation.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parley_core::frames::event_type;
use parley_core::metric::{CALLS_CONFLICTS_TOTAL, CALLS_INITIATED_TOTAL};
use parley_core::{CallId, EventSink, PushNotification, PushSender, ServerEvent, UserId};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::errors::CallError;
use crate::sqlite::repositories::{CallRepo, ConversationRepo, UserRepo};
use crate::sqlite::store::CallStore;
use crate::status::{CallAction, CallStatus, EndReason, Role, transition};
use crate::types::{Call, SignalPayload};

/// Persisted call lifecycle with participant guards.
#[derive(Clone)]
pub struct CallService {
    store: CallStore,
    sink: Arc<dyn EventSink>,
    push: Arc<dyn PushSender>,
    clock: Arc<dyn Clock>,
}

impl CallService {
    /// Create a service. `sink` receives every call event; `push` is the
    /// offline fallback for invites.
    pub fn new(
        store: CallStore,
        sink: Arc<dyn EventSink>,
        push: Arc<dyn PushSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            sink,
            push,
            clock,
        }
    }

    /// Start a call from `caller` to `callee`.
    ///
    /// Fails with `Forbidden` for a self-call or a non-contact, `UserNotFound`
    /// for an unknown callee, and `Conflict` if either party already has a
    /// non-terminal call in any role. The busy check and the insert share one
    /// write transaction, so two overlapping initiations cannot both pass.
    #[instrument(skip_all, fields(caller = %caller, callee = %callee))]
    pub async fn initiate_call(&self, caller: &UserId, callee: &UserId) -> Result<Call, CallError> {
        if caller == callee {
            return Err(CallError::Forbidden("cannot call yourself".into()));
        }

        let (caller_id, callee_id) = (caller.clone(), callee.clone());
        let now = self.clock.now_millis();
        let result = self
            .store
            .blocking(move |store| {
                store.immediate(|tx| {
                    if !UserRepo::exists(tx, &callee_id)? {
                        return Err(CallError::UserNotFound(callee_id.clone()));
                    }
                    if !UserRepo::is_contact(tx, &caller_id, &callee_id)? {
                        return Err(CallError::Forbidden(format!(
                            "{callee_id} is not a contact of {caller_id}"
                        )));
                    }
                    if CallRepo::any_active_for(tx, &[&caller_id, &callee_id])? {
                        return Err(CallError::Conflict(
                            "caller or callee is already in a call".into(),
                        ));
                    }

                    let conversation_id =
                        ConversationRepo::get_or_create_private(tx, &caller_id, &callee_id, now)?;
                    let call = Call {
                        id: CallId::new(),
                        conversation_id,
                        caller_id: caller_id.clone(),
                        callee_id: callee_id.clone(),
                        status: CallStatus::Initiated,
                        created_at: now,
                        started_at: None,
                        ended_at: None,
                        duration: None,
                        end_reason: None,
                    };
                    CallRepo::insert(tx, &call)?;
                    Ok(call)
                })
            })
            .await;

        let call = match result {
            Ok(call) => call,
            Err(e @ CallError::Conflict(_)) => {
                counter!(CALLS_CONFLICTS_TOTAL).increment(1);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        counter!(CALLS_INITIATED_TOTAL).increment(1);
        info!(call_id = %call.id, "call initiated");

        let delivered = self
            .notify(&call.callee_id, event_type::CALL_INVITE, call_payload(&call))
            .await;
        if delivered == 0 {
            self.push_invite(&call).await;
        }
        Ok(call)
    }

    /// Callee's device is ringing. Valid only from `initiated`.
    pub async fn ring(&self, callee: &UserId, call_id: &CallId) -> Result<Call, CallError> {
        let (call, _) = self.apply(Some(callee), call_id, CallAction::Ring).await?;
        let _ = self
            .notify(&call.caller_id, event_type::CALL_RINGING, call_payload(&call))
            .await;
        Ok(call)
    }

    /// Callee accepts. Stamps `started_at`.
    pub async fn accept_call(&self, callee: &UserId, call_id: &CallId) -> Result<Call, CallError> {
        let (call, _) = self.apply(Some(callee), call_id, CallAction::Accept).await?;
        let _ = self
            .notify(&call.caller_id, event_type::CALL_ACCEPTED, call_payload(&call))
            .await;
        Ok(call)
    }

    /// Callee declines.
    pub async fn reject_call(&self, callee: &UserId, call_id: &CallId) -> Result<Call, CallError> {
        let (call, _) = self.apply(Some(callee), call_id, CallAction::Reject).await?;
        let _ = self
            .notify(&call.caller_id, event_type::CALL_REJECTED, call_payload(&call))
            .await;
        Ok(call)
    }

    /// Either participant leaves. A connected call becomes `ended` and the
    /// other side gets `call:ended`; an unanswered one becomes `missed` and
    /// the other side gets `call:cancelled`.
    pub async fn hangup_call(&self, actor: &UserId, call_id: &CallId) -> Result<Call, CallError> {
        let (call, role) = self.apply(Some(actor), call_id, CallAction::Hangup).await?;
        let event = if call.status == CallStatus::Ended {
            event_type::CALL_ENDED
        } else {
            event_type::CALL_CANCELLED
        };
        if let Some(role) = role {
            let _ = self
                .notify(call.counterpart(role), event, call_payload(&call))
                .await;
        }
        Ok(call)
    }

    /// Nobody answered. Callee sees a missed call, caller a cancellation.
    pub async fn mark_timeout(&self, call_id: &CallId) -> Result<Call, CallError> {
        let (call, _) = self.apply(None, call_id, CallAction::Timeout).await?;
        let payload = call_payload(&call);
        let _ = self
            .notify(&call.callee_id, event_type::CALL_MISSED, payload.clone())
            .await;
        let _ = self
            .notify(&call.caller_id, event_type::CALL_CANCELLED, payload)
            .await;
        Ok(call)
    }

    /// Relay an opaque signaling payload to the other participant.
    /// Nothing is written.
    pub async fn send_signal(
        &self,
        actor: &UserId,
        call_id: &CallId,
        signal_type: &str,
        data: Value,
    ) -> Result<usize, CallError> {
        let call = self.load(call_id).await?;
        let role = participant_role(&call, actor, CallAction::Signal)?;
        if transition(call.status, CallAction::Signal).is_none() {
            return Err(CallError::InvalidTransition {
                from: call.status,
                action: CallAction::Signal,
            });
        }

        let payload = SignalPayload {
            call_id: call.id.clone(),
            from_user_id: actor.clone(),
            signal_type: signal_type.to_string(),
            data,
        };
        let payload = serde_json::to_value(&payload).unwrap_or(Value::Null);
        Ok(self
            .notify(call.counterpart(role), event_type::CALL_SIGNAL, payload)
            .await)
    }

    /// Fetch a call the actor participates in.
    pub async fn get_call(&self, actor: &UserId, call_id: &CallId) -> Result<Call, CallError> {
        let call = self.load(call_id).await?;
        if call.role_of(actor).is_none() {
            return Err(CallError::Forbidden("not a participant of this call".into()));
        }
        Ok(call)
    }

    /// The user's calls, newest first.
    pub async fn call_history(&self, user: &UserId, limit: u32) -> Result<Vec<Call>, CallError> {
        let user = user.clone();
        self.store
            .blocking(move |store| {
                store.read(|conn| CallRepo::history(conn, &user, limit).map_err(CallError::from))
            })
            .await
    }

    /// The user's non-terminal call, if any.
    pub async fn active_call(&self, user: &UserId) -> Result<Option<Call>, CallError> {
        let user = user.clone();
        self.store
            .blocking(move |store| {
                store.read(|conn| CallRepo::active_for(conn, &user).map_err(CallError::from))
            })
            .await
    }

    /// Time out every `initiated`/`ringing` call older than `ring_timeout`.
    /// Calls answered or hung up in the meantime are skipped.
    pub async fn expire_unanswered(&self, ring_timeout: Duration) -> Result<Vec<Call>, CallError> {
        let timeout_ms = i64::try_from(ring_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_millis().saturating_sub(timeout_ms);
        let ids = self
            .store
            .blocking(move |store| {
                store.read(|conn| CallRepo::unanswered_before(conn, cutoff).map_err(CallError::from))
            })
            .await?;

        let mut expired = Vec::with_capacity(ids.len());
        for id in ids {
            match self.mark_timeout(&id).await {
                Ok(call) => expired.push(call),
                Err(CallError::InvalidTransition { .. } | CallError::CallNotFound(_)) => {
                    debug!(call_id = %id, "call settled before timeout");
                }
                Err(e) => warn!(call_id = %id, error = %e, "failed to time out call"),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "timed out unanswered calls");
        }
        Ok(expired)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internal
    // ─────────────────────────────────────────────────────────────────────

    async fn load(&self, call_id: &CallId) -> Result<Call, CallError> {
        let id = call_id.clone();
        self.store
            .blocking(move |store| {
                store.read(|conn| {
                    CallRepo::get(conn, &id)?.ok_or_else(|| CallError::CallNotFound(id.clone()))
                })
            })
            .await
    }

    /// Load, guard, transition and persist. `actor` is `None` for
    /// system-triggered actions. Returns the updated call and the actor's role.
    async fn apply(
        &self,
        actor: Option<&UserId>,
        call_id: &CallId,
        action: CallAction,
    ) -> Result<(Call, Option<Role>), CallError> {
        let actor = actor.cloned();
        let id = call_id.clone();
        let now = self.clock.now_millis();

        let (call, role) = self
            .store
            .blocking(move |store| {
                store.immediate(|tx| {
                    let mut call = CallRepo::get(tx, &id)?
                        .ok_or_else(|| CallError::CallNotFound(id.clone()))?;
                    let role = actor
                        .as_ref()
                        .map(|actor| participant_role(&call, actor, action))
                        .transpose()?;
                    let next = transition(call.status, action).ok_or(CallError::InvalidTransition {
                        from: call.status,
                        action,
                    })?;

                    settle(&mut call, next, action, role, now);
                    CallRepo::update(tx, &call)?;
                    Ok::<_, CallError>((call, role))
                })
            })
            .await?;

        info!(call_id = %call.id, status = %call.status, action = %action, "call transitioned");
        Ok((call, role))
    }

    async fn notify(&self, user: &UserId, event: &str, payload: Value) -> usize {
        let delivered = self
            .sink
            .send_to_user(user, &ServerEvent::new(event, payload))
            .await;
        debug!(user_id = %user, event, delivered, "call event pushed");
        delivered
    }

    async fn push_invite(&self, call: &Call) {
        let notification = PushNotification {
            title: "Incoming call".into(),
            body: format!("{} is calling", call.caller_id),
            data: json!({
                "type": event_type::CALL_INVITE,
                "callId": call.id,
                "callerId": call.caller_id,
            }),
        };
        if let Err(e) = self.push.send(&call.callee_id, notification).await {
            warn!(call_id = %call.id, error = %e, "offline invite push failed");
        }
    }
}

/// Role of `actor` in `call`, checked against what `action` allows.
fn participant_role(call: &Call, actor: &UserId, action: CallAction) -> Result<Role, CallError> {
    let role = call
        .role_of(actor)
        .ok_or_else(|| CallError::Forbidden("not a participant of this call".into()))?;
    if !action.permits(role) {
        return Err(CallError::Forbidden(format!("only the callee may {action}")));
    }
    Ok(role)
}

/// Apply the side effects of reaching `next` via `action`.
fn settle(call: &mut Call, next: CallStatus, action: CallAction, role: Option<Role>, now: i64) {
    call.status = next;
    match action {
        CallAction::Accept => call.started_at = Some(now),
        CallAction::Reject => {
            call.ended_at = Some(now);
            call.end_reason = Some(EndReason::CalleeHangup);
        }
        CallAction::Hangup => {
            call.ended_at = Some(now);
            call.duration = call.started_at.map(|start| (now - start).max(0) / 1000);
            call.end_reason = role.map(EndReason::hangup_by);
        }
        CallAction::Timeout => {
            call.ended_at = Some(now);
            call.end_reason = Some(EndReason::Timeout);
        }
        CallAction::Ring | CallAction::Signal => {}
    }
}

fn call_payload(call: &Call) -> Value {
    serde_json::to_value(call).unwrap_or(Value::Null)
}
