//! Call signaling HTTP API.
//!
//! Every route authenticates with the same bearer token the WebSocket
//! upgrade accepts. Errors render as `{"error": {"code", "message"}}`.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parley_calls::{Call, CallError};
use parley_core::{CallId, UserId};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::auth::AuthFailure;
use crate::context::AppContext;

/// Upper bound on `/calls/history?limit=`.
const MAX_HISTORY_LIMIT: u32 = 200;
const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Call API routes, to be merged into the server router.
pub fn routes() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/calls", post(initiate_call))
        .route("/calls/history", get(call_history))
        .route("/calls/active", get(active_call))
        .route("/calls/{id}", get(get_call))
        .route("/calls/{id}/ring", post(ring))
        .route("/calls/{id}/accept", post(accept_call))
        .route("/calls/{id}/reject", post(reject_call))
        .route("/calls/{id}/hangup", post(hangup_call))
        .route("/calls/{id}/signal", post(send_signal))
}

/// An API error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"error": {"code": self.code, "message": self.message}});
        (self.status, Json(body)).into_response()
    }
}

impl From<AuthFailure> for ApiError {
    fn from(failure: AuthFailure) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", failure.to_string())
    }
}

impl From<CallError> for ApiError {
    fn from(err: CallError) -> Self {
        let status = match &err {
            CallError::CallNotFound(_) | CallError::UserNotFound(_) => StatusCode::NOT_FOUND,
            CallError::Forbidden(_) => StatusCode::FORBIDDEN,
            CallError::Conflict(_) => StatusCode::CONFLICT,
            CallError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CallError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "call store failure");
            return Self::new(status, err.code(), "internal error");
        }
        debug!(error = %err, "call request refused");
        Self::new(status, err.code(), err.to_string())
    }
}

/// The authenticated caller of an API route.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<Arc<AppContext>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, ctx: &Arc<AppContext>) -> Result<Self, Self::Rejection> {
        Ok(Self(ctx.authenticator.authenticate_bearer(&parts.headers)?))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateBody {
    callee_id: UserId,
}

#[derive(Debug, Deserialize)]
struct SignalBody {
    #[serde(rename = "type")]
    signal_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

type ApiResult<T> = Result<T, ApiError>;

async fn initiate_call(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user): AuthUser,
    Json(body): Json<InitiateBody>,
) -> ApiResult<(StatusCode, Json<Call>)> {
    let call = ctx.calls.initiate_call(&user, &body.callee_id).await?;
    Ok((StatusCode::CREATED, Json(call)))
}

async fn get_call(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user): AuthUser,
    Path(id): Path<CallId>,
) -> ApiResult<Json<Call>> {
    Ok(Json(ctx.calls.get_call(&user, &id).await?))
}

async fn ring(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user): AuthUser,
    Path(id): Path<CallId>,
) -> ApiResult<Json<Call>> {
    Ok(Json(ctx.calls.ring(&user, &id).await?))
}

async fn accept_call(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user): AuthUser,
    Path(id): Path<CallId>,
) -> ApiResult<Json<Call>> {
    Ok(Json(ctx.calls.accept_call(&user, &id).await?))
}

async fn reject_call(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user): AuthUser,
    Path(id): Path<CallId>,
) -> ApiResult<Json<Call>> {
    Ok(Json(ctx.calls.reject_call(&user, &id).await?))
}

async fn hangup_call(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user): AuthUser,
    Path(id): Path<CallId>,
) -> ApiResult<Json<Call>> {
    Ok(Json(ctx.calls.hangup_call(&user, &id).await?))
}

async fn send_signal(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user): AuthUser,
    Path(id): Path<CallId>,
    Json(body): Json<SignalBody>,
) -> ApiResult<Json<Value>> {
    let delivered = ctx
        .calls
        .send_signal(&user, &id, &body.signal_type, body.data)
        .await?;
    Ok(Json(json!({"delivered": delivered})))
}

async fn call_history(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<Call>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(ctx.calls.call_history(&user, limit).await?))
}

async fn active_call(
    State(ctx): State<Arc<AppContext>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Value>> {
    let call = ctx.calls.active_call(&user).await?;
    Ok(Json(json!({"call": call})))
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::test_support::{TestApp, token};
    use axum::body::Body;
    use axum::http::{Request, header};
    use tower::ServiceExt;

    async fn call_api(
        app: &TestApp,
        method: &str,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.router().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let app = TestApp::new();
        let (status, body) = call_api(&app, "GET", "/calls/history", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn full_call_flow() {
        let app = TestApp::new();
        app.users(&["alice", "bob"]);
        app.contacts("alice", "bob");

        let (status, call) = call_api(&app, "POST", "/calls", Some("alice"), Some(json!({"calleeId": "bob"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(call["status"], "initiated");
        let id = call["id"].as_str().unwrap().to_string();

        let (status, call) = call_api(&app, "POST", &format!("/calls/{id}/ring"), Some("bob"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(call["status"], "ringing");

        let (status, call) = call_api(&app, "POST", &format!("/calls/{id}/accept"), Some("bob"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(call["status"], "connected");

        let (status, body) = call_api(
            &app,
            "POST",
            &format!("/calls/{id}/signal"),
            Some("alice"),
            Some(json!({"type": "offer", "data": {"sdp": "v=0"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], 0);

        let (status, call) = call_api(&app, "POST", &format!("/calls/{id}/hangup"), Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(call["status"], "ended");
        assert_eq!(call["endReason"], "caller_hangup");

        let (status, history) = call_api(&app, "GET", "/calls/history?limit=10", Some("bob"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn error_mapping() {
        let app = TestApp::new();
        app.users(&["alice", "bob", "carol", "mallory"]);
        app.contacts("alice", "bob");
        app.contacts("carol", "bob");

        let (status, body) = call_api(&app, "POST", "/calls", Some("alice"), Some(json!({"calleeId": "nobody"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (status, _) = call_api(&app, "POST", "/calls", Some("alice"), Some(json!({"calleeId": "mallory"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, call) = call_api(&app, "POST", "/calls", Some("alice"), Some(json!({"calleeId": "bob"}))).await;
        let id = call["id"].as_str().unwrap().to_string();

        let (status, body) = call_api(&app, "POST", "/calls", Some("carol"), Some(json!({"calleeId": "bob"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CONFLICT");

        let (status, _) = call_api(&app, "GET", &format!("/calls/{id}"), Some("mallory"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call_api(&app, "POST", &format!("/calls/{id}/accept"), Some("alice"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call_api(&app, "POST", "/calls/unknown/hangup", Some("alice"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call_api(&app, "POST", &format!("/calls/{id}/reject"), Some("bob"), None).await;
        let (status, body) = call_api(&app, "POST", &format!("/calls/{id}/hangup"), Some("alice"), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "INVALID_STATE");
    }

    #[tokio::test]
    async fn active_call_lookup() {
        let app = TestApp::new();
        app.users(&["alice", "bob"]);
        app.contacts("alice", "bob");

        let (_, body) = call_api(&app, "GET", "/calls/active", Some("alice"), None).await;
        assert!(body["call"].is_null());

        call_api(&app, "POST", "/calls", Some("alice"), Some(json!({"calleeId": "bob"}))).await;
        let (status, body) = call_api(&app, "GET", "/calls/active", Some("bob"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["call"]["callerId"], "alice");
    }
}
