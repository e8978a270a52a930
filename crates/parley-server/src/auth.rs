//! Upgrade authentication: token and device extraction.
//!
//! The token comes from the `token` query parameter or an
//! `Authorization: Bearer` header; the device from `deviceId` or
//! `x-device-id`, falling back to a generated `{userId}-{millis}`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parley_core::{Claims, DeviceId, TokenVerifier, UserId, VerifyError};
use thiserror::Error;

/// Header carrying the device id when it is not in the query.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// The parts of an upgrade request the authenticator looks at.
#[derive(Clone, Debug, Default)]
pub struct UpgradeRequest {
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
    /// Request headers.
    pub headers: HeaderMap,
}

impl UpgradeRequest {
    /// Bundle query and headers.
    pub fn new(query: HashMap<String, String>, headers: HeaderMap) -> Self {
        Self { query, headers }
    }

    fn token(&self) -> Option<String> {
        if let Some(token) = self.query.get("token").filter(|t| !t.is_empty()) {
            return Some(token.clone());
        }
        bearer_token(&self.headers)
    }

    fn device_id(&self) -> Option<DeviceId> {
        if let Some(id) = self.query.get("deviceId").filter(|d| !d.is_empty()) {
            return Some(DeviceId::from(id.as_str()));
        }
        self.headers
            .get(DEVICE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(DeviceId::from)
    }
}

/// Token from `Authorization: Bearer <token>`; the scheme is case-insensitive.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Why a request was not authenticated. Every variant closes with 4001.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No token in query or header.
    #[error("missing token")]
    MissingToken,
    /// Token past its expiry.
    #[error("token expired")]
    Expired,
    /// Token rejected by the verifier.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Token verified but carries no subject.
    #[error("token has no subject")]
    MissingSubject,
}

impl AuthFailure {
    /// `"missing"` when no credentials were offered, `"invalid"` otherwise.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing",
            Self::Expired | Self::InvalidToken(_) | Self::MissingSubject => "invalid",
        }
    }
}

impl From<VerifyError> for AuthFailure {
    fn from(error: VerifyError) -> Self {
        match error {
            VerifyError::Expired => Self::Expired,
            VerifyError::Invalid(reason) => Self::InvalidToken(reason),
        }
    }
}

/// Identity of an authenticated connection.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionInfo {
    /// Token subject.
    pub user_id: UserId,
    /// Supplied or generated device id.
    pub device_id: DeviceId,
    /// Full verified claims.
    pub claims: Claims,
}

/// Authenticates upgrades and API calls against a [`TokenVerifier`].
#[derive(Clone)]
pub struct Authenticator {
    verifier: Arc<dyn TokenVerifier>,
}

impl Authenticator {
    /// Authenticate with `verifier`.
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Authenticate a WebSocket upgrade.
    pub fn authenticate(&self, request: &UpgradeRequest) -> Result<ConnectionInfo, AuthFailure> {
        let token = request.token().ok_or(AuthFailure::MissingToken)?;
        let (user_id, claims) = self.verify(&token)?;
        let device_id = request
            .device_id()
            .unwrap_or_else(|| DeviceId::fallback_for(&user_id, parley_core::now_millis()));
        Ok(ConnectionInfo {
            user_id,
            device_id,
            claims,
        })
    }

    /// Authenticate an HTTP API call by its bearer token.
    pub fn authenticate_bearer(&self, headers: &HeaderMap) -> Result<UserId, AuthFailure> {
        let token = bearer_token(headers).ok_or(AuthFailure::MissingToken)?;
        let (user_id, _) = self.verify(&token)?;
        Ok(user_id)
    }

    fn verify(&self, token: &str) -> Result<(UserId, Claims), AuthFailure> {
        let claims = self.verifier.verify(token)?;
        let user_id = claims
            .sub
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(UserId::from)
            .ok_or(AuthFailure::MissingSubject)?;
        Ok((user_id, claims))
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

/// HS256 JWT verifier with an optional required issuer.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Verify HS256 tokens signed with `secret`, requiring `iss == issuer` when set.
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Invalid(e.to_string()),
            })
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("issuer", &self.validation.iss)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn token(claims: serde_json::Value) -> String {
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn valid_token(sub: &str) -> String {
        let exp = chrono::Utc::now().timestamp() + 3600;
        token(json!({"sub": sub, "exp": exp}))
    }

    fn authenticator() -> Authenticator {
        Authenticator::new(Arc::new(JwtVerifier::new(SECRET, None)))
    }

    fn query(pairs: &[(&str, &str)]) -> UpgradeRequest {
        UpgradeRequest::new(
            pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect(),
            HeaderMap::new(),
        )
    }

    #[test]
    fn query_token_and_device() {
        let t = valid_token("alice");
        let info = authenticator()
            .authenticate(&query(&[("token", &t), ("deviceId", "phone")]))
            .unwrap();
        assert_eq!(info.user_id, UserId::from("alice"));
        assert_eq!(info.device_id, DeviceId::from("phone"));
        assert_eq!(info.claims.sub.as_deref(), Some("alice"));
    }

    #[test]
    fn header_token_and_device() {
        let mut headers = HeaderMap::new();
        let bearer = format!("bearer {}", valid_token("bob"));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&bearer).unwrap());
        headers.insert(DEVICE_ID_HEADER, HeaderValue::from_static("tablet"));
        let info = authenticator()
            .authenticate(&UpgradeRequest::new(HashMap::new(), headers))
            .unwrap();
        assert_eq!(info.user_id, UserId::from("bob"));
        assert_eq!(info.device_id, DeviceId::from("tablet"));
    }

    #[test]
    fn query_wins_over_header() {
        let mut request = query(&[("token", &valid_token("alice")), ("deviceId", "q")]);
        request.headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", valid_token("mallory"))).unwrap(),
        );
        request.headers.insert(DEVICE_ID_HEADER, HeaderValue::from_static("h"));
        let info = authenticator().authenticate(&request).unwrap();
        assert_eq!(info.user_id, UserId::from("alice"));
        assert_eq!(info.device_id, DeviceId::from("q"));
    }

    #[test]
    fn missing_device_falls_back_to_user_and_time() {
        let info = authenticator()
            .authenticate(&query(&[("token", &valid_token("carol"))]))
            .unwrap();
        let suffix = info.device_id.strip_prefix("carol-").unwrap();
        assert!(suffix.parse::<i64>().is_ok());
    }

    #[test]
    fn missing_token() {
        let err = authenticator().authenticate(&query(&[])).unwrap_err();
        assert_eq!(err, AuthFailure::MissingToken);
        assert_eq!(err.kind(), "missing");
    }

    #[test]
    fn expired_token() {
        let exp = chrono::Utc::now().timestamp() - 3600;
        let t = token(json!({"sub": "alice", "exp": exp}));
        let err = authenticator().authenticate(&query(&[("token", &t)])).unwrap_err();
        assert_eq!(err, AuthFailure::Expired);
        assert_eq!(err.kind(), "invalid");
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let other = Authenticator::new(Arc::new(JwtVerifier::new("other", None)));
        let err = other
            .authenticate(&query(&[("token", &valid_token("alice"))]))
            .unwrap_err();
        assert_matches!(err, AuthFailure::InvalidToken(_));
    }

    #[test]
    fn garbage_token_is_invalid() {
        let err = authenticator()
            .authenticate(&query(&[("token", "not-a-jwt")]))
            .unwrap_err();
        assert_matches!(err, AuthFailure::InvalidToken(_));
    }

    #[test]
    fn token_without_subject() {
        let exp = chrono::Utc::now().timestamp() + 3600;
        let t = token(json!({"exp": exp}));
        let err = authenticator().authenticate(&query(&[("token", &t)])).unwrap_err();
        assert_eq!(err, AuthFailure::MissingSubject);
    }

    #[test]
    fn issuer_is_enforced_when_configured() {
        let strict = Authenticator::new(Arc::new(JwtVerifier::new(SECRET, Some("parley"))));
        let exp = chrono::Utc::now().timestamp() + 3600;
        let good = token(json!({"sub": "a", "exp": exp, "iss": "parley"}));
        let bad = token(json!({"sub": "a", "exp": exp, "iss": "elsewhere"}));
        assert!(strict.authenticate(&query(&[("token", &good)])).is_ok());
        assert_matches!(
            strict.authenticate(&query(&[("token", &bad)])),
            Err(AuthFailure::InvalidToken(_))
        );
    }

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("BEARER abc"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn api_bearer_authentication() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", valid_token("dave"))).unwrap(),
        );
        assert_eq!(authenticator().authenticate_bearer(&headers), Ok(UserId::from("dave")));
        assert_eq!(
            authenticator().authenticate_bearer(&HeaderMap::new()),
            Err(AuthFailure::MissingToken)
        );
    }
}
