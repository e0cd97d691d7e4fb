// Token inspection
// Picks the authorization scheme per token and reads JWT expiry claims

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SessionError};

/// Structural kind of an access token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormat {
    /// Three dot-separated segments
    Jwt,
    /// Anything else
    Opaque,
}

impl TokenFormat {
    /// Authorization scheme used for tokens of this format
    pub fn scheme(&self) -> &'static str {
        match self {
            TokenFormat::Jwt => "Bearer",
            TokenFormat::Opaque => "Token",
        }
    }
}

/// Classify a token, rejecting values that cannot be sent in a header
pub fn classify(token: &str) -> Result<TokenFormat> {
    if token.is_empty() {
        return Err(SessionError::MalformedToken("token is empty".to_string()));
    }
    if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(SessionError::MalformedToken(
            "token contains whitespace or control characters".to_string(),
        ));
    }

    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() == 3 && segments.iter().all(|s| !s.is_empty()) {
        Ok(TokenFormat::Jwt)
    } else {
        Ok(TokenFormat::Opaque)
    }
}

/// `Authorization` header value for this token
pub fn authorization_value(token: &str) -> Result<String> {
    let format = classify(token)?;
    Ok(format!("{} {}", format.scheme(), token))
}

/// Claims this crate cares about
#[derive(Debug, Clone, PartialEq)]
pub struct TokenClaims {
    pub expires_at: Option<DateTime<Utc>>,
    pub subject: Option<String>,
}

impl TokenClaims {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }

    /// Expired, or expiring within `threshold`
    pub fn expires_within(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|exp| exp <= now + threshold)
            .unwrap_or(false)
    }
}

#[derive(Deserialize)]
struct RawClaims {
    exp: Option<i64>,
    sub: Option<Value>,
}

/// Decode the claims of a JWT; opaque tokens have none
pub fn claims(token: &str) -> Result<Option<TokenClaims>> {
    if classify(token)? == TokenFormat::Opaque {
        return Ok(None);
    }

    let payload = token.split('.').nth(1).unwrap_or_default();
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| SessionError::MalformedToken(format!("payload is not base64url: {}", e)))?;
    let raw: RawClaims = serde_json::from_slice(&bytes)
        .map_err(|e| SessionError::MalformedToken(format!("payload is not JSON claims: {}", e)))?;

    let expires_at = match raw.exp {
        Some(exp) => Some(DateTime::from_timestamp(exp, 0).ok_or_else(|| {
            SessionError::MalformedToken(format!("exp out of range: {}", exp))
        })?),
        None => None,
    };

    let subject = raw.sub.and_then(|sub| match sub {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    Ok(Some(TokenClaims {
        expires_at,
        subject,
    }))
}

/// Short prefix of a token, safe for logs
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}

#[cfg(test)]
pub(crate) fn make_jwt(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}
