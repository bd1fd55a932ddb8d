//! SRPC handshake authentication: the signed query string a client dials
//! with, and the server-side HMAC + clock-drift verification of it.
//!
//! Wire format (distilled spec section 6):
//! `ws(s)://host[:port]/{wsPath}?authv=1&appv={ver}&ts={unixMs}&id={streamId}
//! &cid={clientId}&signature={hex}&m--{k}={v}...`

use std::collections::BTreeMap;

use basalt_crypto::{sign, verify, HmacError};

/// The fields signed by the client and re-verified by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFields {
    pub authv: u32,
    pub appv: String,
    pub ts_ms: i64,
    pub stream_id: String,
    pub client_id: String,
}

/// `"${authv}\n${appv}\n${ts}\n${id}\n${cid}\n"` — the exact message the
/// distilled spec's server recomputes the HMAC over.
pub fn signing_message(fields: &AuthFields) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n",
        fields.authv, fields.appv, fields.ts_ms, fields.stream_id, fields.client_id
    )
}

pub fn sign_fields(secret: &str, fields: &AuthFields) -> Result<String, HmacError> {
    sign(secret, &signing_message(fields))
}

/// Constant-time HMAC verification of `signature` over `fields`.
#[must_use]
pub fn verify_fields(secret: &str, fields: &AuthFields, signature: &str) -> bool {
    verify(secret, &signing_message(fields), signature)
}

/// `|now - ts| <= max_drift_ms`, accepting exactly `max_drift_ms` (boundary
/// behavior from the distilled spec's testable properties).
#[must_use]
pub fn clock_drift_ok(ts_ms: i64, now_ms: i64, max_drift_ms: i64) -> bool {
    (now_ms - ts_ms).abs() <= max_drift_ms
}

/// A fully parsed SRPC connect query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAuth {
    pub fields: AuthFields,
    pub signature: String,
    /// `m--*` query parameters, with the `m--` prefix stripped.
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthParseError {
    #[error("missing required query parameter {0}")]
    MissingField(&'static str),
    #[error("query parameter {0} is not a valid integer")]
    InvalidInteger(&'static str),
}

/// Builds the client connect URL's query string (everything after `?`).
pub fn build_query(fields: &AuthFields, signature: &str, meta: &BTreeMap<String, String>) -> String {
    let mut pairs = vec![
        format!("authv={}", fields.authv),
        format!("appv={}", url_encode(&fields.appv)),
        format!("ts={}", fields.ts_ms),
        format!("id={}", url_encode(&fields.stream_id)),
        format!("cid={}", url_encode(&fields.client_id)),
        format!("signature={}", url_encode(signature)),
    ];
    for (k, v) in meta {
        pairs.push(format!("m--{}={}", url_encode(k), url_encode(v)));
    }
    pairs.join("&")
}

/// Parses a connect query string (without the leading `?`) into
/// [`ParsedAuth`].
pub fn parse_query(query: &str) -> Result<ParsedAuth, AuthParseError> {
    let mut authv = None;
    let mut appv = None;
    let mut ts_ms = None;
    let mut stream_id = None;
    let mut client_id = None;
    let mut signature = None;
    let mut meta = BTreeMap::new();

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = url_decode(value);
        match key {
            "authv" => {
                authv = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| AuthParseError::InvalidInteger("authv"))?,
                )
            }
            "appv" => appv = Some(value),
            "ts" => {
                ts_ms = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| AuthParseError::InvalidInteger("ts"))?,
                )
            }
            "id" => stream_id = Some(value),
            "cid" => client_id = Some(value),
            "signature" => signature = Some(value),
            other => {
                if let Some(meta_key) = other.strip_prefix("m--") {
                    meta.insert(meta_key.to_string(), value);
                }
            }
        }
    }

    Ok(ParsedAuth {
        fields: AuthFields {
            authv: authv.ok_or(AuthParseError::MissingField("authv"))?,
            appv: appv.ok_or(AuthParseError::MissingField("appv"))?,
            ts_ms: ts_ms.ok_or(AuthParseError::MissingField("ts"))?,
            stream_id: stream_id.ok_or(AuthParseError::MissingField("id"))?,
            client_id: client_id.ok_or(AuthParseError::MissingField("cid"))?,
        },
        signature: signature.ok_or(AuthParseError::MissingField("signature"))?,
        meta,
    })
}

fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&value[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> AuthFields {
        AuthFields {
            authv: 1,
            appv: "2.3.0".to_string(),
            ts_ms: 1_700_000_000_000,
            stream_id: "stream-1".to_string(),
            client_id: "client-1".to_string(),
        }
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let signature = sign_fields("secret", &fields()).unwrap();
        assert!(verify_fields("secret", &fields(), &signature));
    }

    #[test]
    fn verify_rejects_tampered_field() {
        let signature = sign_fields("secret", &fields()).unwrap();
        let mut tampered = fields();
        tampered.client_id = "someone-else".to_string();
        assert!(!verify_fields("secret", &tampered, &signature));
    }

    #[test]
    fn clock_drift_accepts_exact_boundary() {
        assert!(clock_drift_ok(1_000, 31_000, 30_000));
        assert!(!clock_drift_ok(1_000, 31_001, 30_000));
    }

    #[test]
    fn build_then_parse_query_round_trips() {
        let signature = sign_fields("secret", &fields()).unwrap();
        let mut meta = BTreeMap::new();
        meta.insert("region".to_string(), "us-east 1".to_string());

        let query = build_query(&fields(), &signature, &meta);
        let parsed = parse_query(&query).unwrap();

        assert_eq!(parsed.fields, fields());
        assert_eq!(parsed.signature, signature);
        assert_eq!(parsed.meta.get("region"), Some(&"us-east 1".to_string()));
    }

    #[test]
    fn parse_query_reports_missing_field() {
        let err = parse_query("authv=1&appv=1.0").unwrap_err();
        assert_eq!(err, AuthParseError::MissingField("ts"));
    }
}
