//! Pulls a device reference and a state token out of whatever encoding the
//! IPX800 used for its push: query string, form body, JSON body or a raw
//! `key=value&key=value` body.

use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Alias table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Query,
    Form,
    Json,
    Raw,
}

/// Lookup order for the device reference. First non-empty value wins.
const DEVICE_LOOKUP: &[(Source, &str)] = &[
    (Source::Query, "device_id"),
    (Source::Query, "relais"),
    (Source::Form, "device_id"),
    (Source::Form, "relais"),
    (Source::Json, "device_id"),
    (Source::Json, "relais"),
    (Source::Raw, "device_id"),
    (Source::Raw, "relais"),
];

/// Lookup order for the state token, independent of where the device was found.
const STATE_LOOKUP: &[(Source, &str)] = &[
    (Source::Query, "etat"),
    (Source::Query, "action"),
    (Source::Query, "state"),
    (Source::Form, "etat"),
    (Source::Form, "action"),
    (Source::Form, "state"),
    (Source::Json, "etat"),
    (Source::Json, "action"),
    (Source::Json, "state"),
    (Source::Raw, "etat"),
    (Source::Raw, "action"),
    (Source::Raw, "state"),
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One relay event as received, before any validation of its values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub device_ref: String,
    pub state_token: String,
    /// Field name the state arrived under, echoed back in the reply.
    pub state_field: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("missing device reference (device_id or relais)")]
    MissingDevice,
    #[error("missing state token (etat, action or state)")]
    MissingState,
    #[error("invalid JSON body")]
    InvalidJson,
}

/// Everything the transport delivered, decoded per source.
#[derive(Debug, Default)]
pub struct Payload {
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub json: Option<serde_json::Map<String, Value>>,
    /// Body was declared or looked like JSON but did not parse.
    pub json_malformed: bool,
    pub raw: Vec<(String, String)>,
}

impl Payload {
    /// Decode a request. `content_type` is the raw header value, if any.
    pub fn from_parts(query: Option<&str>, content_type: Option<&str>, body: &[u8]) -> Self {
        let mut payload = Self {
            query: query.map(decode_urlencoded).unwrap_or_default(),
            ..Self::default()
        };

        let content_type = content_type.unwrap_or("").to_ascii_lowercase();
        let text = String::from_utf8_lossy(body);
        let text = text.trim();

        if content_type.starts_with("application/x-www-form-urlencoded") {
            payload.form = decode_urlencoded(text);
        }

        let looks_json = content_type.contains("json") || text.starts_with('{');
        if looks_json && !text.is_empty() {
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => payload.json = Some(map),
                _ => payload.json_malformed = true,
            }
        }

        if text.contains('=') {
            payload.raw = split_raw(text);
        }

        payload
    }

    fn get(&self, source: Source, field: &str) -> Option<String> {
        let value = match source {
            Source::Query => lookup_pairs(&self.query, field),
            Source::Form => lookup_pairs(&self.form, field),
            Source::Raw => lookup_pairs(&self.raw, field),
            Source::Json => self.json.as_ref().and_then(|m| m.get(field)).and_then(json_text),
        }?;
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    fn first(&self, table: &[(Source, &'static str)]) -> Option<(String, &'static str)> {
        table
            .iter()
            .find_map(|&(source, field)| self.get(source, field).map(|v| (v, field)))
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Resolve the device and state fields, each independently, in table order.
pub fn extract(payload: &Payload) -> Result<InboundEvent, ExtractionError> {
    let device = payload.first(DEVICE_LOOKUP);
    let state = payload.first(STATE_LOOKUP);

    match (device, state) {
        (Some((device_ref, _)), Some((state_token, state_field))) => Ok(InboundEvent {
            device_ref,
            state_token,
            state_field,
        }),
        _ if payload.json_malformed => Err(ExtractionError::InvalidJson),
        (None, _) => Err(ExtractionError::MissingDevice),
        (Some(_), None) => Err(ExtractionError::MissingState),
    }
}

fn lookup_pairs(pairs: &[(String, String)], field: &str) -> Option<String> {
    pairs
        .iter()
        .filter(|(k, _)| k == field)
        .map(|(_, v)| v.as_str())
        .find(|v| !v.trim().is_empty())
        .map(str::to_string)
}

fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn decode_urlencoded(s: &str) -> Vec<(String, String)> {
    serde_urlencoded::from_str(s).unwrap_or_default()
}

/// Literal `k=v&k=v` split, no percent-decoding.
fn split_raw(s: &str) -> Vec<(String, String)> {
    s.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
