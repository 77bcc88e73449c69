//! IPX800 relay list (`/api/xdevices.json`) and the event each relay turns
//! into on the bridge side.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One entry of the IPX800 relay list. Fields are loosely typed on the
/// controller side, so everything is optional here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayEntry {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

/// Body posted to the bridge's `/ipx-event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayEvent {
    pub device_id: String,
    pub etat: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    MissingId,
    UnknownValue(String),
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

impl RelayEntry {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unknown")
    }

    /// `value` "1" -> on, "0" -> off; anything else is skipped.
    pub fn to_event(&self) -> Result<RelayEvent, Skip> {
        let device_id = self
            .id
            .as_ref()
            .and_then(scalar_text)
            .filter(|s| !s.is_empty() && s != "0")
            .ok_or(Skip::MissingId)?;

        let value = self.value.as_ref().and_then(scalar_text).unwrap_or_default();
        let etat = match value.as_str() {
            "1" => "on",
            "0" => "off",
            _ => return Err(Skip::UnknownValue(value)),
        };

        Ok(RelayEvent { device_id, etat })
    }
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
