//! Relay event pipeline: validate, resolve the hub device, normalize the
//! state, send one command, and shape the reply.
//!
//! ```text
//! InboundEvent ──validate──▶ resolve id ──normalize──▶ send_action ──▶ Dispatched
//!      │                        │                          │
//!      └─ InvalidInput          └─ UnmappedDevice          └─ logged; acked OK
//!                                                             unless optimistic
//!                                                             ack is disabled
//! ```

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::alert::{AlertNotifier, NotifyOutcome};
use crate::hub::{Action, CommandResult, HubClient};
use crate::ingress::{ExtractionError, InboundEvent};
use crate::mapping::MappingStore;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("no mapping found for device '{0}'")]
    UnmappedDevice(String),
    #[error("upstream delivery failed: {0}")]
    UpstreamFailed(CommandResult),
    #[error("internal server error")]
    Internal,
}

impl From<ExtractionError> for DispatchError {
    fn from(e: ExtractionError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedCommand {
    pub upstream_id: u32,
    pub action: Action,
}

/// Successful dispatch. Serializes as
/// `{"status": "OK", "device": <id>, "<state_field>": "on"|"off"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub device: u32,
    pub action: Action,
    pub state_field: &'static str,
    pub delivery: CommandResult,
}

impl Serialize for Dispatched {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("status", "OK")?;
        map.serialize_entry("device", &self.device)?;
        map.serialize_entry(self.state_field, &self.action)?;
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerReport {
    pub device: String,
    pub powered: bool,
    pub hub_id: Option<u32>,
    pub alert: Option<NotifyOutcome>,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub optimistic_ack: bool,
    pub icon_on: Option<u32>,
    pub icon_off: Option<u32>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            optimistic_ack: true,
            icon_on: None,
            icon_off: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Tolerant state vocabulary, case-insensitive and trimmed.
pub fn normalize_state(token: &str) -> Option<Action> {
    match token.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "turnon" => Some(Action::On),
        "0" | "off" | "false" | "turnoff" => Some(Action::Off),
        _ => None,
    }
}

/// Plain decimal digits naming a positive hub id. Signs and `0` are refused,
/// matching what the mapping file accepts.
fn parse_hub_id(reference: &str) -> Option<u32> {
    if !reference.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    reference.parse::<u32>().ok().filter(|id| *id > 0)
}

/// Run `work` on its own task so a panic surfaces as
/// [`DispatchError::Internal`] rather than unwinding into the caller.
async fn contain<F>(device: &str, work: F) -> Result<Dispatched, DispatchError>
where
    F: Future<Output = Result<Dispatched, DispatchError>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(result) => result,
        Err(e) => {
            error!(device = %device, "dispatch: internal fault: {e}");
            Err(DispatchError::Internal)
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    mapping: Arc<MappingStore>,
    hub: HubClient,
    notifier: Arc<AlertNotifier>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        mapping: Arc<MappingStore>,
        hub: HubClient,
        notifier: Arc<AlertNotifier>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            mapping,
            hub,
            notifier,
            policy,
        }
    }

    pub fn mapping(&self) -> &MappingStore {
        &self.mapping
    }

    pub fn notifier(&self) -> &AlertNotifier {
        &self.notifier
    }

    /// Validation and identity resolution, in that order. No I/O. The mapping
    /// is consulted first; a bare positive number not in it is taken as the
    /// hub id itself.
    pub fn normalize(&self, event: &InboundEvent) -> Result<NormalizedCommand, DispatchError> {
        let device_ref = event.device_ref.trim();
        if device_ref.is_empty() {
            return Err(DispatchError::InvalidInput("missing device reference".into()));
        }

        let action = normalize_state(&event.state_token)
            .ok_or_else(|| DispatchError::InvalidInput("unrecognized state token".into()))?;

        let upstream_id = self
            .mapping
            .snapshot()
            .resolve(device_ref)
            .or_else(|| parse_hub_id(device_ref))
            .ok_or_else(|| DispatchError::UnmappedDevice(device_ref.to_string()))?;

        Ok(NormalizedCommand {
            upstream_id,
            action,
        })
    }

    /// Run one relay event through the pipeline.
    pub async fn dispatch(&self, event: InboundEvent) -> Result<Dispatched, DispatchError> {
        let cmd = match self.normalize(&event) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(device = %event.device_ref, state = %event.state_token, "dispatch: rejected: {e}");
                return Err(e);
            }
        };

        // Intent goes to the log before the hub is contacted.
        info!(
            device = cmd.upstream_id,
            action = %cmd.action,
            "dispatch: Device {} => {}",
            cmd.upstream_id,
            cmd.action.to_string().to_uppercase()
        );

        let delivery = self.hub.send_action(cmd.upstream_id, cmd.action).await;

        if delivery.is_success() {
            self.update_icon(cmd).await;
        } else {
            warn!(
                device = cmd.upstream_id,
                action = %cmd.action,
                "dispatch: hub did not accept the command: {delivery}"
            );
            if !self.policy.optimistic_ack {
                return Err(DispatchError::UpstreamFailed(delivery));
            }
        }

        Ok(Dispatched {
            device: cmd.upstream_id,
            action: cmd.action,
            state_field: event.state_field,
            delivery,
        })
    }

    /// [`Self::dispatch`] behind a fault boundary: a panic inside the
    /// pipeline becomes [`DispatchError::Internal`] instead of tearing down
    /// the request.
    pub async fn normalize_and_dispatch(
        self: &Arc<Self>,
        event: InboundEvent,
    ) -> Result<Dispatched, DispatchError> {
        let this = Arc::clone(self);
        let device = event.device_ref.clone();
        contain(&device, async move { this.dispatch(event).await }).await
    }

    /// Best-effort icon refresh after a successful command.
    async fn update_icon(&self, cmd: NormalizedCommand) {
        let icon = match cmd.action {
            Action::On => self.policy.icon_on,
            Action::Off => self.policy.icon_off,
        };
        let Some(icon_id) = icon else { return };

        let result = self.hub.set_icon(cmd.upstream_id, icon_id).await;
        if !result.is_success() {
            warn!(device = cmd.upstream_id, icon_id, "dispatch: icon update failed: {result}");
        }
    }

    /// Power telemetry for a monitored device. `OFF` raises a (cooldown
    /// limited) SMS alert; any other state is only logged.
    pub async fn power_event(
        &self,
        device: Option<&str>,
        state: Option<&str>,
    ) -> Result<PowerReport, DispatchError> {
        let device = device.map(str::trim).filter(|d| !d.is_empty());
        let state = state.map(str::trim).filter(|s| !s.is_empty());
        info!(device = ?device, state = ?state, "power: telemetry received");

        let (Some(device), Some(state)) = (device, state) else {
            warn!("power: invalid payload");
            return Err(DispatchError::InvalidInput("invalid payload".into()));
        };

        let hub_id = self.mapping.snapshot().resolve(device);
        if hub_id.is_none() {
            warn!(device, "power: no mapping found");
        }

        if state.eq_ignore_ascii_case("off") {
            warn!(device, "power: device lost power, sending sms");
            let outcome = self.notifier.notify(device, false).await;
            Ok(PowerReport {
                device: device.to_string(),
                powered: false,
                hub_id,
                alert: Some(outcome),
            })
        } else {
            info!(device, state, "power: device in normal state");
            Ok(PowerReport {
                device: device.to_string(),
                powered: true,
                hub_id,
                alert: None,
            })
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
