//! Fibaro HC3 REST client: device actions and icon updates.
//!
//! Every call sends exactly one request and never retries. The HTTP result is
//! folded into a [`CommandResult`] instead of an error so callers can decide
//! how much of a failed delivery to surface.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::HubSettings;

// ---------------------------------------------------------------------------
// Command vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    On,
    Off,
}

impl Action {
    /// Name of the device action on the hub side.
    pub fn hub_command(self) -> &'static str {
        match self {
            Self::On => "turnOn",
            Self::Off => "turnOff",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

// ---------------------------------------------------------------------------
// Result classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Unauthorized,
    NotFound,
    Rejected,
    TransportError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub outcome: Outcome,
    pub http_code: Option<u16>,
    pub detail: Option<String>,
}

impl CommandResult {
    /// Fixed mapping from an HTTP status (and body) to an outcome.
    pub fn from_status(code: u16, body: String) -> Self {
        let outcome = match code {
            200 => Outcome::Success,
            401 => Outcome::Unauthorized,
            404 => Outcome::NotFound,
            _ => Outcome::Rejected,
        };
        let detail = (outcome == Outcome::Rejected).then_some(body);
        Self {
            outcome,
            http_code: Some(code),
            detail,
        }
    }

    pub fn transport_error(err: impl fmt::Display) -> Self {
        Self {
            outcome: Outcome::TransportError,
            http_code: None,
            detail: Some(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.outcome)?;
        if let Some(code) = self.http_code {
            write!(f, " (HTTP {code})")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HubClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl HubClient {
    pub fn new(settings: &HubSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("failed to build hub http client")?;

        Ok(Self {
            http,
            base_url: settings.base_url(),
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST {base}/api/devices/{id}/action/{turnOn|turnOff}`.
    pub async fn send_action(&self, device_id: u32, action: Action) -> CommandResult {
        let command = action.hub_command();
        let result = self
            .post_action(device_id, command, json!({ "args": "" }))
            .await;

        match result.outcome {
            Outcome::Success => {
                info!(device = device_id, command, "hub: command accepted")
            }
            Outcome::Unauthorized => error!("hub: authentication rejected by Fibaro HC3"),
            Outcome::NotFound => error!(device = device_id, "hub: device not found"),
            Outcome::Rejected | Outcome::TransportError => {
                warn!(device = device_id, command, "hub: command failed: {result}")
            }
        }
        result
    }

    /// `POST {base}/api/devices/{id}/action/setIcon` with `{"iconId": n}`.
    pub async fn set_icon(&self, device_id: u32, icon_id: u32) -> CommandResult {
        self.post_action(device_id, "setIcon", json!({ "iconId": icon_id }))
            .await
    }

    async fn post_action(
        &self,
        device_id: u32,
        action: &str,
        body: serde_json::Value,
    ) -> CommandResult {
        let url = format!(
            "{}/api/devices/{device_id}/action/{action}",
            self.base_url
        );

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let code = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                CommandResult::from_status(code, text)
            }
            Err(e) => CommandResult::transport_error(e),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn settings_for(url: &str) -> HubSettings {
        HubSettings {
            simulator: true,
            simulator_url: url.to_string(),
            user: "admin".into(),
            password: "secret".into(),
            timeout_secs: 5,
            ..HubSettings::default()
        }
    }

    // -- Classification ---------------------------------------------------

    #[test]
    fn classify_200_success() {
        let r = CommandResult::from_status(200, String::new());
        assert_eq!(r.outcome, Outcome::Success);
        assert_eq!(r.http_code, Some(200));
        assert_eq!(r.detail, None);
    }

    #[test]
    fn classify_401_unauthorized() {
        assert_eq!(
            CommandResult::from_status(401, String::new()).outcome,
            Outcome::Unauthorized
        );
    }

    #[test]
    fn classify_404_not_found() {
        assert_eq!(
            CommandResult::from_status(404, String::new()).outcome,
            Outcome::NotFound
        );
    }

    #[test]
    fn classify_other_status_rejected_with_body() {
        let r = CommandResult::from_status(500, "Erreur interne".into());
        assert_eq!(r.outcome, Outcome::Rejected);
        assert_eq!(r.http_code, Some(500));
        assert_eq!(r.detail.as_deref(), Some("Erreur interne"));
    }

    #[test]
    fn classify_202_is_still_rejected() {
        // Only a plain 200 counts as success.
        assert_eq!(
            CommandResult::from_status(202, String::new()).outcome,
            Outcome::Rejected
        );
    }

    #[test]
    fn action_hub_commands() {
        assert_eq!(Action::On.hub_command(), "turnOn");
        assert_eq!(Action::Off.hub_command(), "turnOff");
        assert_eq!(Action::Off.to_string(), "off");
    }

    // -- HTTP -------------------------------------------------------------

    #[tokio::test]
    async fn send_action_posts_turn_on_with_basic_auth() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/devices/12/action/turnOn")
            // admin:secret
            .match_header("authorization", "Basic YWRtaW46c2VjcmV0")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({ "args": "" })))
            .with_status(200)
            .create_async()
            .await;

        let client = HubClient::new(&settings_for(&server.url())).unwrap();
        let result = client.send_action(12, Action::On).await;

        assert!(result.is_success());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn send_action_turn_off_rejected() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/devices/27/action/turnOff")
            .with_status(500)
            .with_body("boom")
            .expect(1)
            .create_async()
            .await;

        let client = HubClient::new(&settings_for(&server.url())).unwrap();
        let result = client.send_action(27, Action::Off).await;

        assert_eq!(result.outcome, Outcome::Rejected);
        assert_eq!(result.http_code, Some(500));
        assert_eq!(result.detail.as_deref(), Some("boom"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn send_action_unauthorized() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/devices/3/action/turnOn")
            .with_status(401)
            .create_async()
            .await;

        let client = HubClient::new(&settings_for(&server.url())).unwrap();
        let result = client.send_action(3, Action::On).await;
        assert_eq!(result.outcome, Outcome::Unauthorized);
    }

    #[tokio::test]
    async fn send_action_connection_refused_is_transport_error() {
        // Port 9 (discard) on loopback is not expected to be listening.
        let client = HubClient::new(&settings_for("http://127.0.0.1:9")).unwrap();
        let result = client.send_action(1, Action::On).await;

        assert_eq!(result.outcome, Outcome::TransportError);
        assert_eq!(result.http_code, None);
        assert!(result.detail.is_some());
    }

    #[tokio::test]
    async fn set_icon_posts_icon_id() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/devices/27/action/setIcon")
            .match_body(Matcher::Json(json!({ "iconId": 1042 })))
            .with_status(200)
            .create_async()
            .await;

        let client = HubClient::new(&settings_for(&server.url())).unwrap();
        assert!(client.set_icon(27, 1042).await.is_success());
        mock.assert_async().await;
    }
}
