//! Power-loss SMS alerts through an e-mail-to-SMS gateway, with a per-device
//! cooldown so a flapping relay cannot flood the recipient.
//!
//! ## Per-device state
//!
//! ```text
//! Quiet ──[notify]──▶ CoolingDown ──[cooldown elapsed]──▶ Quiet
//!                       │    ▲
//!                       └────┘ notify within window: suppressed
//!                              notify(force): sent, timer reset
//! ```

use anyhow::{anyhow, Context, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::SmtpSettings;

/// Upper bound on one SMTP exchange.
const SMTP_TIMEOUT_SEC: u64 = 15;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub device: String,
    pub subject: String,
    pub body: String,
}

impl Alert {
    pub fn power_loss(device: &str) -> Self {
        Self {
            device: device.to_string(),
            subject: format!("IPX Alarme {device}"),
            body: format!("Alerte : {device} hors tension !!!"),
        }
    }
}

// ---------------------------------------------------------------------------
// Injected collaborators
// ---------------------------------------------------------------------------

pub type DeliveryFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Something that can put an [`Alert`] on the wire.
pub trait AlertTransport: Send + Sync {
    fn deliver<'a>(&'a self, alert: &'a Alert) -> DeliveryFuture<'a>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ---------------------------------------------------------------------------
// SMTP transport
// ---------------------------------------------------------------------------

pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpTransport {
    /// STARTTLS relay with authenticated login.
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let from: Mailbox = settings
            .user
            .parse()
            .with_context(|| format!("invalid SMTP_USER address '{}'", settings.user))?;
        let to: Mailbox = settings
            .sms_to
            .parse()
            .with_context(|| format!("invalid SMS_TO address '{}'", settings.sms_to))?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.server)
            .with_context(|| format!("invalid SMTP relay '{}'", settings.server))?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.user.clone(),
                settings.password.clone(),
            ))
            .timeout(Some(Duration::from_secs(SMTP_TIMEOUT_SEC)))
            .build();

        Ok(Self { mailer, from, to })
    }
}

impl AlertTransport for SmtpTransport {
    fn deliver<'a>(&'a self, alert: &'a Alert) -> DeliveryFuture<'a> {
        Box::pin(async move {
            let message = Message::builder()
                .from(self.from.clone())
                .to(self.to.clone())
                .subject(alert.subject.as_str())
                .header(ContentType::TEXT_PLAIN)
                .body(alert.body.clone())
                .context("failed to build alert message")?;

            self.mailer
                .send(message)
                .await
                .context("smtp submission failed")?;
            Ok(())
        })
    }
}

/// Installed when SMTP settings are incomplete: every delivery fails loudly
/// so alerts still show up as failed in the logs.
#[derive(Debug, Default)]
pub struct UnconfiguredTransport;

impl AlertTransport for UnconfiguredTransport {
    fn deliver<'a>(&'a self, _alert: &'a Alert) -> DeliveryFuture<'a> {
        Box::pin(async { Err::<(), _>(anyhow!("smtp is not configured (SMTP_USER / SMS_TO)")) })
    }
}

// ---------------------------------------------------------------------------
// Cooldown table
// ---------------------------------------------------------------------------

/// Last alert instant per device key.
#[derive(Debug, Default)]
pub struct CooldownTable {
    last: Mutex<HashMap<String, Instant>>,
}

impl CooldownTable {
    /// Atomic check-then-set. Returns `true` when the caller should send, in
    /// which case `now` has already been recorded for `key`.
    fn try_claim(&self, key: &str, now: Instant, cooldown: Duration, force: bool) -> bool {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !force {
            if let Some(prev) = last.get(key) {
                if now.saturating_duration_since(*prev) <= cooldown {
                    return false;
                }
            }
        }
        last.insert(key.to_string(), now);
        true
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Suppressed,
    Failed,
}

pub struct AlertNotifier {
    transport: Arc<dyn AlertTransport>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    table: CooldownTable,
}

impl AlertNotifier {
    pub fn new(
        transport: Arc<dyn AlertTransport>,
        clock: Arc<dyn Clock>,
        cooldown: Duration,
    ) -> Self {
        Self {
            transport,
            clock,
            cooldown,
            table: CooldownTable::default(),
        }
    }

    /// Send a power-loss alert for `device` unless one went out within the
    /// cooldown window. `force` bypasses the window. Never fails: transport
    /// errors are logged and reported as [`NotifyOutcome::Failed`].
    pub async fn notify(&self, device: &str, force: bool) -> NotifyOutcome {
        let now = self.clock.now();
        if !self.table.try_claim(device, now, self.cooldown, force) {
            info!(device, "alert: recent alert already sent, sms skipped");
            return NotifyOutcome::Suppressed;
        }

        // The table lock is released before the network round-trip.
        let alert = Alert::power_loss(device);
        match self.transport.deliver(&alert).await {
            Ok(()) => {
                info!(device, forced = force, "alert: sms sent");
                NotifyOutcome::Sent
            }
            Err(e) => {
                error!(device, "alert: sms delivery failed: {e:#}");
                NotifyOutcome::Failed
            }
        }
    }
}

/// Pick the SMTP transport when configured, otherwise a failing placeholder.
pub fn transport_from_settings(settings: &SmtpSettings) -> Arc<dyn AlertTransport> {
    if !settings.is_configured() {
        warn!("alert: SMTP_USER or SMS_TO not set, alerts will not be delivered");
        return Arc::new(UnconfiguredTransport);
    }
    match SmtpTransport::new(settings) {
        Ok(t) => {
            info!(
                server = %settings.server,
                port = settings.port,
                "alert: smtp transport ready"
            );
            Arc::new(t)
        }
        Err(e) => {
            warn!("alert: {e:#}, alerts will not be delivered");
            Arc::new(UnconfiguredTransport)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
