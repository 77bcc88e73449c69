//! Simulated IPX800 relay board for local development.
//!
//! Produces the same `xdevices.json` entries as the real controller. Each
//! poll, every relay flips with a scenario-dependent probability.

use serde_json::Value;
use std::fmt;

use crate::relays::RelayEntry;

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Relays change state now and then. Good default for watching the
    /// bridge forward events.
    Steady,
    /// Relays flip on most polls. Exercises the hub client under churn.
    Chatty,
    /// Nothing ever changes.
    Frozen,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "chatty" => Self::Chatty,
            "frozen" => Self::Frozen,
            _ => Self::Steady, // default
        }
    }

    fn flip_prob(self) -> f32 {
        match self {
            Self::Steady => 0.1,
            Self::Chatty => 0.6,
            Self::Frozen => 0.0,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steady => write!(f, "steady"),
            Self::Chatty => write!(f, "chatty"),
            Self::Frozen => write!(f, "frozen"),
        }
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

pub struct RelayBoard {
    relays: Vec<bool>,
    flip_prob: f32,
}

impl RelayBoard {
    /// `count` relays, all starting ON.
    pub fn new(scenario: Scenario, count: usize) -> Self {
        Self {
            relays: vec![true; count],
            flip_prob: scenario.flip_prob(),
        }
    }

    /// Advance one poll and return the relay list as the controller would.
    pub fn poll(&mut self) -> Vec<RelayEntry> {
        for on in &mut self.relays {
            if fastrand::f32() < self.flip_prob {
                *on = !*on;
            }
        }
        self.snapshot()
    }

    pub fn snapshot(&self) -> Vec<RelayEntry> {
        self.relays
            .iter()
            .enumerate()
            .map(|(i, on)| RelayEntry {
                id: Some(Value::from(i + 1)),
                name: Some(format!("relais{}", i + 1)),
                value: Some(Value::from(if *on { "1" } else { "0" })),
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
