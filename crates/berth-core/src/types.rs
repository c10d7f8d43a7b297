//! Value types shared across Berth crates.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a provisioned instance.
pub type InstanceId = String;

/// Unique identifier for a backend compute host.
pub type HostId = String;

/// Unique identifier for a blueprint.
pub type BlueprintId = String;

// ── Size classes ──────────────────────────────────────────────────

/// Workload size class. Hosts expose slots per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    pub const ALL: [SizeClass; 2] = [SizeClass::Small, SizeClass::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeClass::Small => "small",
            SizeClass::Large => "large",
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SizeClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(SizeClass::Small),
            "large" => Ok(SizeClass::Large),
            other => Err(format!("unknown size class: {other}")),
        }
    }
}

/// Slot counts split by size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SlotCounts {
    #[serde(default)]
    pub small: u32,
    #[serde(default)]
    pub large: u32,
}

impl SlotCounts {
    pub const ZERO: SlotCounts = SlotCounts { small: 0, large: 0 };

    pub fn new(small: u32, large: u32) -> Self {
        Self { small, large }
    }

    pub fn get(&self, class: SizeClass) -> u32 {
        match class {
            SizeClass::Small => self.small,
            SizeClass::Large => self.large,
        }
    }

    pub fn get_mut(&mut self, class: SizeClass) -> &mut u32 {
        match class {
            SizeClass::Small => &mut self.small,
            SizeClass::Large => &mut self.large,
        }
    }

    pub fn total(&self) -> u32 {
        self.small + self.large
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }

    /// Per-class `self - other`, floored at zero.
    pub fn saturating_sub(&self, other: &SlotCounts) -> SlotCounts {
        SlotCounts {
            small: self.small.saturating_sub(other.small),
            large: self.large.saturating_sub(other.large),
        }
    }

    pub fn add(&self, other: &SlotCounts) -> SlotCounts {
        SlotCounts {
            small: self.small + other.small,
            large: self.large + other.large,
        }
    }
}

// ── Host shutdown policy ──────────────────────────────────────────

/// What the pool does with a retired host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Destroy the backend resource immediately.
    #[default]
    Terminate,
    /// Keep the backend resource allocated but stopped for a faster restart.
    PowerOff,
}

// ── Time helpers ──────────────────────────────────────────────────

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Parse a duration string like "5s", "500ms", "2m", "1h".
///
/// A bare number is read as seconds. Values that overflow are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
