//! Key and channel naming.
//!
//! Every responsibility of the coordination layer owns one prefix in the
//! shared key space.  Keys are `prefix:` followed by colon-joined identifier
//! segments, e.g. `rate_limit:user-7:qr_scan`.

use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Session,
    Cache,
    Qr,
    Notification,
    RateLimit,
    LockStatus,
    HardwareStatus,
    Metrics,
}

impl Namespace {
    /// The key prefix, including the trailing colon.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Session => "session:",
            Self::Cache => "cache:",
            Self::Qr => "qr:",
            Self::Notification => "notification:",
            Self::RateLimit => "rate_limit:",
            Self::LockStatus => "lock_status:",
            Self::HardwareStatus => "hardware_status:",
            Self::Metrics => "metrics:",
        }
    }

    /// Build a full storage key from identifier segments.
    pub fn key(self, segments: &[&str]) -> String {
        let mut key = String::from(self.prefix());
        key.push_str(&segments.join(":"));
        key
    }

    /// Glob pattern matching `pattern` inside this namespace.
    pub fn pattern(self, pattern: &str) -> String {
        format!("{}{pattern}", self.prefix())
    }

    /// Inverse of [`Namespace::key`]: the identifier part of a full key, or
    /// `None` when the key belongs to another namespace.
    pub fn strip(self, key: &str) -> Option<&str> {
        key.strip_prefix(self.prefix())
    }
}

// ---------------------------------------------------------------------------
// Pub/sub channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    LockerStatus,
    HardwareAlerts,
    UserNotifications,
    SystemEvents,
    MaintenanceAlerts,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::LockerStatus,
        Channel::HardwareAlerts,
        Channel::UserNotifications,
        Channel::SystemEvents,
        Channel::MaintenanceAlerts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LockerStatus => "locker-status",
            Self::HardwareAlerts => "hardware-alerts",
            Self::UserNotifications => "user-notifications",
            Self::SystemEvents => "system-events",
            Self::MaintenanceAlerts => "maintenance-alerts",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownChannel(pub String);

impl fmt::Display for UnknownChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown pub/sub channel: {}", self.0)
    }
}

impl std::error::Error for UnknownChannel {}

impl FromStr for Channel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownChannel(s.to_string()))
    }
}
