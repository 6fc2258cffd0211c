//! Profile identification key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Why a tuner path is tuned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunePurpose {
    /// Primary view.
    Main,
    /// Picture-in-picture.
    Pip,
    /// Background capture (recording).
    Capture,
}

impl TunePurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            TunePurpose::Main => "main",
            TunePurpose::Pip => "pip",
            TunePurpose::Capture => "capture",
        }
    }
}

/// A tuning purpose bound to a screen.
///
/// Unique across the demux table, and the correlation key the tuning
/// subsystem passes back with every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileKey {
    pub purpose: TunePurpose,
    pub screen: u8,
}

impl ProfileKey {
    pub fn new(purpose: TunePurpose, screen: u8) -> Self {
        Self { purpose, screen }
    }

    pub fn main(screen: u8) -> Self {
        Self::new(TunePurpose::Main, screen)
    }

    pub fn pip(screen: u8) -> Self {
        Self::new(TunePurpose::Pip, screen)
    }

    pub fn capture(screen: u8) -> Self {
        Self::new(TunePurpose::Capture, screen)
    }
}

impl fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.purpose.as_str(), self.screen)
    }
}

impl FromStr for ProfileKey {
    type Err = String;

    /// Parses `purpose@screen`, e.g. `pip@0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (purpose, screen) = s
            .split_once('@')
            .ok_or_else(|| format!("expected purpose@screen, got '{}'", s))?;
        let purpose = match purpose {
            "main" => TunePurpose::Main,
            "pip" => TunePurpose::Pip,
            "capture" => TunePurpose::Capture,
            other => return Err(format!("unknown tuning purpose '{}'", other)),
        };
        let screen = screen
            .parse::<u8>()
            .map_err(|e| format!("invalid screen '{}': {}", screen, e))?;
        Ok(Self { purpose, screen })
    }
}
