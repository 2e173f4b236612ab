use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationMode {
    #[default]
    Normal,
    Exercise,
    Rest,
}

/// Value-range policy for one simulation mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ModeProfile {
    pub left_base: [u16; 3],
    pub right_base: [u16; 3],
    /// Symmetric random variation applied around each base value.
    pub variation: u16,
    /// Upper bound of the per-sensor trend offset.
    pub trend: u16,
}

impl SimulationMode {
    pub const ALL: [SimulationMode; 3] = [
        SimulationMode::Normal,
        SimulationMode::Exercise,
        SimulationMode::Rest,
    ];

    #[must_use]
    pub fn profile(&self) -> ModeProfile {
        use SimulationMode::{Exercise, Normal, Rest};
        match self {
            Normal => ModeProfile {
                left_base: [120, 115, 110],
                right_base: [125, 120, 115],
                variation: 30,
                trend: 10,
            },
            Exercise => ModeProfile {
                left_base: [200, 190, 180],
                right_base: [210, 200, 190],
                variation: 50,
                trend: 10,
            },
            Rest => ModeProfile {
                left_base: [80, 75, 70],
                right_base: [85, 80, 75],
                variation: 20,
                trend: 10,
            },
        }
    }
}

impl fmt::Display for SimulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SimulationMode::{Exercise, Normal, Rest};
        match self {
            Normal => write!(f, "normal"),
            Exercise => write!(f, "exercise"),
            Rest => write!(f, "rest"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown simulation mode '{0}', expected one of: normal, exercise, rest")]
pub struct ParseModeError(pub String);

impl FromStr for SimulationMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(SimulationMode::Normal),
            "exercise" => Ok(SimulationMode::Exercise),
            "rest" => Ok(SimulationMode::Rest),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}
