use std::str::FromStr;

use chrono::Utc;
use thiserror::Error;

use crate::{
    mode::{ParseModeError, SimulationMode},
    reading::{GripReading, ReadingError},
};

/// Commands accepted on the control characteristic.
///
/// Text form, keyword case-insensitive: `start`, `stop`, `mode:<mode>`, `data:<reading>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Resume reading generation.
    Start,
    /// Pause reading generation; the last reading stays readable.
    Stop,
    Mode(SimulationMode),
    Data(GripReading),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("control command is not valid UTF-8")]
    NotUtf8,
    #[error("unknown control command '{0}'")]
    Unknown(String),
    #[error(transparent)]
    Mode(#[from] ParseModeError),
    #[error(transparent)]
    Reading(#[from] ReadingError),
}

impl ControlCommand {
    pub fn from_payload(payload: &[u8]) -> Result<ControlCommand, CommandError> {
        std::str::from_utf8(payload)
            .map_err(|_| CommandError::NotUtf8)?
            .parse()
    }
}

impl FromStr for ControlCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = s.trim();
        match command.split_once(':') {
            Some((keyword, argument)) if keyword.eq_ignore_ascii_case("mode") => {
                Ok(ControlCommand::Mode(argument.parse()?))
            }
            Some((keyword, argument)) if keyword.eq_ignore_ascii_case("data") => Ok(
                ControlCommand::Data(GripReading::parse_at(argument, Utc::now())?),
            ),
            None if command.eq_ignore_ascii_case("start") => Ok(ControlCommand::Start),
            None if command.eq_ignore_ascii_case("stop") => Ok(ControlCommand::Stop),
            _ => Err(CommandError::Unknown(command.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{mode::SimulationMode, reading::ReadingError};

    use super::{CommandError, ControlCommand};

    #[test]
    fn keywords() {
        assert_eq!("start".parse::<ControlCommand>(), Ok(ControlCommand::Start));
        assert_eq!("STOP\n".parse::<ControlCommand>(), Ok(ControlCommand::Stop));
        assert_eq!(
            "Mode:exercise".parse::<ControlCommand>(),
            Ok(ControlCommand::Mode(SimulationMode::Exercise))
        );
    }

    #[test]
    fn data_command_carries_reading() {
        let command =
            ControlCommand::from_payload(b"data: L1:1 L2:2 L3:3 R1:4 R2:5 R3:6 Score:7").unwrap();
        match command {
            ControlCommand::Data(reading) => {
                assert_eq!(reading.to_string(), "L1:1 L2:2 L3:3 R1:4 R2:5 R3:6 Score:7")
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn invalid_commands() {
        assert_eq!(
            "jump".parse::<ControlCommand>(),
            Err(CommandError::Unknown("jump".to_string()))
        );
        assert!(matches!(
            "mode:sprint".parse::<ControlCommand>(),
            Err(CommandError::Mode(_))
        ));
        assert_eq!(
            "data:L1:1".parse::<ControlCommand>(),
            Err(CommandError::Reading(ReadingError::MissingField("L2")))
        );
        assert_eq!(
            ControlCommand::from_payload(&[0xc3, 0x28]),
            Err(CommandError::NotUtf8)
        );
    }
}
