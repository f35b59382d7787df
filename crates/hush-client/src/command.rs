//! Parsing of interactive input lines.

use hush_common::CallType;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Chat(String),
    Create,
    Join(String),
    Leave,
    Call(CallType),
    Hangup,
    ToggleScreen,
    ToggleMute,
    ToggleCamera,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("nothing to send")]
    Empty,

    #[error("unknown command /{0}, try /help")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

pub const HELP: &str = "\
/create            create a new room
/join <id>         join a room
/leave             leave the current room
/call voice|video  start a call
/hangup            end the call
/screen            toggle screen share
/mute              toggle microphone
/camera            toggle camera
/quit              exit
anything else is sent as chat";

pub fn parse(line: &str) -> Result<InputCommand, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(InputError::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(InputCommand::Chat(line.to_string()));
    };

    let mut parts = rest.split_whitespace();
    let cmd = parts.next().unwrap_or_default().to_ascii_lowercase();
    let arg = parts.next();

    match cmd.as_str() {
        "create" => Ok(InputCommand::Create),
        "join" => arg
            .map(|id| InputCommand::Join(id.to_string()))
            .ok_or(InputError::Usage("/join <id>")),
        "leave" => Ok(InputCommand::Leave),
        "call" => arg
            .unwrap_or("voice")
            .parse()
            .map(InputCommand::Call)
            .map_err(|_| InputError::Usage("/call voice|video")),
        "hangup" | "end" => Ok(InputCommand::Hangup),
        "screen" => Ok(InputCommand::ToggleScreen),
        "mute" => Ok(InputCommand::ToggleMute),
        "camera" => Ok(InputCommand::ToggleCamera),
        "help" => Ok(InputCommand::Help),
        "quit" | "exit" => Ok(InputCommand::Quit),
        other => Err(InputError::Unknown(other.to_string())),
    }
}
