//! Table protocol vocabulary
//!
//! Outgoing commands are single text lines. Incoming lines are tokens that
//! either acknowledge a command or report on a running rotation:
//!
//! ```text
//! host -> table     STATUS | SET ACC <n> | GET ACC | FM <n> | STOP | SOFTSTOP
//! table -> host     <n> | OK | ERR | READY | BUSY | UNKNOWN     (acknowledgements)
//!                   POS <n> | END | MOVERR                      (rotation events)
//! ```

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

/// Prefix of positional progress updates sent during rotation
pub const PROGRESS_PREFIX: &str = "POS ";

/// Sent once when a rotation finishes
pub const COMPLETION_MARKER: &str = "END";

/// Sent when the table fails to move
pub const MOVE_ERROR_MARKER: &str = "MOVERR";

/// One decoded line from the transport
///
/// Cloning is cheap: every subscriber receives the same shared string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(Arc<str>);

impl Token {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for Token {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Token {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl PartialEq<&str> for Token {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Commands understood by the table controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Query controller state
    Status,
    /// Set the acceleration parameter
    SetAcc(i32),
    /// Read the acceleration parameter back as an integer
    GetAcc,
    /// Start a rotation with the given motion parameter
    Fm(i32),
    /// Stop immediately
    Stop,
    /// Decelerate to a stop
    SoftStop,
}

impl Command {
    /// Usage lines shown to the operator
    pub const USAGE: [&'static str; 6] = ["STATUS", "SET ACC X", "GET ACC", "FM X", "STOP", "SOFTSTOP"];

    /// Whether an `OK` reply to this command starts an asynchronous rotation
    pub fn starts_rotation(&self) -> bool {
        matches!(self, Command::Fm(_))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Status => f.write_str("STATUS"),
            Command::SetAcc(value) => write!(f, "SET ACC {value}"),
            Command::GetAcc => f.write_str("GET ACC"),
            Command::Fm(motion) => write!(f, "FM {motion}"),
            Command::Stop => f.write_str("STOP"),
            Command::SoftStop => f.write_str("SOFTSTOP"),
        }
    }
}

/// Error returned when operator text is not a known command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unrecognized command: {0}")]
pub struct ParseCommandError(pub String);

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let parse_int = |text: &str| text.parse::<i32>().map_err(|_| ParseCommandError(s.to_string()));

        match parts.as_slice() {
            ["STATUS"] => Ok(Command::Status),
            ["SET", "ACC", value] => Ok(Command::SetAcc(parse_int(*value)?)),
            ["GET", "ACC"] => Ok(Command::GetAcc),
            ["FM", motion] => Ok(Command::Fm(parse_int(*motion)?)),
            ["STOP"] => Ok(Command::Stop),
            ["SOFTSTOP"] => Ok(Command::SoftStop),
            _ => Err(ParseCommandError(s.to_string())),
        }
    }
}

/// An accepted reply to a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Integer telemetry, e.g. the reply to `GET ACC`
    Value(i32),
    Ok,
    Err,
    Ready,
    Busy,
    Unknown,
}

impl Response {
    /// Classify a token as a command reply
    ///
    /// Integers are accepted first, then the status vocabulary by exact
    /// match. Anything else is not a reply.
    pub fn classify(token: &str) -> Option<Self> {
        if let Ok(value) = token.trim().parse::<i32>() {
            return Some(Response::Value(value));
        }

        match token {
            "OK" => Some(Response::Ok),
            "ERR" => Some(Response::Err),
            "READY" => Some(Response::Ready),
            "BUSY" => Some(Response::Busy),
            "UNKNOWN" => Some(Response::Unknown),
            _ => None,
        }
    }

    /// The controller rejected the command
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Err)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Value(value) => write!(f, "{value}"),
            Response::Ok => f.write_str("OK"),
            Response::Err => f.write_str("ERR"),
            Response::Ready => f.write_str("READY"),
            Response::Busy => f.write_str("BUSY"),
            Response::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// The token that answered a command, with its classification
///
/// Displays the token exactly as the table sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub token: Token,
    pub response: Response,
}

impl Reply {
    /// Accept `token` as a reply if it classifies as one
    pub fn classify(token: Token) -> Option<Self> {
        let response = Response::classify(&token)?;
        Some(Self { token, response })
    }

    pub fn is_error(&self) -> bool {
        self.response.is_error()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// What a token means to an in-progress rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationEvent {
    /// Positional update; `position` is set when the payload is an integer
    Progress { position: Option<i32> },
    Completed,
    MoveError,
    Other,
}

impl RotationEvent {
    pub fn classify(token: &str) -> Self {
        if let Some(rest) = token.strip_prefix(PROGRESS_PREFIX) {
            return RotationEvent::Progress {
                position: rest.trim().parse().ok(),
            };
        }

        match token {
            COMPLETION_MARKER => RotationEvent::Completed,
            MOVE_ERROR_MARKER => RotationEvent::MoveError,
            _ => RotationEvent::Other,
        }
    }
}
