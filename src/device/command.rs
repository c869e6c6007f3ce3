use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::CommandError;
use crate::forwarder::StreamKind;

/// Literal reply to a status check
pub const STATUS_OK: &str = "status_ok";

/// Status code reported for successful actions
pub const CODE_OK: u16 = 200;

/// Remote commands understood by the device, matched on the exact payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StatusCheck,
    EnableVio,
    DisableVio,
    StartTransfer(StreamKind),
    EndTransfer(StreamKind),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        match payload {
            "status_check" => Ok(Command::StatusCheck),
            "enable_vio_service" => Ok(Command::EnableVio),
            "disable_vio_service" => Ok(Command::DisableVio),
            "start_point_cloud_transfer" => Ok(Command::StartTransfer(StreamKind::PointCloud)),
            "end_point_cloud_transfer" => Ok(Command::EndTransfer(StreamKind::PointCloud)),
            "start_image_transfer" => Ok(Command::StartTransfer(StreamKind::Image)),
            "end_image_transfer" => Ok(Command::EndTransfer(StreamKind::Image)),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

impl Command {
    /// Value of the `type` field in the JSON response, `None` for commands
    /// answered outside the command response topic.
    pub fn response_type(&self) -> Option<&'static str> {
        match self {
            Command::StatusCheck => None,
            Command::EnableVio => Some("enable_vio"),
            Command::DisableVio => Some("disable_vio"),
            Command::StartTransfer(StreamKind::PointCloud) => Some("start_point_cloud_transfer"),
            Command::EndTransfer(StreamKind::PointCloud) => Some("end_point_cloud_transfer"),
            Command::StartTransfer(StreamKind::Image) => Some("start_image_transfer"),
            Command::EndTransfer(StreamKind::Image) => Some("end_image_transfer"),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::StatusCheck => write!(f, "status_check"),
            Command::EnableVio => write!(f, "enable_vio_service"),
            Command::DisableVio => write!(f, "disable_vio_service"),
            Command::StartTransfer(kind) => write!(f, "start_{}_transfer", kind),
            Command::EndTransfer(kind) => write!(f, "end_{}_transfer", kind),
        }
    }
}

/// Structured reply published on the command response topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: u16,
}

impl ResponseMessage {
    pub fn new(kind: impl Into<String>, code: u16) -> Self {
        Self {
            kind: kind.into(),
            code,
        }
    }

    pub fn to_json(&self) -> Result<String, CommandError> {
        Ok(serde_json::to_string(self)?)
    }
}
