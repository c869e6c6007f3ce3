//! Device command side
//!
//! Everything the device does in response to the remote host:
//!
//! 1. [`command`] - Command payloads and JSON responses
//! 2. [`router`] - Dispatch of commands to forwarders and the vio service
//! 3. [`vio`] - HTTP client for the local vio algorithm
//! 4. [`heartbeat`] - Periodic liveness publish
//! 5. [`device`] - Connection handler and full device assembly
//!
//! # Message flow
//!
//! ```text
//! broker ──► ConnectionDriver ──► DeviceHandler ──[inbox]──► CommandRouter
//!                                      │                      │      │
//!                              subscribe + heartbeat    forwarders  vio
//! ```

pub mod command;
#[allow(clippy::module_inception)]
pub mod device;
pub mod error;
pub mod heartbeat;
pub mod router;
pub mod vio;

pub use command::{Command, ResponseMessage};
pub use device::{Device, DeviceHandler};
pub use error::CommandError;
pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use router::{CommandRouter, DeviceTopics, DispatchOutcome};
pub use vio::{HttpVioService, VioConfig, VioService};
