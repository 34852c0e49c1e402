//! Modbus TCP register reader for flow-based hosts.
//!
//! A [`RegisterReader`] owns one connection to a fixed controller endpoint. Each trigger
//! performs one register read, converts the raw words into an `f32` and hands the result to
//! the [`Host`]; a failed read is reported to the host's error channel instead.
//!
//! # Examples
//!
//! ```no_run
//! use modbus_bridge::{ChannelHost, RegisterReader, Settings};
//!
//! # async fn run() -> modbus_bridge::Result<()> {
//! let (host, mut events) = ChannelHost::new();
//! let reader = RegisterReader::connect(&Settings::default(), host).await?;
//!
//! reader.trigger()?;
//! if let Some(reading) = events.readings.recv().await {
//!     println!("{}", reading.payload);
//! }
//! reader.shutdown().await
//! # }
//! ```

#[macro_use]
extern crate enum_primitive;

use std::io;
use std::str::FromStr;

mod binary;
mod client;

pub mod config;
pub mod convert;
pub mod host;
pub mod reader;

/// The Modbus TCP backend implements a Modbus variant used for communication over TCP/IPv4 networks.
pub mod tcp;

pub use client::Client;
pub use config::{ConfigError, Settings};
pub use convert::Conversion;
pub use host::{ChannelHost, Failure, Host, HostEvents, Reading};
pub use reader::{RegisterReader, State, TriggerId};
pub use tcp::Transport;

type Address = u16;
type Quantity = u16;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    ReadHoldingRegisters(Address, Quantity),
    ReadInputRegisters(Address, Quantity),
}

impl Function {
    fn code(&self) -> u8 {
        match *self {
            Function::ReadHoldingRegisters(_, _) => 0x03,
            Function::ReadInputRegisters(_, _) => 0x04,
        }
    }
}

enum_from_primitive! {
#[derive(Debug, Clone, Copy, PartialEq)]
/// Modbus exception codes returned from the server.
pub enum ExceptionCode {
    IllegalFunction         = 0x01,
    IllegalDataAddress      = 0x02,
    IllegalDataValue        = 0x03,
    SlaveOrServerFailure    = 0x04,
    Acknowledge             = 0x05,
    SlaveOrServerBusy       = 0x06,
    NegativeAcknowledge     = 0x07,
    MemoryParity            = 0x08,
    NotDefined              = 0x09,
    GatewayPath             = 0x0a,
    GatewayTarget           = 0x0b
}
}

/// `InvalidData` reasons
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reason {
    UnexpectedReplySize,
    BytecountNotEven,
    RecvBufferEmpty,
    InvalidByteorder,
    NotEnoughRegisters,
}

/// Combination of Modbus, IO and data corruption errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("modbus exception: {0:?}")]
    Exception(ExceptionCode),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("request timed out")]
    Timeout,
    #[error("invalid response")]
    InvalidResponse,
    #[error("invalid data: {0:?}")]
    InvalidData(Reason),
    #[error("invalid function")]
    InvalidFunction,
    #[error("connection closed")]
    Closed,
}

impl From<ExceptionCode> for Error {
    fn from(err: ExceptionCode) -> Error {
        Error::Exception(err)
    }
}

/// Result type used to nofify success or failure in communication
pub type Result<T> = std::result::Result<T, Error>;

/// Register class a reader addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// Read-only 3xxxx registers, function `0x04`.
    #[default]
    Input,
    /// Read/write 4xxxx registers, function `0x03`.
    Holding,
}

impl FromStr for RegisterKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<RegisterKind, String> {
        match s {
            "input" => Ok(RegisterKind::Input),
            "holding" => Ok(RegisterKind::Holding),
            _ => Err(format!("unknown register kind `{}`", s)),
        }
    }
}
