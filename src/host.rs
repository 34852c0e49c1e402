//! The surface a flow host exposes to the reader.

use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use crate::reader::TriggerId;
use crate::Error;

/// Message forwarded to the next stage after a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub payload: f32,
}

/// A failed read, tied to the trigger that caused it.
#[derive(Debug)]
pub struct Failure {
    pub trigger: TriggerId,
    pub error: Error,
}

/// Output and error channels of the host the reader runs in.
pub trait Host: Send + Sync + 'static {
    /// Forward a reading to the next stage.
    fn send(&self, reading: Reading);

    /// Report a failed read on the host's diagnostic surface.
    fn error(&self, failure: Failure);
}

/// Host that hands everything to tokio channels.
#[derive(Debug, Clone)]
pub struct ChannelHost {
    readings: UnboundedSender<Reading>,
    failures: UnboundedSender<Failure>,
}

/// Receiving ends of a [`ChannelHost`].
#[derive(Debug)]
pub struct HostEvents {
    pub readings: UnboundedReceiver<Reading>,
    pub failures: UnboundedReceiver<Failure>,
}

impl ChannelHost {
    pub fn new() -> (ChannelHost, HostEvents) {
        let (readings, readings_rx) = unbounded_channel();
        let (failures, failures_rx) = unbounded_channel();
        (
            ChannelHost { readings, failures },
            HostEvents {
                readings: readings_rx,
                failures: failures_rx,
            },
        )
    }
}

impl Host for ChannelHost {
    fn send(&self, reading: Reading) {
        // a dropped receiver means nobody listens downstream anymore
        let _ = self.readings.send(reading);
    }

    fn error(&self, failure: Failure) {
        let _ = self.failures.send(failure);
    }
}
