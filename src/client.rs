use std::future::Future;
use crate::Result;

/// Register read operations the reader needs from a connection.
///
/// Futures are `Send` so a client can live inside a spawned worker task.
pub trait Client: Send {
    fn read_input_registers(&mut self, address: u16, quantity: u16)
        -> impl Future<Output = Result<Vec<u16>>> + Send;

    fn read_holding_registers(&mut self, address: u16, quantity: u16)
        -> impl Future<Output = Result<Vec<u16>>> + Send;

    /// Release the connection. Calling it again is a no-op.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}
