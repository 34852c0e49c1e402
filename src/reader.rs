//! The register reader: one connection, one read per trigger.
//!
//! The connection is owned by a worker task. Triggers are queued on an unbounded channel, so
//! reads over the connection never interleave and complete in the order they were
//! triggered. Triggering never waits for the network.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use crate::config::{Register, Settings};
use crate::host::{Failure, Host, Reading};
use crate::{Client, Error, RegisterKind, Result, Transport};

/// Sequence number of a trigger, starting at 1.
pub type TriggerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connected,
    Closed,
}

enum Command {
    Read(TriggerId),
    Close(oneshot::Sender<Result<()>>),
}

struct Worker {
    requests: UnboundedSender<Command>,
    handle: JoinHandle<()>,
}

pub struct RegisterReader {
    worker: Mutex<Option<Worker>>,
    closing: Arc<AtomicBool>,
    last_trigger: AtomicU64,
}

impl RegisterReader {
    /// Connect to the configured endpoint and start serving triggers.
    pub async fn connect<H: Host>(settings: &Settings, host: H) -> Result<RegisterReader> {
        let endpoint = &settings.endpoint;
        let transport = Transport::new_with_cfg(&endpoint.host, endpoint.transport_config())
            .await
            .map_err(|e| {
                error!("failed to connect to {}:{}: {}", endpoint.host, endpoint.port, e);
                e
            })?;
        Ok(RegisterReader::with_client(transport, settings.register, host))
    }

    /// Start serving triggers over an already connected client.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_client<C, H>(client: C, register: Register, host: H) -> RegisterReader
    where
        C: Client + 'static,
        H: Host,
    {
        let (requests, queue) = unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run(client, register, host, queue, closing.clone()));
        debug!(
            "reading {} {:?} register(s) at {} with {:?} conversion",
            register.count(),
            register.kind,
            register.address,
            register.conversion
        );
        RegisterReader {
            worker: Mutex::new(Some(Worker { requests, handle })),
            closing,
            last_trigger: AtomicU64::new(0),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> State {
        match *self.worker() {
            Some(_) => State::Connected,
            None => State::Closed,
        }
    }

    /// Queue one read. Returns as soon as the read is queued; the outcome goes to the host.
    pub fn trigger(&self) -> Result<TriggerId> {
        let worker = self.worker();
        let worker = worker.as_ref().ok_or(Error::Closed)?;
        // the lock is held while sending so trigger ids follow queue order
        let trigger = self.last_trigger.fetch_add(1, Ordering::Relaxed) + 1;
        worker.requests.send(Command::Read(trigger)).map_err(|_| Error::Closed)?;
        debug!("queued read for trigger {}", trigger);
        Ok(trigger)
    }

    /// Stop accepting triggers and close the connection.
    ///
    /// A read already on the wire completes first; queued reads that have not started are
    /// reported as [`Error::Closed`]. Only the first call does anything.
    pub async fn shutdown(&self) -> Result<()> {
        let worker = self.worker().take();
        let Some(worker) = worker else {
            debug!("register reader already closed");
            return Ok(());
        };
        self.closing.store(true, Ordering::SeqCst);

        let (done, closed) = oneshot::channel();
        let _ = worker.requests.send(Command::Close(done));
        drop(worker.requests);
        let result = closed.await.unwrap_or(Ok(()));
        if let Err(e) = worker.handle.await {
            warn!("register reader worker ended abnormally: {}", e);
        }
        result
    }
}

async fn run<C: Client, H: Host>(
    mut client: C,
    register: Register,
    host: H,
    mut queue: UnboundedReceiver<Command>,
    closing: Arc<AtomicBool>,
) {
    let mut done = None;
    while let Some(command) = queue.recv().await {
        match command {
            Command::Read(trigger) => {
                if closing.load(Ordering::SeqCst) {
                    debug!("skipping read for trigger {} after shutdown", trigger);
                    host.error(Failure { trigger, error: Error::Closed });
                    continue;
                }
                match read_once(&mut client, &register).await {
                    Ok(payload) => {
                        debug!("trigger {} read {}", trigger, payload);
                        host.send(Reading { payload });
                    }
                    Err(error) => {
                        warn!("read for trigger {} failed: {}", trigger, error);
                        host.error(Failure { trigger, error });
                    }
                }
            }
            Command::Close(reply) => {
                done = Some(reply);
                break;
            }
        }
    }

    let closed = client.close().await;
    match closed {
        Ok(()) => info!("register reader closed"),
        Err(ref e) => warn!("closing connection failed: {}", e),
    }
    if let Some(reply) = done {
        let _ = reply.send(closed);
    }
}

async fn read_once<C: Client>(client: &mut C, register: &Register) -> Result<f32> {
    let count = register.count();
    let registers = match register.kind {
        RegisterKind::Input => client.read_input_registers(register.address, count).await?,
        RegisterKind::Holding => client.read_holding_registers(register.address, count).await?,
    };
    register.conversion.apply(&registers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use crate::host::ChannelHost;
    use crate::Conversion;

    #[derive(Default)]
    struct Counters {
        calls: Mutex<Vec<(RegisterKind, u16, u16)>>,
        closes: AtomicUsize,
    }

    impl Counters {
        fn calls(&self) -> Vec<(RegisterKind, u16, u16)> {
            self.calls.lock().unwrap().clone()
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    struct ScriptedClient {
        replies: VecDeque<Result<Vec<u16>>>,
        delay: Duration,
        open: bool,
        counters: Arc<Counters>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<Vec<u16>>>) -> (ScriptedClient, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            let client = ScriptedClient {
                replies: replies.into(),
                delay: Duration::ZERO,
                open: true,
                counters: counters.clone(),
            };
            (client, counters)
        }

        fn with_delay(mut self, delay: Duration) -> ScriptedClient {
            self.delay = delay;
            self
        }

        async fn next(&mut self, kind: RegisterKind, address: u16, quantity: u16) -> Result<Vec<u16>> {
            self.counters.calls.lock().unwrap().push((kind, address, quantity));
            tokio::time::sleep(self.delay).await;
            self.replies.pop_front().unwrap_or(Err(Error::InvalidResponse))
        }
    }

    impl Client for ScriptedClient {
        async fn read_input_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
            self.next(RegisterKind::Input, address, quantity).await
        }

        async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
            self.next(RegisterKind::Holding, address, quantity).await
        }

        async fn close(&mut self) -> Result<()> {
            if self.open {
                self.open = false;
                self.counters.closes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn trigger_emits_converted_reading() {
        let (client, counters) = ScriptedClient::new(vec![Ok(vec![0x3f80])]);
        let (host, mut events) = ChannelHost::new();
        let reader = RegisterReader::with_client(client, Register::default(), host);
        assert_eq!(reader.state(), State::Connected);

        assert_eq!(reader.trigger().unwrap(), 1);
        assert_eq!(events.readings.recv().await.unwrap(), Reading { payload: 16256.0 });
        assert_eq!(counters.calls(), vec![(RegisterKind::Input, 30000, 1)]);

        reader.shutdown().await.unwrap();
        assert!(events.failures.recv().await.is_none());
        assert_eq!(counters.closes(), 1);
    }

    #[tokio::test]
    async fn failed_read_reports_once_and_emits_nothing() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let (client, counters) = ScriptedClient::new(vec![Err(Error::Io(reset))]);
        let (host, mut events) = ChannelHost::new();
        let reader = RegisterReader::with_client(client, Register::default(), host);

        let trigger = reader.trigger().unwrap();
        let failure = events.failures.recv().await.unwrap();
        assert_eq!(failure.trigger, trigger);
        assert!(matches!(failure.error, Error::Io(ref e) if e.kind() == io::ErrorKind::ConnectionReset));

        reader.shutdown().await.unwrap();
        assert!(events.readings.recv().await.is_none());
        assert!(events.failures.recv().await.is_none());
        assert_eq!(counters.calls().len(), 1);
    }

    #[tokio::test]
    async fn conversion_error_is_reported() {
        let (client, _counters) = ScriptedClient::new(vec![Ok(vec![])]);
        let (host, mut events) = ChannelHost::new();
        let reader = RegisterReader::with_client(client, Register::default(), host);

        reader.trigger().unwrap();
        let failure = events.failures.recv().await.unwrap();
        assert!(matches!(failure.error, Error::InvalidData(crate::Reason::NotEnoughRegisters)));
        reader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn every_trigger_reads_again() {
        let (client, counters) = ScriptedClient::new(vec![Ok(vec![5]), Ok(vec![5]), Ok(vec![6])]);
        let (host, mut events) = ChannelHost::new();
        let reader = RegisterReader::with_client(client, Register::default(), host);

        for _ in 0..3 {
            reader.trigger().unwrap();
        }
        let mut payloads = Vec::new();
        for _ in 0..3 {
            payloads.push(events.readings.recv().await.unwrap().payload);
        }
        assert_eq!(payloads, vec![5.0, 5.0, 6.0]);
        assert_eq!(counters.calls().len(), 3);
        reader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn back_to_back_triggers_complete_in_order() {
        let (client, counters) = ScriptedClient::new(vec![Ok(vec![1]), Ok(vec![2])]);
        let client = client.with_delay(Duration::from_millis(20));
        let (host, mut events) = ChannelHost::new();
        let reader = RegisterReader::with_client(client, Register::default(), host);

        assert_eq!(reader.trigger().unwrap(), 1);
        assert_eq!(reader.trigger().unwrap(), 2);
        assert_eq!(events.readings.recv().await.unwrap().payload, 1.0);
        assert_eq!(events.readings.recv().await.unwrap().payload, 2.0);
        assert_eq!(counters.calls().len(), 2);
        reader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn holding_word_pair() {
        let register = Register {
            kind: RegisterKind::Holding,
            address: 2,
            conversion: Conversion::WordPair,
        };
        let (client, counters) = ScriptedClient::new(vec![Ok(vec![0x3f80, 0x0000])]);
        let (host, mut events) = ChannelHost::new();
        let reader = RegisterReader::with_client(client, register, host);

        reader.trigger().unwrap();
        assert_eq!(events.readings.recv().await.unwrap().payload, 1.0);
        assert_eq!(counters.calls(), vec![(RegisterKind::Holding, 2, 2)]);
        reader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn close_without_trigger() {
        let (client, counters) = ScriptedClient::new(vec![]);
        let (host, _events) = ChannelHost::new();
        let reader = RegisterReader::with_client(client, Register::default(), host);

        reader.shutdown().await.unwrap();
        assert_eq!(reader.state(), State::Closed);
        assert!(counters.calls().is_empty());
        assert_eq!(counters.closes(), 1);
    }

    #[tokio::test]
    async fn repeated_shutdown_closes_once() {
        let (client, counters) = ScriptedClient::new(vec![]);
        let (host, _events) = ChannelHost::new();
        let reader = RegisterReader::with_client(client, Register::default(), host);

        reader.shutdown().await.unwrap();
        reader.shutdown().await.unwrap();
        assert_eq!(counters.closes(), 1);
        assert!(matches!(reader.trigger(), Err(Error::Closed)));
        assert!(counters.calls().is_empty());
    }

    #[tokio::test]
    async fn queued_reads_are_dropped_on_shutdown() {
        let (client, counters) = ScriptedClient::new(vec![Ok(vec![1]), Ok(vec![2])]);
        let client = client.with_delay(Duration::from_millis(100));
        let (host, mut events) = ChannelHost::new();
        let reader = RegisterReader::with_client(client, Register::default(), host);

        reader.trigger().unwrap();
        let second = reader.trigger().unwrap();
        // let the first read get on the wire
        tokio::time::sleep(Duration::from_millis(20)).await;
        reader.shutdown().await.unwrap();

        assert_eq!(events.readings.recv().await.unwrap().payload, 1.0);
        assert!(events.readings.recv().await.is_none());
        let failure = events.failures.recv().await.unwrap();
        assert_eq!(failure.trigger, second);
        assert!(matches!(failure.error, Error::Closed));
        assert_eq!(counters.calls().len(), 1);
        assert_eq!(counters.closes(), 1);
    }

    #[tokio::test]
    async fn dropping_the_reader_releases_the_connection() {
        let (client, counters) = ScriptedClient::new(vec![]);
        let (host, _events) = ChannelHost::new();
        let reader = RegisterReader::with_client(client, Register::default(), host);
        drop(reader);

        for _ in 0..100 {
            if counters.closes() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counters.closes(), 1);
    }
}
