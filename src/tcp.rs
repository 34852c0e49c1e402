use std::io::{self, Cursor};
use std::time::Duration;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use enum_primitive::FromPrimitive;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::time::timeout;
use crate::{binary, Client, Error, ExceptionCode, Function, Reason, Result};

const MODBUS_PROTOCOL_TCP: u16 = 0x0000;
pub const MODBUS_TCP_DEFAULT_PORT: u16 = 502;
const MODBUS_HEADER_SIZE: usize = 7;
const MODBUS_MAX_PACKET_SIZE: usize = 260;
const MODBUS_MAX_READ_COUNT: u16 = 0x7d;
const MODBUS_MAX_ABANDONED: usize = 16;

/// Config structure for more control over the tcp socket settings
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// The TCP port to use for communication (Default: `502`)
    pub tcp_port: u16,
    /// Upper bound for connecting and for each request/response exchange (Default: `infinite`)
    pub tcp_timeout: Option<Duration>,
    /// The modbus Unit Identifier used in the modbus layer (Default: `1`)
    pub modbus_uid: u8,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            tcp_port: MODBUS_TCP_DEFAULT_PORT,
            tcp_timeout: None,
            modbus_uid: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Header {
    tid: u16,
    pid: u16,
    len: u16,
    uid: u8,
}

impl Header {
    fn new(tid: u16, uid: u8, len: u16) -> Header {
        Header {
            tid,
            pid: MODBUS_PROTOCOL_TCP,
            len: len - MODBUS_HEADER_SIZE as u16,
            uid,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut buff = Vec::with_capacity(MODBUS_MAX_PACKET_SIZE);
        buff.write_u16::<BigEndian>(self.tid)?;
        buff.write_u16::<BigEndian>(self.pid)?;
        buff.write_u16::<BigEndian>(self.len)?;
        buff.write_u8(self.uid)?;
        Ok(buff)
    }

    fn decode(bytes: &[u8]) -> Result<Header> {
        let mut rdr = Cursor::new(bytes);
        Ok(Header {
            tid: rdr.read_u16::<BigEndian>()?,
            pid: rdr.read_u16::<BigEndian>()?,
            len: rdr.read_u16::<BigEndian>()?,
            uid: rdr.read_u8()?,
        })
    }
}

/// Context object which holds state for all modbus operations.
#[derive(Debug)]
pub struct Transport {
    tid: u16,
    uid: u8,
    timeout: Option<Duration>,
    stream: Option<TcpStream>,
    // bytes received but not yet consumed as a frame
    rx: Vec<u8>,
    // transactions given up on after a timeout whose replies may still arrive
    abandoned: Vec<u16>,
    sending: bool,
}

impl Transport {
    /// Create a new context object and connect it to `addr` on modbus-tcp default
    /// port (502)
    pub async fn new(addr: &str) -> Result<Transport> {
        Self::new_with_cfg(addr, Config::default()).await
    }

    /// Create a new context object and connect it to `addr` with the settings in `cfg`
    pub async fn new_with_cfg(addr: &str, cfg: Config) -> Result<Transport> {
        let connect = TcpStream::connect((addr, cfg.tcp_port));
        let stream = match cfg.tcp_timeout {
            Some(t) => timeout(t, connect).await.map_err(|_| Error::Timeout)??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        info!("connected to modbus server {}:{}", addr, cfg.tcp_port);
        Ok(Transport {
            tid: 0,
            uid: cfg.modbus_uid,
            timeout: cfg.tcp_timeout,
            stream: Some(stream),
            rx: Vec::with_capacity(MODBUS_MAX_PACKET_SIZE),
            abandoned: Vec::new(),
            sending: false,
        })
    }

    // Create a new transaction Id, incrementing the previous one.
    // The Id is wrapping around if the Id reaches `u16::MAX`.
    fn new_tid(&mut self) -> u16 {
        self.tid = self.tid.wrapping_add(1);
        self.tid
    }

    /// `true` until `close` has been called or the stream was given up on.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn read(&mut self, fun: Function) -> Result<Vec<u8>> {
        let (addr, count) = match fun {
            Function::ReadHoldingRegisters(a, c) |
            Function::ReadInputRegisters(a, c) => (a, c),
        };
        let expected_bytes = 2 * count as usize;

        if count < 1 {
            return Err(Error::InvalidData(Reason::RecvBufferEmpty));
        }

        if count > MODBUS_MAX_READ_COUNT {
            return Err(Error::InvalidData(Reason::UnexpectedReplySize));
        }

        if self.stream.is_none() {
            return Err(Error::Closed);
        }

        let header = Header::new(self.new_tid(), self.uid, MODBUS_HEADER_SIZE as u16 + 6u16);
        let mut buff = header.encode()?;
        buff.write_u8(fun.code())?;
        buff.write_u16::<BigEndian>(addr)?;
        buff.write_u16::<BigEndian>(count)?;
        debug!("tx tid={} {:02x?}", header.tid, buff);

        let outcome = match self.timeout {
            Some(t) => timeout(t, self.exchange(header.tid, &buff)).await,
            None => Ok(self.exchange(header.tid, &buff).await),
        };
        let (resp_hd, body) = match outcome {
            Ok(reply) => reply?,
            Err(_) => {
                self.abandon(header.tid);
                return Err(Error::Timeout);
            }
        };
        debug!("rx tid={} {:02x?}", resp_hd.tid, body);

        Transport::validate_response_header(&header, &resp_hd)?;
        Transport::validate_response_code(fun.code(), &body)?;
        Transport::get_reply_data(&body, expected_bytes)
    }

    // Send one request frame and read back the response frame for `tid`, skipping late
    // replies to abandoned transactions. Only cancel-safe reads touch the socket, so a
    // timeout never loses bytes of a frame.
    async fn exchange(&mut self, tid: u16, buff: &[u8]) -> Result<(Header, Vec<u8>)> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let stream = self.stream.as_mut().ok_or(Error::Closed)?;
        self.sending = true;
        stream.write_all(buff).await?;
        self.sending = false;

        let mut chunk = [0u8; MODBUS_MAX_PACKET_SIZE];
        loop {
            match Transport::next_frame(&mut self.rx) {
                Ok(Some((hd, body))) => {
                    if hd.tid != tid {
                        if let Some(pos) = self.abandoned.iter().position(|t| *t == hd.tid) {
                            debug!("discarding late reply tid={}", hd.tid);
                            self.abandoned.swap_remove(pos);
                            continue;
                        }
                    }
                    return Ok((hd, body));
                }
                Ok(None) => {}
                Err(e) => {
                    self.poison();
                    return Err(e);
                }
            }

            let stream = self.stream.as_mut().ok_or(Error::Closed)?;
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }

    // Split one complete frame off the front of `rx`, if there is one.
    fn next_frame(rx: &mut Vec<u8>) -> Result<Option<(Header, Vec<u8>)>> {
        if rx.len() < MODBUS_HEADER_SIZE {
            return Ok(None);
        }
        let hd = Header::decode(&rx[..MODBUS_HEADER_SIZE])?;

        // the length field covers the unit id plus at least function code and one data byte
        let len = hd.len as usize;
        if len < 2 || len > MODBUS_MAX_PACKET_SIZE - MODBUS_HEADER_SIZE + 1 {
            return Err(Error::InvalidResponse);
        }
        let frame_size = MODBUS_HEADER_SIZE + len - 1;
        if rx.len() < frame_size {
            return Ok(None);
        }
        let body = rx[MODBUS_HEADER_SIZE..frame_size].to_vec();
        rx.drain(..frame_size);
        Ok(Some((hd, body)))
    }

    // Remember a timed out transaction so its reply can be skipped later. A request cut off
    // while being written cannot be recovered from.
    fn abandon(&mut self, tid: u16) {
        if self.sending || self.abandoned.len() >= MODBUS_MAX_ABANDONED {
            warn!("giving up on the connection after timeout of tid={}", tid);
            self.poison();
        } else {
            self.abandoned.push(tid);
        }
    }

    fn poison(&mut self) {
        self.stream = None;
        self.rx.clear();
        self.abandoned.clear();
        self.sending = false;
    }

    fn validate_response_header(req: &Header, resp: &Header) -> Result<()> {
        if req.tid != resp.tid || resp.pid != MODBUS_PROTOCOL_TCP {
            Err(Error::InvalidResponse)
        } else {
            Ok(())
        }
    }

    fn validate_response_code(code: u8, body: &[u8]) -> Result<()> {
        if code + 0x80 == body[0] {
            match body.get(1).and_then(|c| ExceptionCode::from_u8(*c)) {
                Some(code) => Err(Error::Exception(code)),
                None => Err(Error::InvalidResponse),
            }
        } else if code == body[0] {
            Ok(())
        } else {
            Err(Error::InvalidResponse)
        }
    }

    fn get_reply_data(body: &[u8], expected_bytes: usize) -> Result<Vec<u8>> {
        if body.len() < 2 || body[1] as usize != expected_bytes ||
           body.len() != expected_bytes + 2 {
            Err(Error::InvalidData(Reason::UnexpectedReplySize))
        } else {
            Ok(body[2..].to_vec())
        }
    }

    /// Shut the connection down. Only the first call touches the socket.
    pub async fn close(&mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        self.rx.clear();
        self.abandoned.clear();
        match self.stream.take() {
            Some(mut stream) => {
                info!("closing modbus connection");
                stream.shutdown().await.map_err(Error::Io)
            }
            None => Ok(()),
        }
    }
}

impl Client for Transport {
    /// Read `count` 16bit input registers starting at address `addr`.
    async fn read_input_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        let bytes = self.read(Function::ReadInputRegisters(addr, count)).await?;
        binary::pack_bytes(&bytes[..])
    }

    /// Read `count` 16bit registers starting at address `addr`.
    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        let bytes = self.read(Function::ReadHoldingRegisters(addr, count)).await?;
        binary::pack_bytes(&bytes[..])
    }

    async fn close(&mut self) -> Result<()> {
        Transport::close(self).await
    }
}
