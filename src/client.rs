use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::chainpack::{ChainPackReader, ChainPackWriter};
use crate::constants::*;
use crate::cpon::CponReader;
use crate::error::Error;
use crate::rpcmessage::RpcMessage;
use crate::value::RpcValue;

static LAST_REQUEST_ID: AtomicI64 = AtomicI64::new(0);

/** Allocates a process-wide unique positive request id. */
pub fn next_request_id() -> i64 {
    LAST_REQUEST_ID.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Connecting,
    Connected,
    LoggedIn,
    ConnectionError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginType {
    Plain,
    Sha1,
}

impl LoginType {
    /** Wire name of the server-side password verification method. The
    library never hashes the password itself. */
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginType::Plain => "PLAIN",
            LoginType::Sha1 => "SHA1",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub user: String,
    pub password: String,
    pub login_type: LoginType,
    pub device_id: Option<String>,
    pub mount_point: Option<String>,
}

impl ConnectOptions {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> ConnectOptions {
        ConnectOptions {
            user: user.into(),
            password: password.into(),
            login_type: LoginType::Sha1,
            device_id: None,
            mount_point: None,
        }
    }
}

/** Wraps a frame body: uint-data length, protocol octet, body. The sender
always writes ChainPack. */
pub fn frame_bytes(body: &[u8]) -> Vec<u8> {
    let mut wr = ChainPackWriter::new();
    wr.write_uint_data(body.len() as u64 + 1);
    let mut out = wr.into_bytes();
    out.push(PROTOCOL_CHAINPACK);
    out.extend_from_slice(body);
    out
}

pub fn message_frame_bytes(msg: &RpcMessage) -> Result<Vec<u8>, Error> {
    Ok(frame_bytes(&msg.to_chainpack()?))
}

/** Extracts one complete frame from the front of the buffer.

Ok(None) means more bytes are needed and nothing was consumed. A complete
frame is always consumed, even when its body turns out to be malformed, so
one bad frame cannot wedge the stream. */
pub(crate) fn extract_frame(buf: &mut Vec<u8>) -> Result<Option<RpcMessage>, Error> {
    let mut rd = ChainPackReader::new(buf);
    let (frame_len, head_len) = match rd.read_uint_data() {
        Ok(n) => (n, rd.ctx.pos),
        Err(Error::BufferUnderflow) => return Ok(None),
        Err(e) => {
            // an unreadable length prefix cannot be resynchronized
            buf.clear();
            return Err(e);
        }
    };
    let packet_len = match usize::try_from(frame_len)
        .ok()
        .and_then(|n| n.checked_add(head_len))
    {
        Some(n) if frame_len > 0 => n,
        _ => {
            buf.clear();
            return Err(Error::MalformedInput("invalid frame length".into()));
        }
    };
    if packet_len > buf.len() {
        return Ok(None);
    }

    let proto = buf[head_len];
    let body = &buf[head_len + 1..packet_len];
    let res = match proto {
        PROTOCOL_CHAINPACK => ChainPackReader::new(body).read(),
        PROTOCOL_CPON => CponReader::new(body).read(),
        _ => Err(Error::MalformedInput(format!(
            "unknown protocol type: {}",
            proto
        ))),
    };
    buf.drain(..packet_len);
    match res {
        Ok(val) => Ok(Some(RpcMessage::from_value(val)?)),
        Err(Error::BufferUnderflow) => Err(Error::MalformedInput("truncated frame body".into())),
        Err(e) => Err(e),
    }
}

/** Read half of the connection plus the frame reassembly buffer. */
pub struct FrameReader {
    reader: OwnedReadHalf,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(reader: OwnedReadHalf) -> FrameReader {
        FrameReader {
            reader,
            buf: Vec::new(),
        }
    }

    pub async fn next_message(&mut self) -> Result<RpcMessage, Error> {
        loop {
            match extract_frame(&mut self.buf) {
                Ok(Some(msg)) => return Ok(msg),
                Ok(None) => {
                    let mut chunk = [0u8; 1024];
                    let n = self.reader.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(Error::TransportClosed);
                    }
                    self.buf.extend_from_slice(&chunk[..n]);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/** Single-task SHV RPC client: transport, framing and the login handshake.

Call correlation and signal dispatch live in ClientConnection, which splits
this client into its receive and send halves after login. */
pub struct RpcClient {
    frames: FrameReader,
    writer: OwnedWriteHalf,
    state: State,
}

impl RpcClient {
    pub fn state(&self) -> State {
        self.state
    }

    pub async fn connect(host: &str, port: u16, opts: &ConnectOptions) -> Result<RpcClient, Error> {
        debug!("connecting to {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        let (reader, writer) = stream.into_split();
        let mut client = RpcClient {
            frames: FrameReader::new(reader),
            writer,
            state: State::Connected,
        };
        debug!("tcp connected");
        match client.login(opts).await {
            Ok(()) => {
                client.state = State::LoggedIn;
                debug!("logged in");
                Ok(client)
            }
            Err(e) => {
                client.state = State::ConnectionError;
                Err(e)
            }
        }
    }

    async fn login(&mut self, opts: &ConnectOptions) -> Result<(), Error> {
        self.call_shv_method(None, "hello", None).await?;
        self.read_rpc_message().await?;

        let mut login = BTreeMap::new();
        login.insert("user".to_owned(), RpcValue::from(opts.user.as_str()));
        login.insert("password".to_owned(), RpcValue::from(opts.password.as_str()));
        login.insert("type".to_owned(), RpcValue::from(opts.login_type.as_str()));

        let mut options = BTreeMap::new();
        options.insert("idleWatchDogTimeOut".to_owned(), RpcValue::from(0i64));
        if let Some(device_id) = &opts.device_id {
            let mut device = BTreeMap::new();
            device.insert("deviceId".to_owned(), RpcValue::from(device_id.as_str()));
            options.insert("device".to_owned(), RpcValue::from(device));
        } else if let Some(mount_point) = &opts.mount_point {
            let mut device = BTreeMap::new();
            device.insert("mountPoint".to_owned(), RpcValue::from(mount_point.as_str()));
            options.insert("device".to_owned(), RpcValue::from(device));
        }

        let mut params = BTreeMap::new();
        params.insert("login".to_owned(), RpcValue::from(login));
        params.insert("options".to_owned(), RpcValue::from(options));

        debug!("logging in");
        self.call_shv_method(None, "login", Some(RpcValue::from(params)))
            .await?;
        self.read_rpc_message().await?;
        Ok(())
    }

    pub async fn call_shv_method(
        &mut self,
        shv_path: Option<&str>,
        method: &str,
        params: Option<RpcValue>,
    ) -> Result<i64, Error> {
        let request_id = next_request_id();
        self.call_shv_method_with_id(request_id, shv_path, method, params)
            .await?;
        Ok(request_id)
    }

    pub async fn call_shv_method_with_id(
        &mut self,
        request_id: i64,
        shv_path: Option<&str>,
        method: &str,
        params: Option<RpcValue>,
    ) -> Result<(), Error> {
        let msg = RpcMessage::new_request(shv_path, method, params, request_id);
        self.send_rpc_message(&msg).await
    }

    pub async fn send_rpc_message(&mut self, msg: &RpcMessage) -> Result<(), Error> {
        debug!("<== SND: {}", msg);
        let data = message_frame_bytes(msg)?;
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /** Waits for the next whole message. A response carrying an Error
    payload surfaces as Error::MethodCall. */
    pub async fn read_rpc_message(&mut self) -> Result<RpcMessage, Error> {
        let msg = self.frames.next_message().await?;
        debug!("==> REC: {}", msg);
        if let Some(err) = msg.error() {
            return Err(Error::MethodCall(err.clone()));
        }
        Ok(msg)
    }

    pub fn into_parts(self) -> (FrameReader, OwnedWriteHalf) {
        (self.frames, self.writer)
    }
}
