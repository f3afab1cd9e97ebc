//! Minimal RESP2 client for the shared key-value store.
//!
//! Only the handful of commands the registry issues are supported; none of
//! them return arrays, so array replies are rejected as protocol errors.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use session_registry_core::{Dialer, KvConnection, StoreEndpoint, StoreError};
use tokio::{
    io::{
        AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufStream,
    },
    net::TcpStream,
    sync::Mutex,
};

/// Largest bulk reply accepted (64 MiB).
const MAX_BULK_LEN: usize = 64 * 1024 * 1024;

/// Decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
}

/// Encode a command as an array of bulk strings.
#[must_use]
pub fn encode_command(args: &[&[u8]]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf
}

/// Read one reply from a buffered stream.
///
/// # Errors
/// Returns error on I/O failure, premature EOF or malformed framing.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, StoreError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(StoreError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    let Some(body) = line.strip_suffix(b"\r\n") else {
        return Err(StoreError::Protocol("reply line not CRLF terminated".into()));
    };
    let Some((&kind, rest)) = body.split_first() else {
        return Err(StoreError::Protocol("empty reply line".into()));
    };
    let text = std::str::from_utf8(rest)
        .map_err(|_| StoreError::Protocol("reply header is not UTF-8".into()))?;

    match kind {
        b'+' => Ok(Reply::Simple(text.to_string())),
        b'-' => Ok(Reply::Error(text.to_string())),
        b':' => text
            .parse()
            .map(Reply::Integer)
            .map_err(|_| StoreError::Protocol(format!("bad integer reply {text:?}"))),
        b'$' => {
            let len: i64 = text
                .parse()
                .map_err(|_| StoreError::Protocol(format!("bad bulk length {text:?}")))?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|l| *l <= MAX_BULK_LEN)
                .ok_or_else(|| StoreError::Protocol(format!("bulk length {len} too large")))?;
            let mut data = vec![0u8; len + 2];
            reader.read_exact(&mut data).await?;
            if !data.ends_with(b"\r\n") {
                return Err(StoreError::Protocol("bulk reply not CRLF terminated".into()));
            }
            data.truncate(len);
            Ok(Reply::Bulk(Some(data)))
        }
        b'*' => Err(StoreError::Protocol("unexpected array reply".into())),
        other => Err(StoreError::Protocol(format!(
            "unknown reply type {:?}",
            char::from(other)
        ))),
    }
}

fn server_error(message: String) -> StoreError {
    if message.starts_with("NOAUTH") || message.starts_with("WRONGPASS") {
        StoreError::Auth(message)
    } else {
        StoreError::Protocol(message)
    }
}

fn unexpected(command: &str, reply: &Reply) -> StoreError {
    StoreError::Protocol(format!("unexpected reply to {command}: {reply:?}"))
}

/// Marks the connection unusable unless disarmed.
///
/// A command future dropped between writing the request and reading the
/// reply leaves that reply unread on the wire.
struct InFlight<'a> {
    poisoned: &'a AtomicBool,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.poisoned.store(true, Ordering::SeqCst);
        }
    }
}

/// A single RESP connection. Requests are serialized over it.
pub struct RespConnection<S> {
    io: Mutex<BufStream<S>>,
    poisoned: AtomicBool,
}

impl<S> RespConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established stream.
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self {
            io: Mutex::new(BufStream::new(stream)),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Send one command and read its reply.
    ///
    /// Server error replies are returned as `Reply::Error`, not as `Err`.
    ///
    /// # Errors
    /// Returns error on I/O failure or malformed reply.
    pub async fn command(&self, args: &[&[u8]]) -> Result<Reply, StoreError> {
        let mut io = self.io.lock().await;
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(StoreError::Protocol(
                "connection abandoned mid-request".into(),
            ));
        }

        let mut in_flight = InFlight {
            poisoned: &self.poisoned,
            armed: true,
        };
        io.write_all(&encode_command(args)).await?;
        io.flush().await?;
        let reply = read_reply(&mut *io).await;
        // Any failure leaves the stream at an unknown position.
        in_flight.armed = reply.is_err();
        reply
    }

    async fn expect_ok(&self, name: &str, args: &[&[u8]]) -> Result<(), StoreError> {
        match self.command(args).await? {
            Reply::Simple(_) => Ok(()),
            Reply::Error(message) => Err(server_error(message)),
            other => Err(unexpected(name, &other)),
        }
    }

    async fn expect_integer(&self, name: &str, args: &[&[u8]]) -> Result<i64, StoreError> {
        match self.command(args).await? {
            Reply::Integer(n) => Ok(n),
            Reply::Error(message) => Err(server_error(message)),
            other => Err(unexpected(name, &other)),
        }
    }

    /// Authenticate and select the database named by the endpoint.
    async fn handshake(&self, endpoint: &StoreEndpoint) -> Result<(), StoreError> {
        if let Some(password) = &endpoint.password {
            let reply = match &endpoint.username {
                Some(user) => {
                    self.command(&[b"AUTH", user.as_bytes(), password.as_bytes()])
                        .await?
                }
                None => self.command(&[b"AUTH", password.as_bytes()]).await?,
            };
            match reply {
                Reply::Simple(_) => {}
                Reply::Error(message) => return Err(StoreError::Auth(message)),
                other => return Err(unexpected("AUTH", &other)),
            }
        }
        if endpoint.db != 0 {
            let db = endpoint.db.to_string();
            self.expect_ok("SELECT", &[b"SELECT", db.as_bytes()]).await?;
        }
        self.ping().await
    }
}

#[async_trait]
impl<S> KvConnection for RespConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn ping(&self) -> Result<(), StoreError> {
        match self.command(&[b"PING"]).await? {
            Reply::Simple(pong) if pong == "PONG" => Ok(()),
            Reply::Error(message) => Err(server_error(message)),
            other => Err(unexpected("PING", &other)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.command(&[b"GET", key.as_bytes()]).await? {
            Reply::Bulk(None) => Ok(None),
            Reply::Bulk(Some(data)) => String::from_utf8(data)
                .map(Some)
                .map_err(|_| StoreError::Protocol(format!("value for {key} is not UTF-8"))),
            Reply::Error(message) => Err(server_error(message)),
            other => Err(unexpected("GET", &other)),
        }
    }

    async fn set_ex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<(), StoreError> {
        let ttl = ttl_seconds.to_string();
        self.expect_ok(
            "SETEX",
            &[b"SETEX", key.as_bytes(), ttl.as_bytes(), value.as_bytes()],
        )
        .await
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.expect_integer("DEL", &[b"DEL", key.as_bytes()]).await? > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .expect_integer("EXISTS", &[b"EXISTS", key.as_bytes()])
            .await?
            > 0)
    }
}

/// Dials the shared store over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, endpoint: &StoreEndpoint) -> Result<Arc<dyn KvConnection>, StoreError> {
        let stream = TcpStream::connect(endpoint.address())
            .await
            .map_err(|e| StoreError::Connect(format!("{endpoint}: {e}")))?;
        stream.set_nodelay(true)?;

        let conn = RespConnection::new(stream);
        conn.handshake(endpoint).await?;
        Ok(Arc::new(conn))
    }
}
