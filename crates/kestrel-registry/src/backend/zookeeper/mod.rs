//! ZooKeeper backend speaking the native client protocol.
//!
//! One TCP connection carries one ZooKeeper session. Instances are ephemeral
//! znodes, so the ensemble removes them when the session times out. Requests
//! are serialized over the connection; watch events are never requested, so
//! every reply answers the request just sent.
//!
//! Reads reconnect on their own after the connection is lost, with a fresh
//! session of the last negotiated TTL. Writes never do: an ephemeral node has
//! to belong to the session the registry client believes it holds, so a
//! write on a lost or replaced session reports `NotFound` and the client
//! reopens the session and re-publishes.

mod jute;

use std::time::Duration;

use async_trait::async_trait;
use kestrel_common::protocol::{RegistryError, TransportError};
use kestrel_common::transport::{receive_message, send_message};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use self::jute::{Reader, Stat, Writer};
use super::{CoordinationBackend, KeyValue, SessionId, Subscription, WatchSink};

struct Connection {
    stream: TcpStream,
    session_id: SessionId,
    next_xid: i32,
}

/// Reply to a single request: the error code and, when zero, the body.
struct Reply {
    err: i32,
    body: Vec<u8>,
}

pub struct ZookeeperBackend {
    address: String,
    timeout: Duration,
    /// TTL of the last session opened, reused when a read reconnects
    session_ttl: parking_lot::Mutex<Option<Duration>>,
    connection: Mutex<Option<Connection>>,
}

impl ZookeeperBackend {
    /// Creates a backend for the ensemble member at `address` (`host:port`).
    /// The connection is made by `open_session`.
    pub fn new(address: &str, timeout: Duration) -> Self {
        Self {
            address: address.trim_start_matches("zk://").to_string(),
            timeout,
            session_ttl: parking_lot::Mutex::new(None),
            connection: Mutex::new(None),
        }
    }

    async fn handshake(&self, ttl: Duration) -> Result<Connection, RegistryError> {
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| unavailable(&self.address, "connect timed out"))?
            .map_err(|e| unavailable(&self.address, e))?;
        let _ = stream.set_nodelay(true);

        let request = Writer::new()
            .int(0) // protocol version
            .long(0) // last zxid seen
            .int(ttl.as_millis() as i32)
            .long(0) // session id: new session
            .buffer(&[0u8; 16])
            .boolean(false) // read-only
            .finish();

        let reply = tokio::time::timeout(self.timeout, async {
            send_message(&mut stream, &request).await?;
            receive_message(&mut stream).await
        })
        .await
        .map_err(|_| unavailable(&self.address, "handshake timed out"))?
        .map_err(|e| unavailable(&self.address, e))?;

        let mut reader = Reader::new(&reply);
        let _protocol_version = reader.int()?;
        let negotiated_timeout = reader.int()?;
        let session_id = reader.long()?;
        if negotiated_timeout <= 0 {
            return Err(unavailable(&self.address, "session rejected by server"));
        }

        tracing::debug!(
            session = format_args!("{:#x}", session_id),
            timeout_ms = negotiated_timeout,
            "ZooKeeper session established"
        );

        Ok(Connection {
            stream,
            session_id,
            next_xid: 1,
        })
    }

    /// Sends one request on the session connection and waits for its reply.
    ///
    /// An I/O failure drops the connection; the session is then gone as far
    /// as this backend is concerned. Read requests on a dropped connection
    /// open a new one first.
    async fn call(&self, op: i32, body: Writer) -> Result<Reply, RegistryError> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() && jute::is_read(op) {
            let ttl = *self.session_ttl.lock();
            if let Some(ttl) = ttl {
                let connection = self.handshake(ttl).await?;
                tracing::info!(
                    address = %self.address,
                    session = format_args!("{:#x}", connection.session_id),
                    "Reconnected to ZooKeeper"
                );
                *guard = Some(connection);
            }
        }
        let conn = guard
            .as_mut()
            .ok_or_else(|| RegistryError::Unavailable("no zookeeper session".to_string()))?;

        let xid = if op == jute::OP_PING {
            jute::XID_PING
        } else {
            let xid = conn.next_xid;
            conn.next_xid = conn.next_xid.wrapping_add(1).max(1);
            xid
        };

        let mut frame = Writer::new().int(xid).int(op).finish();
        frame.extend_from_slice(&body.finish());

        let exchange = tokio::time::timeout(self.timeout, async {
            send_message(&mut conn.stream, &frame).await?;
            loop {
                let reply = receive_message(&mut conn.stream).await?;
                let mut reader = Reader::new(&reply);
                let reply_xid = reader.int().map_err(|e| TransportError::Codec(e.to_string()))?;
                if reply_xid == jute::XID_WATCH_EVENT {
                    continue;
                }
                return Ok::<_, TransportError>((reply_xid, reply));
            }
        })
        .await;

        let (reply_xid, reply) = match exchange {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                *guard = None;
                return Err(unavailable(&self.address, e));
            }
            Err(_) => {
                *guard = None;
                return Err(unavailable(&self.address, "request timed out"));
            }
        };

        if reply_xid != xid {
            *guard = None;
            return Err(RegistryError::Codec(format!(
                "zookeeper reply xid {} does not match request {}",
                reply_xid, xid
            )));
        }

        let mut reader = Reader::new(&reply[4..]);
        let _zxid = reader.long()?;
        let err = reader.int()?;

        if err == jute::ERR_SESSION_EXPIRED {
            *guard = None;
        }

        Ok(Reply {
            err,
            body: reply[16..].to_vec(),
        })
    }

    async fn create_node(&self, path: &str, data: &[u8], flags: i32) -> Result<i32, RegistryError> {
        let body = Writer::new().string(path).buffer(data).open_acl().int(flags);
        Ok(self.call(jute::OP_CREATE, body).await?.err)
    }

    async fn ensure_parents(&self, path: &str) -> Result<(), RegistryError> {
        let mut parent = String::new();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            parent.push('/');
            parent.push_str(segment);
            match self.create_node(&parent, &[], jute::FLAG_PERSISTENT).await? {
                jute::ERR_OK | jute::ERR_NODE_EXISTS => {}
                err => return Err(server_error(&parent, err)),
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>, RegistryError> {
        let reply = self
            .call(jute::OP_EXISTS, Writer::new().string(path).boolean(false))
            .await?;
        match reply.err {
            jute::ERR_OK => Ok(Some(Reader::new(&reply.body).stat()?)),
            jute::ERR_NO_NODE => Ok(None),
            err => Err(server_error(path, err)),
        }
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, RegistryError> {
        let reply = self
            .call(jute::OP_GET_DATA, Writer::new().string(path).boolean(false))
            .await?;
        match reply.err {
            jute::ERR_OK => Ok(Some(Reader::new(&reply.body).buffer()?)),
            jute::ERR_NO_NODE => Ok(None),
            err => Err(server_error(path, err)),
        }
    }

    /// Fails with `NotFound` unless the live connection carries `session`.
    async fn require_session(&self, session: SessionId) -> Result<(), RegistryError> {
        match self.connection.lock().await.as_ref() {
            Some(conn) if conn.session_id == session => Ok(()),
            _ => Err(RegistryError::NotFound(format!("session {:#x}", session))),
        }
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        let reply = self
            .call(jute::OP_GET_CHILDREN, Writer::new().string(path).boolean(false))
            .await?;
        match reply.err {
            jute::ERR_OK => Reader::new(&reply.body).strings(),
            jute::ERR_NO_NODE => Ok(Vec::new()),
            err => Err(server_error(path, err)),
        }
    }
}

#[async_trait]
impl CoordinationBackend for ZookeeperBackend {
    fn name(&self) -> &'static str {
        "zookeeper"
    }

    async fn open_session(&self, ttl: Duration) -> Result<SessionId, RegistryError> {
        let connection = self.handshake(ttl).await?;
        let session_id = connection.session_id;
        *self.session_ttl.lock() = Some(ttl);
        *self.connection.lock().await = Some(connection);
        Ok(session_id)
    }

    async fn keep_alive(&self, session: SessionId) -> Result<(), RegistryError> {
        self.require_session(session).await?;

        match self.call(jute::OP_PING, Writer::new()).await {
            Ok(reply) if reply.err == jute::ERR_OK => Ok(()),
            Ok(reply) if reply.err == jute::ERR_SESSION_EXPIRED => {
                Err(RegistryError::NotFound(format!("session {:#x} expired", session)))
            }
            Ok(reply) => Err(server_error("ping", reply.err)),
            // The connection is gone and the session with it
            Err(RegistryError::Unavailable(_)) => {
                Err(RegistryError::NotFound(format!("session {:#x} lost", session)))
            }
            Err(e) => Err(e),
        }
    }

    async fn close_session(&self, _session: SessionId) -> Result<(), RegistryError> {
        let result = self.call(jute::OP_CLOSE_SESSION, Writer::new()).await;
        *self.connection.lock().await = None;
        match result {
            Ok(_) | Err(RegistryError::Unavailable(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, session: SessionId, key: &str, value: &[u8]) -> Result<(), RegistryError> {
        self.require_session(session).await?;
        self.ensure_parents(key).await?;

        match self.create_node(key, value, jute::FLAG_EPHEMERAL).await? {
            jute::ERR_OK => Ok(()),
            jute::ERR_NODE_EXISTS => match self.exists(key).await? {
                Some(stat) if stat.ephemeral_owner == session => {
                    let body = Writer::new().string(key).buffer(value).int(-1);
                    match self.call(jute::OP_SET_DATA, body).await?.err {
                        jute::ERR_OK => Ok(()),
                        err => Err(server_error(key, err)),
                    }
                }
                Some(_) => Err(RegistryError::Conflict(key.to_string())),
                // Expired between create and exists; try once more
                None => match self.create_node(key, value, jute::FLAG_EPHEMERAL).await? {
                    jute::ERR_OK => Ok(()),
                    jute::ERR_NODE_EXISTS => Err(RegistryError::Conflict(key.to_string())),
                    err => Err(server_error(key, err)),
                },
            },
            err => Err(server_error(key, err)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let reply = self
            .call(jute::OP_DELETE, Writer::new().string(key).int(-1))
            .await?;
        match reply.err {
            jute::ERR_OK | jute::ERR_NO_NODE => Ok(()),
            err => Err(server_error(key, err)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError> {
        let dir = parent_dir(prefix);
        let mut children = self.get_children(&dir).await?;
        children.sort();

        let mut entries = Vec::with_capacity(children.len());
        for child in children {
            let path = if dir == "/" {
                format!("/{}", child)
            } else {
                format!("{}/{}", dir, child)
            };
            if !path.starts_with(prefix) {
                continue;
            }
            // Nodes can vanish between getChildren and getData
            if let Some(data) = self.get_data(&path).await? {
                entries.push(KeyValue::new(path, data));
            }
        }
        Ok(entries)
    }

    async fn subscribe(&self, _prefix: &str, _sink: WatchSink) -> Result<Subscription, RegistryError> {
        // ZooKeeper watches are one-shot and need a reader task per
        // connection; polling getChildren is enough for membership.
        Ok(Subscription::Poll)
    }
}

/// Directory whose children are candidates for `prefix`.
fn parent_dir(prefix: &str) -> String {
    let dir = match prefix.strip_suffix('/') {
        Some(dir) => dir,
        None => prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(""),
    };
    if dir.is_empty() {
        "/".to_string()
    } else {
        dir.to_string()
    }
}

fn unavailable(address: &str, detail: impl std::fmt::Display) -> RegistryError {
    RegistryError::Unavailable(format!("zookeeper at {}: {}", address, detail))
}

fn server_error(path: &str, code: i32) -> RegistryError {
    RegistryError::Unavailable(format!("zookeeper error {} on {}", code, path))
}
