//! Jute, ZooKeeper's record serialization: big-endian integers,
//! length-prefixed strings/buffers (length -1 is null) and length-prefixed
//! vectors.

use kestrel_common::protocol::RegistryError;

pub const OP_CREATE: i32 = 1;
pub const OP_DELETE: i32 = 2;
pub const OP_EXISTS: i32 = 3;
pub const OP_GET_DATA: i32 = 4;
pub const OP_SET_DATA: i32 = 5;
pub const OP_GET_CHILDREN: i32 = 8;
pub const OP_PING: i32 = 11;
pub const OP_CLOSE_SESSION: i32 = -11;

/// Requests that only read state and may run on any session.
pub fn is_read(op: i32) -> bool {
    matches!(op, OP_EXISTS | OP_GET_DATA | OP_GET_CHILDREN)
}

pub const XID_PING: i32 = -2;
pub const XID_WATCH_EVENT: i32 = -1;

pub const ERR_OK: i32 = 0;
pub const ERR_NO_NODE: i32 = -101;
pub const ERR_NODE_EXISTS: i32 = -110;
pub const ERR_SESSION_EXPIRED: i32 = -112;

pub const FLAG_PERSISTENT: i32 = 0;
pub const FLAG_EPHEMERAL: i32 = 1;

/// `world:anyone` with all permissions.
pub const PERM_ALL: i32 = 31;

#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn int(mut self, value: i32) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn long(mut self, value: i64) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn boolean(mut self, value: bool) -> Self {
        self.buf.push(value as u8);
        self
    }

    pub fn buffer(self, value: &[u8]) -> Self {
        let mut this = self.int(value.len() as i32);
        this.buf.extend_from_slice(value);
        this
    }

    pub fn string(self, value: &str) -> Self {
        self.buffer(value.as_bytes())
    }

    /// Open ACL: a single `world:anyone` entry.
    pub fn open_acl(self) -> Self {
        self.int(1).int(PERM_ALL).string("world").string("anyone")
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], RegistryError> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.data.len()).ok_or_else(|| {
            RegistryError::Codec(format!("truncated zookeeper record at byte {}", self.pos))
        })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn int(&mut self) -> Result<i32, RegistryError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn long(&mut self) -> Result<i64, RegistryError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn buffer(&mut self) -> Result<Vec<u8>, RegistryError> {
        let len = self.int()?;
        if len < 0 {
            return Ok(Vec::new());
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub fn string(&mut self) -> Result<String, RegistryError> {
        String::from_utf8(self.buffer()?)
            .map_err(|e| RegistryError::Codec(format!("non-utf8 zookeeper string: {}", e)))
    }

    pub fn strings(&mut self) -> Result<Vec<String>, RegistryError> {
        let count = self.int()?;
        (0..count.max(0)).map(|_| self.string()).collect()
    }

    pub fn stat(&mut self) -> Result<Stat, RegistryError> {
        let _czxid = self.long()?;
        let _mzxid = self.long()?;
        let _ctime = self.long()?;
        let _mtime = self.long()?;
        let version = self.int()?;
        let _cversion = self.int()?;
        let _aversion = self.int()?;
        let ephemeral_owner = self.long()?;
        let _data_length = self.int()?;
        let _num_children = self.int()?;
        let _pzxid = self.long()?;
        Ok(Stat {
            version,
            ephemeral_owner,
        })
    }
}

/// The parts of a znode's `Stat` the backend looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub version: i32,
    /// Owning session for ephemeral nodes, 0 otherwise
    pub ephemeral_owner: i64,
}
