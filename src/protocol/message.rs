//! Typed gateway messages.
//!
//! Body layout shared by every message: `tag:u8 | flag1:u8 | flag2:u8 | flag3:u8 | fields`.
//! Strings are NUL-terminated UTF-8, integers are big-endian, and a settings
//! block is `count:u64` followed by `count` (name, value) string pairs.
//!
//! Legacy and current versions of a request use different tags, so the tag
//! alone determines the field layout.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::frame::encode_frame;
use crate::error::{GatewayError, Result};
use crate::storage::ObjectInfo;

/// Size of the tag plus flag bytes that open every body.
pub const HEADER_LEN: usize = 4;

/// Objects per ObjectMeta frame.
pub const OBJECT_META_BATCH: usize = 1000;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Cat = 42,
    Put = 43,
    CommandComplete = 44,
    ReadyForQuery = 45,
    CopyData = 46,
    Delete = 47,
    List = 48,
    ObjectMeta = 49,
    Patch = 50,
    Copy = 51,
    Gool = 52,
    PutV2 = 53,
    CatV2 = 54,
    Error = 55,
    PutV3 = 56,
    PutComplete = 57,
    Untrashify = 58,
    CopyV2 = 59,
    CopyComplete = 60,
    ListV2 = 61,
    CollectObsolete = 64,
    DeleteObsolete = 65,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            42 => Some(Self::Cat),
            43 => Some(Self::Put),
            44 => Some(Self::CommandComplete),
            45 => Some(Self::ReadyForQuery),
            46 => Some(Self::CopyData),
            47 => Some(Self::Delete),
            48 => Some(Self::List),
            49 => Some(Self::ObjectMeta),
            50 => Some(Self::Patch),
            51 => Some(Self::Copy),
            52 => Some(Self::Gool),
            53 => Some(Self::PutV2),
            54 => Some(Self::CatV2),
            55 => Some(Self::Error),
            56 => Some(Self::PutV3),
            57 => Some(Self::PutComplete),
            58 => Some(Self::Untrashify),
            59 => Some(Self::CopyV2),
            60 => Some(Self::CopyComplete),
            61 => Some(Self::ListV2),
            64 => Some(Self::CollectObsolete),
            65 => Some(Self::DeleteObsolete),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Cat => "CAT",
            Self::Put => "PUT",
            Self::CommandComplete => "COMMAND COMPLETE",
            Self::ReadyForQuery => "READY FOR QUERY",
            Self::CopyData => "COPY DATA",
            Self::Delete => "DELETE",
            Self::List => "LIST",
            Self::ObjectMeta => "OBJECT META",
            Self::Patch => "PATCH",
            Self::Copy => "COPY",
            Self::Gool => "GOOL",
            Self::PutV2 => "PUT V2",
            Self::CatV2 => "CAT V2",
            Self::Error => "ERROR",
            Self::PutV3 => "PUT V3",
            Self::PutComplete => "PUT COMPLETE",
            Self::Untrashify => "UNTRASHIFY",
            Self::CopyV2 => "COPY V2",
            Self::CopyComplete => "COPY COMPLETE",
            Self::ListV2 => "LIST V2",
            Self::CollectObsolete => "COLLECT OBSOLETE",
            Self::DeleteObsolete => "DELETE OBSOLETE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Copy Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CopyFlags: u8 {
        const ENCRYPT = 1 << 0;
        const DECRYPT = 1 << 1;
        const USE_KEK = 1 << 2;
        /// Require a backend-native copy instead of streaming.
        const SERVER_SIDE = 1 << 3;
    }
}

// =============================================================================
// Settings
// =============================================================================

pub const SETTING_STORAGE_CLASS: &str = "StorageClass";
pub const SETTING_TABLESPACE: &str = "Tablespace";
pub const SETTING_MULTIPART_CHUNK_SIZE: &str = "MultipartChunksize";
pub const SETTING_MULTIPART_UPLOAD: &str = "MultipartUpload";

/// A free-form backend setting. Names are case-sensitive; unknown names are
/// passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub name: String,
    pub value: String,
}

impl Setting {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// First value for `name`, if present.
pub fn find_setting<'a>(settings: &'a [Setting], name: &str) -> Option<&'a str> {
    settings
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.value.as_str())
}

// =============================================================================
// Request Bodies
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatRequest {
    pub name: String,
    pub decrypt: bool,
    /// Decrypt with the alternate key (not carried by legacy Cat).
    pub use_kek: bool,
    pub offset: u64,
    pub settings: Vec<Setting>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PutRequest {
    pub name: String,
    pub encrypt: bool,
    pub settings: Vec<Setting>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListRequest {
    pub prefix: String,
    pub settings: Vec<Setting>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CopyRequest {
    pub name: String,
    /// Path of the source installation's config file.
    pub source_config: String,
    pub port: u64,
    pub confirm: bool,
    pub flags: CopyFlags,
}

impl CopyRequest {
    pub fn encrypt(&self) -> bool {
        self.flags.contains(CopyFlags::ENCRYPT)
    }

    pub fn decrypt(&self) -> bool {
        self.flags.contains(CopyFlags::DECRYPT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteRequest {
    pub name: String,
    pub port: u64,
    pub segnum: u64,
    pub confirm: bool,
    /// Treat `name` as a prefix and collect garbage under it.
    pub garbage: bool,
    /// Delete permanently instead of moving to trash.
    pub crazy_drop: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UntrashifyRequest {
    pub name: String,
    pub segnum: u64,
    pub confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObsoleteRequest {
    pub segnum: u64,
    pub port: u64,
    pub database: String,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchRequest {
    pub name: String,
    pub offset: u64,
    pub encrypt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorMessage {
    pub message: String,
    pub detail: String,
}

impl ErrorMessage {
    pub fn new(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.message, self.detail)
    }
}

impl From<&GatewayError> for ErrorMessage {
    fn from(err: &GatewayError) -> Self {
        let (message, detail) = err.error_frame();
        Self::new(message, detail)
    }
}

// =============================================================================
// Message
// =============================================================================

/// Every message that can travel over a gateway connection.
///
/// Legacy variants (`Cat`, `Put`, `List`, `Copy`) share their request struct
/// with the current ones; fields the legacy layout cannot carry are dropped
/// on encode and defaulted on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Cat(CatRequest),
    CatV2(CatRequest),
    Put(PutRequest),
    PutV2(PutRequest),
    PutV3(PutRequest),
    List(ListRequest),
    ListV2(ListRequest),
    Copy(CopyRequest),
    CopyV2(CopyRequest),
    Delete(DeleteRequest),
    Untrashify(UntrashifyRequest),
    CollectObsolete(ObsoleteRequest),
    DeleteObsolete(ObsoleteRequest),
    Patch(PatchRequest),
    Gool,
    CopyData(Bytes),
    CommandComplete,
    ReadyForQuery,
    ObjectMeta(Vec<ObjectInfo>),
    Error(ErrorMessage),
    PutComplete { key_version: u16 },
    CopyComplete { key_version: u8 },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Cat(_) => MessageType::Cat,
            Self::CatV2(_) => MessageType::CatV2,
            Self::Put(_) => MessageType::Put,
            Self::PutV2(_) => MessageType::PutV2,
            Self::PutV3(_) => MessageType::PutV3,
            Self::List(_) => MessageType::List,
            Self::ListV2(_) => MessageType::ListV2,
            Self::Copy(_) => MessageType::Copy,
            Self::CopyV2(_) => MessageType::CopyV2,
            Self::Delete(_) => MessageType::Delete,
            Self::Untrashify(_) => MessageType::Untrashify,
            Self::CollectObsolete(_) => MessageType::CollectObsolete,
            Self::DeleteObsolete(_) => MessageType::DeleteObsolete,
            Self::Patch(_) => MessageType::Patch,
            Self::Gool => MessageType::Gool,
            Self::CopyData(_) => MessageType::CopyData,
            Self::CommandComplete => MessageType::CommandComplete,
            Self::ReadyForQuery => MessageType::ReadyForQuery,
            Self::ObjectMeta(_) => MessageType::ObjectMeta,
            Self::Error(_) => MessageType::Error,
            Self::PutComplete { .. } => MessageType::PutComplete,
            Self::CopyComplete { .. } => MessageType::CopyComplete,
        }
    }

    /// Encode as a complete frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        encode_frame(&self.encode_body())
    }

    /// Encode the frame body (tag, flags, fields).
    pub fn encode_body(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        let tag = self.message_type() as u8;

        match self {
            Self::Cat(req) => {
                put_header(&mut buf, tag, [req.decrypt as u8, 0, 0]);
                put_cstring(&mut buf, &req.name);
                buf.put_u64(req.offset);
            }
            Self::CatV2(req) => {
                put_header(&mut buf, tag, [req.decrypt as u8, req.use_kek as u8, 0]);
                put_cstring(&mut buf, &req.name);
                buf.put_u64(req.offset);
                put_settings(&mut buf, &req.settings);
            }
            Self::Put(req) => {
                put_header(&mut buf, tag, [req.encrypt as u8, 0, 0]);
                put_cstring(&mut buf, &req.name);
            }
            Self::PutV2(req) | Self::PutV3(req) => {
                put_header(&mut buf, tag, [req.encrypt as u8, 0, 0]);
                put_cstring(&mut buf, &req.name);
                put_settings(&mut buf, &req.settings);
            }
            Self::List(req) => {
                put_header(&mut buf, tag, [0; 3]);
                put_cstring(&mut buf, &req.prefix);
            }
            Self::ListV2(req) => {
                put_header(&mut buf, tag, [0; 3]);
                put_cstring(&mut buf, &req.prefix);
                put_settings(&mut buf, &req.settings);
            }
            Self::Copy(req) => {
                put_header(
                    &mut buf,
                    tag,
                    [req.encrypt() as u8, req.decrypt() as u8, req.confirm as u8],
                );
                put_cstring(&mut buf, &req.name);
                put_cstring(&mut buf, &req.source_config);
                buf.put_u64(req.port);
            }
            Self::CopyV2(req) => {
                put_header(&mut buf, tag, [req.flags.bits(), req.confirm as u8, 0]);
                put_cstring(&mut buf, &req.name);
                put_cstring(&mut buf, &req.source_config);
                buf.put_u64(req.port);
            }
            Self::Delete(req) => {
                put_header(
                    &mut buf,
                    tag,
                    [req.confirm as u8, req.garbage as u8, req.crazy_drop as u8],
                );
                put_cstring(&mut buf, &req.name);
                buf.put_u64(req.port);
                buf.put_u64(req.segnum);
            }
            Self::Untrashify(req) => {
                put_header(&mut buf, tag, [req.confirm as u8, 0, 0]);
                put_cstring(&mut buf, &req.name);
                buf.put_u64(req.segnum);
            }
            Self::CollectObsolete(req) | Self::DeleteObsolete(req) => {
                put_header(&mut buf, tag, [0; 3]);
                buf.put_u64(req.segnum);
                buf.put_u64(req.port);
                put_cstring(&mut buf, &req.database);
                put_cstring(&mut buf, &req.prefix);
            }
            Self::Patch(req) => {
                put_header(&mut buf, tag, [req.encrypt as u8, 0, 0]);
                put_cstring(&mut buf, &req.name);
                buf.put_u64(req.offset);
            }
            Self::CopyData(data) => {
                put_header(&mut buf, tag, [0; 3]);
                buf.put_u64(data.len() as u64);
                buf.put_slice(data);
            }
            Self::Gool | Self::CommandComplete | Self::ReadyForQuery => {
                put_header(&mut buf, tag, [0; 3]);
            }
            Self::ObjectMeta(objects) => {
                put_header(&mut buf, tag, [0; 3]);
                buf.put_u64(objects.len() as u64);
                for obj in objects {
                    put_cstring(&mut buf, &obj.path);
                    buf.put_u64(obj.size);
                }
            }
            Self::Error(err) => {
                put_header(&mut buf, tag, [0; 3]);
                put_cstring(&mut buf, &err.message);
                put_cstring(&mut buf, &err.detail);
            }
            Self::PutComplete { key_version } => {
                put_header(&mut buf, tag, [0; 3]);
                buf.put_u16(*key_version);
            }
            Self::CopyComplete { key_version } => {
                put_header(&mut buf, tag, [*key_version, 0, 0]);
            }
        }

        buf
    }

    /// Decode a frame body. Never panics: every out-of-range read is reported
    /// as `MalformedMessage`, an unknown tag as a protocol error.
    pub fn decode(body: Bytes) -> Result<Self> {
        let Some(&tag) = body.first() else {
            return Err(GatewayError::malformed("empty message body"));
        };
        let msg_type = MessageType::from_u8(tag)
            .ok_or_else(|| GatewayError::protocol(format!("unknown message type {tag}")))?;

        let mut r = FieldReader::new(body, msg_type)?;
        let [f1, f2, f3] = r.flags;

        let msg = match msg_type {
            MessageType::Cat => Self::Cat(CatRequest {
                name: r.cstring("name")?,
                decrypt: f1 != 0,
                use_kek: false,
                offset: r.u64("offset")?,
                settings: Vec::new(),
            }),
            MessageType::CatV2 => Self::CatV2(CatRequest {
                name: r.cstring("name")?,
                decrypt: f1 != 0,
                use_kek: f2 != 0,
                offset: r.u64("offset")?,
                settings: r.settings()?,
            }),
            MessageType::Put => Self::Put(PutRequest {
                name: r.cstring("name")?,
                encrypt: f1 != 0,
                settings: Vec::new(),
            }),
            MessageType::PutV2 | MessageType::PutV3 => {
                let req = PutRequest {
                    name: r.cstring("name")?,
                    encrypt: f1 != 0,
                    settings: r.settings()?,
                };
                if msg_type == MessageType::PutV2 {
                    Self::PutV2(req)
                } else {
                    Self::PutV3(req)
                }
            }
            MessageType::List => Self::List(ListRequest {
                prefix: r.cstring("prefix")?,
                settings: Vec::new(),
            }),
            MessageType::ListV2 => Self::ListV2(ListRequest {
                prefix: r.cstring("prefix")?,
                settings: r.settings()?,
            }),
            MessageType::Copy => {
                let mut flags = CopyFlags::empty();
                flags.set(CopyFlags::ENCRYPT, f1 != 0);
                flags.set(CopyFlags::DECRYPT, f2 != 0);
                Self::Copy(CopyRequest {
                    name: r.cstring("name")?,
                    source_config: r.cstring("source config")?,
                    port: r.u64("port")?,
                    confirm: f3 != 0,
                    flags,
                })
            }
            MessageType::CopyV2 => Self::CopyV2(CopyRequest {
                name: r.cstring("name")?,
                source_config: r.cstring("source config")?,
                port: r.u64("port")?,
                confirm: f2 != 0,
                flags: CopyFlags::from_bits_truncate(f1),
            }),
            MessageType::Delete => Self::Delete(DeleteRequest {
                name: r.cstring("name")?,
                port: r.u64("port")?,
                segnum: r.u64("segment")?,
                confirm: f1 != 0,
                garbage: f2 != 0,
                crazy_drop: f3 != 0,
            }),
            MessageType::Untrashify => Self::Untrashify(UntrashifyRequest {
                name: r.cstring("name")?,
                segnum: r.u64("segment")?,
                confirm: f1 != 0,
            }),
            MessageType::CollectObsolete | MessageType::DeleteObsolete => {
                let req = ObsoleteRequest {
                    segnum: r.u64("segment")?,
                    port: r.u64("port")?,
                    database: r.cstring("database")?,
                    prefix: r.cstring("prefix")?,
                };
                if msg_type == MessageType::CollectObsolete {
                    Self::CollectObsolete(req)
                } else {
                    Self::DeleteObsolete(req)
                }
            }
            MessageType::Patch => Self::Patch(PatchRequest {
                name: r.cstring("name")?,
                offset: r.u64("offset")?,
                encrypt: f1 != 0,
            }),
            MessageType::Gool => Self::Gool,
            MessageType::CommandComplete => Self::CommandComplete,
            MessageType::ReadyForQuery => Self::ReadyForQuery,
            MessageType::CopyData => {
                let size = r.u64("size")?;
                let data = r.rest();
                if data.len() as u64 != size {
                    return Err(GatewayError::malformed(format!(
                        "COPY DATA declares {size} bytes but carries {}",
                        data.len()
                    )));
                }
                Self::CopyData(data)
            }
            MessageType::ObjectMeta => {
                // Each entry needs at least a terminator and a size.
                let count = r.count("object count", 9)?;
                let mut objects = Vec::with_capacity(count);
                for _ in 0..count {
                    let path = r.cstring("object path")?;
                    let size = r.u64("object size")?;
                    objects.push(ObjectInfo { path, size });
                }
                Self::ObjectMeta(objects)
            }
            MessageType::Error => Self::Error(ErrorMessage {
                message: r.cstring("message")?,
                detail: r.cstring("detail")?,
            }),
            MessageType::PutComplete => Self::PutComplete {
                key_version: r.u16("key version")?,
            },
            MessageType::CopyComplete => Self::CopyComplete { key_version: f1 },
        };

        Ok(msg)
    }
}

/// Split a listing into ObjectMeta frames of at most [`OBJECT_META_BATCH`]
/// objects, also keeping each frame under the maximum frame size.
pub fn object_meta_batches(objects: Vec<ObjectInfo>) -> Vec<Message> {
    let budget = (super::frame::MAX_FRAME_SIZE - super::frame::LENGTH_PREFIX) as usize
        - HEADER_LEN
        - 8;

    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;

    for obj in objects {
        let entry_bytes = obj.path.len() + 1 + 8;
        if !current.is_empty()
            && (current.len() == OBJECT_META_BATCH || current_bytes + entry_bytes > budget)
        {
            batches.push(Message::ObjectMeta(std::mem::take(&mut current)));
            current_bytes = 0;
        }
        current_bytes += entry_bytes;
        current.push(obj);
    }
    if !current.is_empty() {
        batches.push(Message::ObjectMeta(current));
    }

    batches
}

// =============================================================================
// Wire helpers
// =============================================================================

fn put_header(buf: &mut BytesMut, tag: u8, flags: [u8; 3]) {
    buf.put_u8(tag);
    buf.put_slice(&flags);
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_settings(buf: &mut BytesMut, settings: &[Setting]) {
    buf.put_u64(settings.len() as u64);
    for setting in settings {
        put_cstring(buf, &setting.name);
        put_cstring(buf, &setting.value);
    }
}

/// Bounds-checked cursor over a message body.
struct FieldReader {
    buf: Bytes,
    msg_type: MessageType,
    flags: [u8; 3],
}

impl FieldReader {
    fn new(mut buf: Bytes, msg_type: MessageType) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(GatewayError::malformed(format!(
                "{msg_type} header truncated"
            )));
        }
        buf.advance(1);
        let flags = [buf.get_u8(), buf.get_u8(), buf.get_u8()];
        Ok(Self {
            buf,
            msg_type,
            flags,
        })
    }

    fn truncated(&self, field: &str) -> GatewayError {
        GatewayError::malformed(format!("{} {} truncated", self.msg_type, field))
    }

    fn u16(&mut self, field: &str) -> Result<u16> {
        if self.buf.remaining() < 2 {
            return Err(self.truncated(field));
        }
        Ok(self.buf.get_u16())
    }

    fn u64(&mut self, field: &str) -> Result<u64> {
        if self.buf.remaining() < 8 {
            return Err(self.truncated(field));
        }
        Ok(self.buf.get_u64())
    }

    /// Read an element count and reject counts the remaining bytes cannot
    /// possibly hold, so a hostile count never drives a huge allocation.
    fn count(&mut self, field: &str, min_entry_len: usize) -> Result<usize> {
        let count = self.u64(field)?;
        let max = (self.buf.remaining() / min_entry_len) as u64;
        if count > max {
            return Err(GatewayError::malformed(format!(
                "{} {} {} exceeds remaining payload",
                self.msg_type, field, count
            )));
        }
        Ok(count as usize)
    }

    fn cstring(&mut self, field: &str) -> Result<String> {
        let Some(end) = self.buf.iter().position(|&b| b == 0) else {
            return Err(GatewayError::malformed(format!(
                "{} {} is not NUL-terminated",
                self.msg_type, field
            )));
        };
        let raw = self.buf.split_to(end);
        self.buf.advance(1);
        String::from_utf8(raw.to_vec()).map_err(|_| {
            GatewayError::malformed(format!("invalid UTF-8 in {} {}", self.msg_type, field))
        })
    }

    fn settings(&mut self) -> Result<Vec<Setting>> {
        // Two terminators per pair at minimum.
        let count = self.count("settings count", 2)?;
        let mut settings = Vec::with_capacity(count);
        for _ in 0..count {
            let name = self.cstring("setting name")?;
            let value = self.cstring("setting value")?;
            settings.push(Setting { name, value });
        }
        Ok(settings)
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }
}
