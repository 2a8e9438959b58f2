//! Gateway wire protocol.
//!
//! Two layers: [`frame`] turns a byte stream into length-delimited bodies,
//! [`message`] turns bodies into typed [`Message`]s. The dispatcher only ever
//! talks in `Message`s; the frame layer has no knowledge of semantics.

pub mod frame;
pub mod message;

pub use frame::{encode_frame, read_frame, write_frame, LENGTH_PREFIX, MAX_FRAME_SIZE};
pub use message::{
    find_setting, object_meta_batches, CatRequest, CopyFlags, CopyRequest, DeleteRequest,
    ErrorMessage, ListRequest, Message, MessageType, ObsoleteRequest, PatchRequest, PutRequest,
    Setting, UntrashifyRequest, OBJECT_META_BATCH, SETTING_MULTIPART_CHUNK_SIZE,
    SETTING_MULTIPART_UPLOAD, SETTING_STORAGE_CLASS, SETTING_TABLESPACE,
};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Read one frame and decode it.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message> {
    let body = read_frame(r).await?;
    Message::decode(body)
}

/// Encode and write one message.
pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<()> {
    write_frame(w, &msg.encode()).await
}
