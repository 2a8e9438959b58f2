//! Client side of the gateway protocol.
//!
//! Each call opens a fresh connection, since the gateway serves one request
//! per connection. Error frames from the gateway become errors rendered as
//! `"<short>: <detail>"`.

use anyhow::{bail, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::protocol::{
    read_message, write_message, CatRequest, CopyRequest, DeleteRequest, ListRequest, Message,
    MessageType, ObsoleteRequest, PutRequest, UntrashifyRequest,
};
use crate::storage::ObjectInfo;

/// Payload bytes per CopyData frame sent by `put`.
pub const PUT_CHUNK_SIZE: usize = 128 * 1024;

/// Read the next frame, turning an Error frame into an error.
async fn next<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Message> {
    match read_message(stream).await? {
        Message::Error(err) => bail!("{err}"),
        msg => Ok(msg),
    }
}

async fn expect<S: AsyncRead + Unpin>(stream: &mut S, kind: MessageType) -> Result<Message> {
    let msg = next(stream).await?;
    if msg.message_type() != kind {
        bail!("expected {kind}, got {}", msg.message_type());
    }
    Ok(msg)
}

/// Wait for the CommandComplete + ReadyForQuery closing sequence.
pub async fn expect_complete<S: AsyncRead + Unpin>(stream: &mut S) -> Result<()> {
    expect(stream, MessageType::CommandComplete).await?;
    expect(stream, MessageType::ReadyForQuery).await?;
    Ok(())
}

/// Send a CatV2 and copy the raw object bytes into `out`.
pub async fn cat_on<S, W>(stream: &mut S, req: CatRequest, out: &mut W) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    write_message(stream, &Message::CatV2(req)).await?;
    let n = tokio::io::copy(stream, out).await?;
    out.flush().await?;
    Ok(n)
}

/// Send a PutV3 followed by `data` as CopyData frames. Returns the key
/// version reported by the gateway.
pub async fn put_on<S, R>(stream: &mut S, req: PutRequest, data: &mut R) -> Result<u16>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    write_message(stream, &Message::PutV3(req)).await?;

    let mut buf = vec![0u8; PUT_CHUNK_SIZE];
    loop {
        let n = data.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_message(stream, &Message::CopyData(Bytes::copy_from_slice(&buf[..n]))).await?;
    }
    write_message(stream, &Message::CommandComplete).await?;

    let Message::PutComplete { key_version } = expect(stream, MessageType::PutComplete).await?
    else {
        bail!("expected put completion");
    };
    expect(stream, MessageType::ReadyForQuery).await?;
    Ok(key_version)
}

pub async fn list_on<S>(stream: &mut S, req: ListRequest) -> Result<Vec<ObjectInfo>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &Message::ListV2(req)).await?;
    let mut objects = Vec::new();
    loop {
        match next(stream).await? {
            Message::ObjectMeta(batch) => objects.extend(batch),
            Message::ReadyForQuery => return Ok(objects),
            other => bail!("unexpected {} in listing", other.message_type()),
        }
    }
}

/// Send a request whose reply is CommandComplete + ReadyForQuery.
pub async fn command_on<S>(stream: &mut S, msg: Message) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &msg).await?;
    expect_complete(stream).await
}

pub async fn copy_on<S>(stream: &mut S, req: CopyRequest) -> Result<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &Message::CopyV2(req)).await?;
    let Message::CopyComplete { key_version } = expect(stream, MessageType::CopyComplete).await?
    else {
        bail!("expected copy completion");
    };
    expect(stream, MessageType::ReadyForQuery).await?;
    Ok(key_version)
}

pub async fn gool_on<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &Message::Gool).await?;
    expect(stream, MessageType::ReadyForQuery).await?;
    Ok(())
}

/// Client bound to a gateway socket.
#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
}

impl Client {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path).await.map_err(|e| {
            anyhow::anyhow!("cannot connect to {}: {e}", self.socket_path.display())
        })
    }

    pub async fn cat<W: AsyncWrite + Unpin>(&self, req: CatRequest, out: &mut W) -> Result<u64> {
        cat_on(&mut self.connect().await?, req, out).await
    }

    pub async fn put<R: AsyncRead + Unpin>(&self, req: PutRequest, data: &mut R) -> Result<u16> {
        put_on(&mut self.connect().await?, req, data).await
    }

    pub async fn list(&self, req: ListRequest) -> Result<Vec<ObjectInfo>> {
        list_on(&mut self.connect().await?, req).await
    }

    pub async fn copy(&self, req: CopyRequest) -> Result<u8> {
        copy_on(&mut self.connect().await?, req).await
    }

    pub async fn delete(&self, req: DeleteRequest) -> Result<()> {
        command_on(&mut self.connect().await?, Message::Delete(req)).await
    }

    pub async fn untrashify(&self, req: UntrashifyRequest) -> Result<()> {
        command_on(&mut self.connect().await?, Message::Untrashify(req)).await
    }

    pub async fn collect_obsolete(&self, req: ObsoleteRequest) -> Result<()> {
        command_on(&mut self.connect().await?, Message::CollectObsolete(req)).await
    }

    pub async fn delete_obsolete(&self, req: ObsoleteRequest) -> Result<()> {
        command_on(&mut self.connect().await?, Message::DeleteObsolete(req)).await
    }

    pub async fn gool(&self) -> Result<()> {
        gool_on(&mut self.connect().await?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorMessage;

    #[tokio::test]
    async fn test_error_frame_is_rendered() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let serve = tokio::spawn(async move {
            let _ = read_message(&mut server).await.unwrap();
            let reply = Message::Error(ErrorMessage::new("configuration error", "no crypter"));
            write_message(&mut server, &reply).await.unwrap();
        });

        let err = gool_on(&mut client).await.unwrap_err();
        assert_eq!(err.to_string(), "configuration error: no crypter");
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_listing_collects_batches() {
        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        let serve = tokio::spawn(async move {
            let req = read_message(&mut server).await.unwrap();
            assert_eq!(req.message_type(), MessageType::ListV2);
            for batch in [
                vec![ObjectInfo::new("a", 1)],
                vec![ObjectInfo::new("b", 2), ObjectInfo::new("c", 3)],
            ] {
                write_message(&mut server, &Message::ObjectMeta(batch))
                    .await
                    .unwrap();
            }
            write_message(&mut server, &Message::ReadyForQuery)
                .await
                .unwrap();
        });

        let objects = list_on(&mut client, ListRequest::default()).await.unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[2], ObjectInfo::new("c", 3));
        serve.await.unwrap();
    }
}
