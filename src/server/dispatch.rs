//! Per-connection request dispatch.
//!
//! One request per connection: read a frame, decode it, run the operation,
//! and write the closing sequence. Any failure before raw Cat bytes have
//! been written is reported with an Error frame, so a client is never left
//! with a connection that closes silently.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::protocol::{
    object_meta_batches, read_message, write_message, CatRequest, ErrorMessage, ListRequest,
    Message, PutRequest,
};
use crate::retention;
use crate::session::Session;
use crate::stream::reader::READ_CHUNK_SIZE;
use crate::stream::{pipe, ProgressWriter};

/// Path recorded in the session for observability.
fn request_path(msg: &Message) -> &str {
    match msg {
        Message::Cat(r) | Message::CatV2(r) => &r.name,
        Message::Put(r) | Message::PutV2(r) | Message::PutV3(r) => &r.name,
        Message::List(r) | Message::ListV2(r) => &r.prefix,
        Message::Copy(r) | Message::CopyV2(r) => &r.name,
        Message::Delete(r) => &r.name,
        Message::Untrashify(r) => &r.name,
        Message::CollectObsolete(r) | Message::DeleteObsolete(r) => &r.prefix,
        Message::Patch(r) => &r.name,
        _ => "",
    }
}

/// Wait for the request frame unless the gateway is shutting down first.
async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    shutdown: &CancellationToken,
) -> Result<Message> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(GatewayError::Cancelled),
        msg = read_message(reader) => msg,
    }
}

struct Connection<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    /// Raw (unframed) bytes have gone out; an Error frame would corrupt them.
    raw_written: bool,
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    async fn send(&mut self, msg: &Message) -> Result<()> {
        write_message(&mut self.writer, msg).await
    }

    async fn send_all(&mut self, msgs: &[Message]) -> Result<()> {
        for msg in msgs {
            self.send(msg).await?;
        }
        Ok(())
    }

    async fn write_raw(&mut self, buf: &[u8]) -> Result<()> {
        self.raw_written = true;
        self.writer.write_all(buf).await?;
        Ok(())
    }
}

/// Serve exactly one request on `stream`.
pub async fn serve_connection<S>(gw: Arc<Gateway>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let session = gw.registry.register();
    let (reader, writer) = tokio::io::split(stream);
    let mut conn = Connection {
        reader,
        writer,
        raw_written: false,
    };

    let result = match read_request(&mut conn.reader, &gw.shutdown).await {
        Ok(request) => {
            let kind = request.message_type();
            session.begin(kind, request_path(&request));
            tracing::debug!(session = %session.id(), op = %kind, path = %request_path(&request), "received client request");
            dispatch(&gw, &session.handle(), request, &mut conn).await
        }
        Err(err) => Err(err),
    };

    if let Err(err) = &result {
        tracing::error!(session = %session.id(), "request failed: {err}");
        if !conn.raw_written {
            let reply = Message::Error(ErrorMessage::from(err));
            if let Err(send_err) = conn.send(&reply).await {
                tracing::debug!(session = %session.id(), "could not deliver error frame: {send_err}");
            }
        }
    }
    let _ = conn.writer.shutdown().await;
    result
}

async fn dispatch<S: AsyncRead + AsyncWrite + Send>(
    gw: &Gateway,
    session: &Arc<Session>,
    request: Message,
    conn: &mut Connection<S>,
) -> Result<()> {
    let ok = [Message::CommandComplete, Message::ReadyForQuery];

    match request {
        Message::Cat(req) | Message::CatV2(req) => cat(gw, session, &req, conn).await,

        Message::Put(req) | Message::PutV2(req) => {
            put(gw, session, &req, conn).await?;
            conn.send_all(&ok).await
        }
        Message::PutV3(req) => {
            let key_version = put(gw, session, &req, conn).await?;
            conn.send_all(&[Message::PutComplete { key_version }, Message::ReadyForQuery])
                .await
        }

        Message::List(req) | Message::ListV2(req) => list(gw, &req, conn).await,

        Message::Copy(req) => {
            retention::copy_objects(gw, &req, Some(Arc::clone(session))).await?;
            conn.send_all(&ok).await
        }
        Message::CopyV2(req) => {
            retention::copy_objects(gw, &req, Some(Arc::clone(session))).await?;
            let key_version = gw
                .crypter
                .as_ref()
                .map(|c| c.key_version().min(u8::MAX as u16) as u8)
                .unwrap_or(0);
            conn.send_all(&[Message::CopyComplete { key_version }, Message::ReadyForQuery])
                .await
        }

        Message::Delete(req) => {
            if req.garbage {
                retention::delete_garbage(gw, &req).await?;
            } else {
                retention::delete_file(gw, &req).await?;
            }
            conn.send_all(&ok).await
        }
        Message::Untrashify(req) => {
            retention::untrashify(gw, &req).await?;
            conn.send_all(&ok).await
        }
        Message::CollectObsolete(req) => {
            retention::collect_obsolete(gw, &req).await?;
            conn.send_all(&ok).await
        }
        Message::DeleteObsolete(req) => {
            retention::delete_obsolete(gw, &req).await?;
            conn.send_all(&ok).await
        }

        Message::Gool => conn.send(&Message::ReadyForQuery).await,
        Message::Patch(_) => conn
            .send(&Message::Error(ErrorMessage::new(
                "unsupported",
                "patch is not supported",
            )))
            .await,

        other => Err(GatewayError::protocol(format!(
            "unexpected request type {}",
            other.message_type()
        ))),
    }
}

/// Stream an object to the client as raw bytes.
async fn cat<S: AsyncRead + AsyncWrite + Send>(
    gw: &Gateway,
    session: &Arc<Session>,
    req: &CatRequest,
    conn: &mut Connection<S>,
) -> Result<()> {
    let reader = gw
        .reader(Arc::clone(&gw.storage), &req.name, &req.settings)
        .with_session(Arc::clone(session));

    if !req.decrypt {
        let mut reader = reader.starting_at(req.offset);
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            conn.write_raw(&buf[..n]).await?;
        }
        conn.writer.flush().await?;
        return Ok(());
    }

    if req.use_kek {
        return Err(GatewayError::config(
            "decryption with the alternate key is not supported",
        ));
    }
    let crypter = gw.crypter()?;

    // Ciphertext cannot be entered mid-stream: decrypt from the start and
    // discard the plaintext before the requested offset.
    let (pipe, pump) = reader.into_pipe();
    let mut plain = crypter.decrypt(Box::new(pipe))?;
    if req.offset > 0 {
        let skipped =
            tokio::io::copy(&mut (&mut plain).take(req.offset), &mut tokio::io::sink()).await?;
        if skipped < req.offset {
            tracing::debug!(path = %req.name, skipped, offset = req.offset, "offset past end of object");
        }
    }

    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = plain.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        conn.write_raw(&buf[..n]).await?;
    }
    conn.writer.flush().await?;
    pump.await.map_err(io::Error::other)??;
    Ok(())
}

/// Receive CopyData frames until CommandComplete and store them. Returns the
/// key version the object was written with (0 for plaintext).
async fn put<S: AsyncRead + AsyncWrite + Send>(
    gw: &Gateway,
    session: &Arc<Session>,
    req: &PutRequest,
    conn: &mut Connection<S>,
) -> Result<u16> {
    let crypter = if req.encrypt {
        Some(gw.crypter()?)
    } else {
        None
    };

    let sink = gw.storage.write(&req.name, &req.settings).await?;
    let sink = match crypter {
        Some(crypter) => crypter.encrypt(sink)?,
        None => sink,
    };

    let (mut pipe_writer, mut pipe_reader) = pipe();
    let reader = &mut conn.reader;

    let producer = async move {
        loop {
            let err = match read_message(reader).await {
                Ok(Message::CopyData(data)) => match pipe_writer.write_all(&data).await {
                    Ok(()) => continue,
                    Err(err) => GatewayError::Io(err),
                },
                Ok(Message::CommandComplete) => {
                    return pipe_writer.shutdown().await.map_err(GatewayError::Io);
                }
                Ok(other) => GatewayError::protocol(format!(
                    "unexpected {} while receiving object data",
                    other.message_type()
                )),
                Err(err) => err,
            };
            pipe_writer.fail(io::Error::other(err.to_string())).await;
            return Err(err);
        }
    };

    let consumer = async {
        let mut dest =
            ProgressWriter::new(sink, Arc::clone(&gw.governor)).with_session(Arc::clone(session));
        let n = tokio::io::copy(&mut pipe_reader, &mut dest).await?;
        dest.shutdown().await?;
        Ok::<u64, GatewayError>(n)
    };

    let ((), bytes) = tokio::try_join!(producer, consumer)?;
    tracing::info!(path = %req.name, bytes, encrypted = req.encrypt, "object stored");

    Ok(crypter.map(|c| c.key_version()).unwrap_or(0))
}

async fn list<S: AsyncRead + AsyncWrite + Send>(
    gw: &Gateway,
    req: &ListRequest,
    conn: &mut Connection<S>,
) -> Result<()> {
    let objects = gw.storage.list(&req.prefix, &req.settings).await?;
    tracing::debug!(prefix = %req.prefix, count = objects.len(), "listed objects");

    for batch in object_meta_batches(objects) {
        conn.send(&batch).await?;
    }
    conn.send(&Message::ReadyForQuery).await
}

/// Interconnect ("motion") connections only carry liveness probes.
pub async fn serve_interconnect<S>(stream: S, shutdown: CancellationToken) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream;
    let result = match read_request(&mut stream, &shutdown).await {
        Ok(Message::Gool) => write_message(&mut stream, &Message::ReadyForQuery).await,
        Ok(other) => Err(GatewayError::protocol(format!(
            "unexpected {} on interconnect socket",
            other.message_type()
        ))),
        Err(err) => Err(err),
    };
    if let Err(err) = &result {
        tracing::warn!("interconnect request failed: {err}");
        let _ = write_message(&mut stream, &Message::Error(ErrorMessage::from(err))).await;
    }
    let _ = stream.shutdown().await;
    result
}
