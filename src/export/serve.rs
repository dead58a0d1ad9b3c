// export/serve.rs
//
// Per-connection NBD serving: fixed-newstyle negotiation followed by the
// transmission loop against an export backend.

use crate::export::backend::ExportBackend;
use crate::export::error::ExportError;
use crate::export::include::ExportEntry;
use crate::export::wire::*;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Live export table shared between the reload path and connections.
pub type ExportTable = Arc<RwLock<HashMap<String, ExportEntry>>>;

/// Serves one client connection to completion.
pub async fn handle_connection<S>(mut stream: S, exports: ExportTable) -> Result<(), ExportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Greeting: NBDMAGIC, IHAVEOPT, handshake flags.
    stream.write_all(&NBDMAGIC.to_be_bytes()).await?;
    stream.write_all(&IHAVEOPT.to_be_bytes()).await?;
    stream
        .write_all(&(FLAG_FIXED_NEWSTYLE | FLAG_NO_ZEROES).to_be_bytes())
        .await?;
    stream.flush().await?;

    let client_flags = stream.read_u32().await?;
    if client_flags & CLIENT_FLAG_FIXED_NEWSTYLE == 0 {
        return Err(ExportError::Protocol(
            "client does not speak fixed newstyle".into(),
        ));
    }
    let no_zeroes = client_flags & CLIENT_FLAG_NO_ZEROES != 0;

    // Option haggling until GO/EXPORT_NAME hands us an export.
    let backend = loop {
        let magic = stream.read_u64().await?;
        if magic != IHAVEOPT {
            return Err(ExportError::Protocol(format!(
                "bad option magic {:#x}",
                magic
            )));
        }
        let option = stream.read_u32().await?;
        let length = stream.read_u32().await?;
        if length > MAX_PAYLOAD {
            return Err(ExportError::Protocol("oversized option payload".into()));
        }
        let mut payload = vec![0u8; length as usize];
        stream.read_exact(&mut payload).await?;

        match option {
            OPT_ABORT => {
                send_option_reply(&mut stream, option, REP_ACK, &[]).await?;
                stream.flush().await?;
                return Ok(());
            }
            OPT_LIST => {
                let names: Vec<String> = exports.read().keys().cloned().collect();
                for name in names {
                    let mut body = (name.len() as u32).to_be_bytes().to_vec();
                    body.extend_from_slice(name.as_bytes());
                    send_option_reply(&mut stream, option, REP_SERVER, &body).await?;
                }
                send_option_reply(&mut stream, option, REP_ACK, &[]).await?;
            }
            OPT_GO | OPT_INFO => {
                if payload.len() < 4 {
                    send_option_reply(&mut stream, option, REP_ERR_UNKNOWN, &[]).await?;
                    continue;
                }
                let name_len = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as usize;
                if payload.len() < 4 + name_len + 2 {
                    send_option_reply(&mut stream, option, REP_ERR_UNKNOWN, &[]).await?;
                    continue;
                }
                let Ok(name) = std::str::from_utf8(&payload[4..4 + name_len]) else {
                    send_option_reply(&mut stream, option, REP_ERR_UNKNOWN, &[]).await?;
                    continue;
                };

                let entry = exports.read().get(name).cloned();
                let Some(entry) = entry else {
                    debug!("client asked for unknown export '{}'", name);
                    send_option_reply(&mut stream, option, REP_ERR_UNKNOWN, &[]).await?;
                    continue;
                };

                let backend = match ExportBackend::open(&entry).await {
                    Ok(backend) => backend,
                    Err(e) => {
                        warn!("cannot open backing for export '{}': {}", name, e);
                        send_option_reply(&mut stream, option, REP_ERR_UNKNOWN, &[]).await?;
                        continue;
                    }
                };

                // NBD_INFO_EXPORT: size and transmission flags.
                let mut info = Vec::with_capacity(12);
                info.extend_from_slice(&INFO_EXPORT.to_be_bytes());
                info.extend_from_slice(&backend.size().to_be_bytes());
                info.extend_from_slice(&transmission_flags(&backend).to_be_bytes());
                send_option_reply(&mut stream, option, REP_INFO, &info).await?;
                send_option_reply(&mut stream, option, REP_ACK, &[]).await?;
                stream.flush().await?;

                if option == OPT_GO {
                    info!("export '{}' attached ({} bytes)", name, backend.size());
                    break backend;
                }
            }
            OPT_EXPORT_NAME => {
                // Old-style attach: no error path exists, a miss just
                // drops the connection.
                let Ok(name) = std::str::from_utf8(&payload) else {
                    return Err(ExportError::Protocol("non-UTF-8 export name".into()));
                };
                let entry = exports.read().get(name).cloned();
                let Some(entry) = entry else {
                    return Err(ExportError::NotFound(name.to_string()));
                };
                let backend = ExportBackend::open(&entry).await?;

                stream.write_all(&backend.size().to_be_bytes()).await?;
                stream
                    .write_all(&transmission_flags(&backend).to_be_bytes())
                    .await?;
                if !no_zeroes {
                    stream.write_all(&[0u8; 124]).await?;
                }
                stream.flush().await?;
                info!("export '{}' attached ({} bytes)", name, backend.size());
                break backend;
            }
            other => {
                debug!("unsupported option {}", other);
                send_option_reply(&mut stream, other, REP_ERR_UNSUP, &[]).await?;
            }
        }
        stream.flush().await?;
    };

    transmission_loop(&mut stream, &backend).await
}

fn transmission_flags(backend: &ExportBackend) -> u16 {
    let mut flags = TRANSMISSION_HAS_FLAGS
        | TRANSMISSION_SEND_FLUSH
        | TRANSMISSION_SEND_TRIM
        | TRANSMISSION_SEND_WRITE_ZEROES;
    if backend.read_only() {
        flags |= TRANSMISSION_READ_ONLY;
    }
    flags
}

async fn send_option_reply<S>(
    stream: &mut S,
    option: u32,
    reply: u32,
    body: &[u8],
) -> Result<(), ExportError>
where
    S: AsyncWrite + Unpin + Send,
{
    stream.write_all(&OPTION_REPLY_MAGIC.to_be_bytes()).await?;
    stream.write_all(&option.to_be_bytes()).await?;
    stream.write_all(&reply.to_be_bytes()).await?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

async fn transmission_loop<S>(stream: &mut S, backend: &ExportBackend) -> Result<(), ExportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let size = backend.size();

    loop {
        let mut raw = [0u8; Request::WIRE_LEN];
        if stream.read_exact(&mut raw).await.is_err() {
            // Peer went away without DISC; treat as disconnect.
            return Ok(());
        }
        let Some(request) = Request::decode(&raw) else {
            return Err(ExportError::Protocol("bad request magic".into()));
        };

        match request.command {
            CMD_DISC => {
                debug!("client disconnected cleanly");
                return Ok(());
            }
            CMD_READ => {
                if !range_ok(size, request.offset, request.length)
                    || request.length > MAX_PAYLOAD
                {
                    send_simple_reply(stream, request.handle, EINVAL, &[]).await?;
                    continue;
                }
                let mut buf = vec![0u8; request.length as usize];
                match backend.read_at(request.offset, &mut buf).await {
                    Ok(()) => send_simple_reply(stream, request.handle, EOK, &buf).await?,
                    Err(e) => {
                        warn!("read failed at {}: {}", request.offset, e);
                        send_simple_reply(stream, request.handle, EIO, &[]).await?;
                    }
                }
            }
            CMD_WRITE => {
                if request.length > MAX_PAYLOAD {
                    return Err(ExportError::Protocol("oversized write".into()));
                }
                let mut data = vec![0u8; request.length as usize];
                stream.read_exact(&mut data).await?;

                if backend.read_only() {
                    send_simple_reply(stream, request.handle, EPERM, &[]).await?;
                    continue;
                }
                if !range_ok(size, request.offset, request.length) {
                    send_simple_reply(stream, request.handle, ENOSPC, &[]).await?;
                    continue;
                }
                match backend.write_at(request.offset, &data).await {
                    Ok(()) => send_simple_reply(stream, request.handle, EOK, &[]).await?,
                    Err(e) => {
                        warn!("write failed at {}: {}", request.offset, e);
                        send_simple_reply(stream, request.handle, EIO, &[]).await?;
                    }
                }
            }
            CMD_WRITE_ZEROES | CMD_TRIM => {
                if backend.read_only() {
                    send_simple_reply(stream, request.handle, EPERM, &[]).await?;
                    continue;
                }
                if !range_ok(size, request.offset, request.length) {
                    send_simple_reply(stream, request.handle, ENOSPC, &[]).await?;
                    continue;
                }
                match backend
                    .write_zeroes(request.offset, request.length as u64)
                    .await
                {
                    Ok(()) => send_simple_reply(stream, request.handle, EOK, &[]).await?,
                    Err(e) => {
                        warn!("write_zeroes failed at {}: {}", request.offset, e);
                        send_simple_reply(stream, request.handle, EIO, &[]).await?;
                    }
                }
            }
            CMD_FLUSH => match backend.flush().await {
                Ok(()) => send_simple_reply(stream, request.handle, EOK, &[]).await?,
                Err(e) => {
                    warn!("flush failed: {}", e);
                    send_simple_reply(stream, request.handle, EIO, &[]).await?;
                }
            },
            other => {
                debug!("unsupported command {}", other);
                send_simple_reply(stream, request.handle, EOPNOTSUPP, &[]).await?;
            }
        }
    }
}

fn range_ok(size: u64, offset: u64, length: u32) -> bool {
    offset
        .checked_add(length as u64)
        .map(|end| end <= size)
        .unwrap_or(false)
}

async fn send_simple_reply<S>(
    stream: &mut S,
    handle: u64,
    error: u32,
    data: &[u8],
) -> Result<(), ExportError>
where
    S: AsyncWrite + Unpin + Send,
{
    let reply = SimpleReply { error, handle };
    stream.write_all(&reply.encode()).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_handles_boundary_and_overflow() {
        assert!(range_ok(1024, 0, 1024));
        assert!(range_ok(1024, 1024, 0));
        assert!(!range_ok(1024, 1, 1024));
        assert!(!range_ok(1024, u64::MAX, 2));
    }
}
