// transport/nbd.rs
//
// Minimal NBD client: fixed-newstyle handshake with GO, simple replies.
// Each copy worker owns one client per side.

use crate::export::wire::*;
use crate::transport::endpoint::BlockEndpoint;
use crate::transport::error::TransportError;
use async_trait::async_trait;
use log::debug;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub struct NbdClient {
    stream: Box<dyn Stream>,
    size: u64,
    transmission_flags: u16,
    next_handle: u64,
    connected: bool,
}

impl NbdClient {
    /// Connects over TCP and attaches to `export`.
    pub async fn connect_tcp(addr: &str, export: &str) -> Result<NbdClient, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Self::handshake(Box::new(stream), export).await
    }

    /// Connects over a Unix socket and attaches to `export`.
    pub async fn connect_unix(socket: &Path, export: &str) -> Result<NbdClient, TransportError> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", socket.display(), e)))?;
        Self::handshake(Box::new(stream), export).await
    }

    async fn handshake(mut stream: Box<dyn Stream>, export: &str) -> Result<NbdClient, TransportError> {
        // Greeting.
        let magic = stream.read_u64().await?;
        if magic != NBDMAGIC {
            return Err(TransportError::Protocol(format!(
                "bad server magic {:#x}",
                magic
            )));
        }
        let opt_magic = stream.read_u64().await?;
        if opt_magic != IHAVEOPT {
            return Err(TransportError::Protocol("server is not newstyle".into()));
        }
        let handshake_flags = stream.read_u16().await?;
        if handshake_flags & FLAG_FIXED_NEWSTYLE == 0 {
            return Err(TransportError::Protocol(
                "server does not speak fixed newstyle".into(),
            ));
        }

        stream
            .write_all(&(CLIENT_FLAG_FIXED_NEWSTYLE | CLIENT_FLAG_NO_ZEROES).to_be_bytes())
            .await?;

        // OPT_GO with the export name and zero info requests.
        let mut payload = Vec::with_capacity(4 + export.len() + 2);
        payload.extend_from_slice(&(export.len() as u32).to_be_bytes());
        payload.extend_from_slice(export.as_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());

        stream.write_all(&IHAVEOPT.to_be_bytes()).await?;
        stream.write_all(&OPT_GO.to_be_bytes()).await?;
        stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;

        // Replies until ACK; INFO_EXPORT carries size and flags.
        let mut size = None;
        let mut transmission_flags = 0u16;
        loop {
            let reply_magic = stream.read_u64().await?;
            if reply_magic != OPTION_REPLY_MAGIC {
                return Err(TransportError::Protocol(format!(
                    "bad option reply magic {:#x}",
                    reply_magic
                )));
            }
            let _option = stream.read_u32().await?;
            let reply_type = stream.read_u32().await?;
            let length = stream.read_u32().await?;
            if length > MAX_PAYLOAD {
                return Err(TransportError::Protocol("oversized option reply".into()));
            }
            let mut body = vec![0u8; length as usize];
            stream.read_exact(&mut body).await?;

            if reply_type & REP_FLAG_ERROR != 0 {
                let message = String::from_utf8_lossy(&body).to_string();
                return Err(TransportError::Connect(format!(
                    "export attach refused ({}): {}",
                    reply_type & !REP_FLAG_ERROR,
                    message
                )));
            }
            match reply_type {
                REP_INFO => {
                    if body.len() >= 12 {
                        let info_type = u16::from_be_bytes(body[0..2].try_into().unwrap());
                        if info_type == INFO_EXPORT {
                            size = Some(u64::from_be_bytes(body[2..10].try_into().unwrap()));
                            transmission_flags =
                                u16::from_be_bytes(body[10..12].try_into().unwrap());
                        }
                    }
                }
                REP_ACK => break,
                other => debug!("ignoring option reply type {}", other),
            }
        }

        let size = size.ok_or_else(|| {
            TransportError::Protocol("server acknowledged GO without export info".into())
        })?;

        debug!(
            "attached to export '{}': {} bytes, flags {:#06x}",
            export, size, transmission_flags
        );

        Ok(NbdClient {
            stream,
            size,
            transmission_flags,
            next_handle: 1,
            connected: true,
        })
    }

    fn handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    async fn submit(
        &mut self,
        command: u16,
        offset: u64,
        length: u32,
        payload: Option<&[u8]>,
    ) -> Result<u64, TransportError> {
        let handle = self.handle();
        let request = Request {
            flags: 0,
            command,
            handle,
            offset,
            length,
        };
        self.stream.write_all(&request.encode()).await?;
        if let Some(payload) = payload {
            self.stream.write_all(payload).await?;
        }
        self.stream.flush().await?;
        Ok(handle)
    }

    async fn read_reply(&mut self, expected_handle: u64) -> Result<u32, TransportError> {
        let mut raw = [0u8; SimpleReply::WIRE_LEN];
        self.stream.read_exact(&mut raw).await?;
        let reply = SimpleReply::decode(&raw)
            .ok_or_else(|| TransportError::Protocol("bad reply magic".into()))?;
        if reply.handle != expected_handle {
            return Err(TransportError::Protocol(format!(
                "reply handle {} does not match request {}",
                reply.handle, expected_handle
            )));
        }
        Ok(reply.error)
    }
}

#[async_trait]
impl BlockEndpoint for NbdClient {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), TransportError> {
        let handle = self
            .submit(CMD_READ, offset, buf.len() as u32, None)
            .await?;
        let error = self.read_reply(handle).await?;
        if error != EOK {
            return Err(TransportError::Remote(error));
        }
        self.stream.read_exact(buf).await?;
        Ok(())
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), TransportError> {
        let handle = self
            .submit(CMD_WRITE, offset, data.len() as u32, Some(data))
            .await?;
        let error = self.read_reply(handle).await?;
        if error != EOK {
            return Err(TransportError::Remote(error));
        }
        Ok(())
    }

    async fn write_zeroes(&mut self, offset: u64, len: u64) -> Result<(), TransportError> {
        if self.transmission_flags & TRANSMISSION_SEND_WRITE_ZEROES == 0 {
            return Err(TransportError::ZeroUnsupported);
        }
        if len > u32::MAX as u64 {
            return Err(TransportError::Protocol("zero request too large".into()));
        }
        let handle = self.submit(CMD_WRITE_ZEROES, offset, len as u32, None).await?;
        let error = self.read_reply(handle).await?;
        match error {
            EOK => Ok(()),
            EOPNOTSUPP => Err(TransportError::ZeroUnsupported),
            other => Err(TransportError::Remote(other)),
        }
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        if self.transmission_flags & TRANSMISSION_SEND_FLUSH == 0 {
            return Ok(());
        }
        let handle = self.submit(CMD_FLUSH, 0, 0, None).await?;
        let error = self.read_reply(handle).await?;
        if error != EOK {
            return Err(TransportError::Remote(error));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        // DISC has no reply.
        let request = Request {
            flags: 0,
            command: CMD_DISC,
            handle: self.handle(),
            offset: 0,
            length: 0,
        };
        self.stream.write_all(&request.encode()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
