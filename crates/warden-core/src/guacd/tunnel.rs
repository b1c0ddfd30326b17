//! Guacd tunnel: TCP client for the Guacamole proxy daemon.
//!
//! Owns the connect handshake and the post-handshake instruction pump.
//! File-transfer instructions are intercepted before any generic routing;
//! everything else flows through as opaque display frames.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::constants::{
    AUDIO_MIMETYPE, FILE_ACK_TIMEOUT, FILE_CHUNK_SIZE, GUACD_DIAL_TIMEOUT, IMAGE_MIMETYPES,
};
use crate::error::{Error, Result};

use super::instruction::{DELIMITER, Instruction, opcodes};
use super::params::TunnelParams;
use super::transfer::FileTransferManager;

/// One negotiated connection to guacd.
///
/// A primary tunnel (built from [`TunnelParams::Primary`]) drives a new
/// remote session; an observer reuses an existing connection id read-only.
/// The connection id is assigned by the daemon during the handshake and is
/// immutable afterwards.
pub struct GuacdTunnel {
    session_id: String,
    connection_id: String,
    params: TunnelParams,
    reader: AsyncMutex<BufReader<OwnedReadHalf>>,
    writer: AsyncMutex<BufWriter<OwnedWriteHalf>>,
    transfers: Arc<FileTransferManager>,
    drive_path: Option<PathBuf>,
}

impl std::fmt::Debug for GuacdTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuacdTunnel")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .field("drive_path", &self.drive_path)
            .finish_non_exhaustive()
    }
}

impl GuacdTunnel {
    /// Dial guacd and run the connect handshake.
    ///
    /// Any handshake error closes the TCP connection and aborts creation;
    /// a tunnel that exists has always completed the handshake.
    pub async fn connect(
        host: &str,
        port: u16,
        session_id: &str,
        params: TunnelParams,
        transfers: Arc<FileTransferManager>,
        drive_path: Option<PathBuf>,
    ) -> Result<Self> {
        // IPv6 host literals need bracketing.
        let addr = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };

        let stream = tokio::time::timeout(GUACD_DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Dial {
                addr: addr.clone(),
                message: "connect timed out".into(),
            })?
            .map_err(|e| Error::Dial {
                addr: addr.clone(),
                message: e.to_string(),
            })?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        // The socket drops (and closes) if the handshake fails.
        let connection_id = Self::handshake(&mut reader, &mut writer, &params).await?;

        debug!(
            session_id,
            connection_id = %connection_id,
            primary = params.is_primary(),
            "Guacd tunnel established"
        );

        Ok(Self {
            session_id: session_id.to_string(),
            connection_id,
            params,
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            transfers,
            drive_path,
        })
    }

    /// Run the strict handshake sequence; each step is fatal on mismatch.
    async fn handshake(
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut BufWriter<OwnedWriteHalf>,
        params: &TunnelParams,
    ) -> Result<String> {
        // select: protocol name for a new session, connection id for an
        // observer.
        Self::write_to(
            writer,
            &Instruction::new(opcodes::SELECT, vec![params.select_arg().to_string()]),
        )
        .await?;

        // args: the daemon lists the parameter names it wants.
        let args = Self::assert_opcode(reader, opcodes::ARGS).await?;
        let resolved = params.resolve(&args.args);

        // size, audio, video, image.
        let (width, height, dpi) = params.geometry();
        Self::write_to(
            writer,
            &Instruction::new(opcodes::SIZE, vec![width, height, dpi]),
        )
        .await?;
        Self::write_to(
            writer,
            &Instruction::new(opcodes::AUDIO, vec![AUDIO_MIMETYPE.to_string()]),
        )
        .await?;
        Self::write_to(writer, &Instruction::new(opcodes::VIDEO, vec![])).await?;
        Self::write_to(
            writer,
            &Instruction::new(
                opcodes::IMAGE,
                IMAGE_MIMETYPES.iter().map(|m| m.to_string()).collect(),
            ),
        )
        .await?;

        // connect: ordered parameter values.
        Self::write_to(writer, &Instruction::new(opcodes::CONNECT, resolved)).await?;

        // ready: first argument is the connection id.
        let ready = Self::assert_opcode(reader, opcodes::READY).await?;
        ready
            .args
            .into_iter()
            .next()
            .filter(|id| !id.is_empty())
            .ok_or(Error::EmptyConnectionId)
    }

    async fn assert_opcode(
        reader: &mut BufReader<OwnedReadHalf>,
        expected: &str,
    ) -> Result<Instruction> {
        let raw = Self::read_from(reader).await?;
        let ins = Instruction::decode(&raw);
        if ins.opcode != expected {
            return Err(Error::Handshake {
                expected: expected.to_string(),
                actual: ins.opcode,
            });
        }
        Ok(ins)
    }

    async fn read_from(reader: &mut BufReader<OwnedReadHalf>) -> Result<Bytes> {
        let mut buf = Vec::new();
        let n = reader.read_until(DELIMITER, &mut buf).await?;
        if n == 0 || buf.last() != Some(&DELIMITER) {
            return Err(Error::ConnectionClosed);
        }
        Ok(Bytes::from(buf))
    }

    async fn write_to(
        writer: &mut BufWriter<OwnedWriteHalf>,
        instruction: &Instruction,
    ) -> Result<()> {
        writer.write_all(instruction.render().as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// The session this tunnel belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The daemon-assigned connection id.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Whether this tunnel drives the session (as opposed to observing).
    pub fn is_primary(&self) -> bool {
        self.params.is_primary()
    }

    /// Read the next display frame, up to and including the delimiter.
    ///
    /// File-transfer instructions never reach the caller: they are handled
    /// here, before any generic routing, and their in-band replies are
    /// returned as the frame instead.
    pub async fn read(self: &Arc<Self>) -> Result<Bytes> {
        loop {
            let raw = {
                let mut reader = self.reader.lock().await;
                Self::read_from(&mut reader).await?
            };

            let ins = Instruction::decode(&raw);
            if is_file_opcode(&ins.opcode) {
                match self.handle_file_instruction(ins).await? {
                    Some(reply) => return Ok(reply.bytes()),
                    None => continue,
                }
            }

            return Ok(raw);
        }
    }

    /// Read and decode the next instruction.
    pub async fn read_instruction(self: &Arc<Self>) -> Result<Instruction> {
        let raw = self.read().await?;
        Ok(Instruction::decode(&raw))
    }

    /// Write raw bytes, then flush.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write one instruction, then flush.
    pub async fn write_instruction(&self, instruction: &Instruction) -> Result<()> {
        self.write(instruction.render().as_bytes()).await
    }

    /// Send a `disconnect` instruction, best effort.
    pub async fn disconnect(&self) {
        debug!(session_id = %self.session_id, "Disconnecting guacd tunnel");
        if let Err(e) = self
            .write_instruction(&Instruction::new(opcodes::DISCONNECT, vec![]))
            .await
        {
            debug!(error = %e, "Disconnect instruction not delivered");
        }
    }

    fn allow_upload(&self) -> bool {
        matches!(&self.params, TunnelParams::Primary(p) if p.allow_upload)
            && self.drive_path.is_some()
    }

    fn allow_download(&self) -> bool {
        matches!(&self.params, TunnelParams::Primary(p) if p.allow_download)
            && self.drive_path.is_some()
    }

    /// Dispatch one file-transfer instruction.
    ///
    /// Malformed instructions degrade to an in-band `file-error` reply;
    /// only an opcode outside the sub-protocol is a hard error here.
    async fn handle_file_instruction(
        self: &Arc<Self>,
        instruction: Instruction,
    ) -> Result<Option<Instruction>> {
        match instruction.opcode.as_str() {
            opcodes::FILE_UPLOAD => {
                let (Some(filename), Some(size)) =
                    (instruction.args.first(), instruction.args.get(1))
                else {
                    return Ok(Some(file_error("invalid upload request")));
                };
                let Ok(size) = size.parse::<u64>() else {
                    return Ok(Some(file_error("invalid file size")));
                };
                if !self.allow_upload() {
                    return Ok(Some(file_error("file upload is disabled")));
                }
                let drive = self.drive_path.as_ref().expect("checked by allow_upload");
                match self
                    .transfers
                    .create_upload(&self.session_id, filename, size, drive)
                    .await
                {
                    Ok(id) => Ok(Some(Instruction::new(opcodes::FILE_ACK, vec![id]))),
                    Err(e) => Ok(Some(file_error(&e.to_string()))),
                }
            }

            opcodes::FILE_DOWNLOAD => {
                let Some(filename) = instruction.args.first() else {
                    return Ok(Some(file_error("invalid download request")));
                };
                if !self.allow_download() {
                    return Ok(Some(file_error("file download is disabled")));
                }
                let drive = self.drive_path.as_ref().expect("checked by allow_download");
                let (id, size) = match self
                    .transfers
                    .create_download(&self.session_id, filename, drive)
                    .await
                {
                    Ok(ok) => ok,
                    Err(e) => return Ok(Some(file_error(&e.to_string()))),
                };

                // Acknowledge with the transfer id and size, then stream the
                // file chunk by chunk from a separate task.
                self.write_instruction(&Instruction::new(
                    opcodes::FILE_ACK,
                    vec![id.clone(), size.to_string()],
                ))
                .await?;

                let tunnel = Arc::clone(self);
                tokio::spawn(async move {
                    tunnel.send_download(id).await;
                });
                Ok(None)
            }

            opcodes::FILE_DATA => {
                let (Some(id), Some(chunk)) =
                    (instruction.args.first(), instruction.args.get(1))
                else {
                    return Ok(Some(file_error("invalid data request")));
                };
                match self.transfers.write(id, chunk.as_bytes()).await {
                    Ok(n) => Ok(Some(Instruction::new(
                        opcodes::FILE_ACK,
                        vec![id.clone(), n.to_string()],
                    ))),
                    Err(e) => Ok(Some(file_error(&format!("write error: {e}")))),
                }
            }

            opcodes::FILE_COMPLETE => {
                let Some(id) = instruction.args.first() else {
                    return Ok(Some(file_error("invalid complete request")));
                };
                match self.transfers.complete(id).await {
                    Ok(()) => Ok(Some(Instruction::new(
                        opcodes::FILE_ACK,
                        vec![id.clone(), "complete".to_string()],
                    ))),
                    Err(e) => Ok(Some(file_error(&format!(
                        "failed to complete transfer: {e}"
                    )))),
                }
            }

            opcodes::FILE_ACK => {
                // Flow control for an in-flight download.
                if let Some(id) = instruction.args.first() {
                    self.transfers.notify_ack(id).await;
                }
                Ok(None)
            }

            opcodes::FILE_ERROR => {
                warn!(
                    session_id = %self.session_id,
                    message = ?instruction.args.first(),
                    "Peer reported file transfer error"
                );
                Ok(None)
            }

            other => Err(Error::Protocol {
                message: format!("unknown file instruction: {other}"),
            }),
        }
    }

    /// Stream a download as 4 KiB `file-data` chunks, waiting for a client
    /// acknowledgement after each one (stop-and-wait flow control). The ack
    /// wait is bounded; a hung client fails the transfer instead of stalling
    /// this task forever.
    async fn send_download(self: Arc<Self>, id: String) {
        let Some(mut ack_rx) = self.transfers.take_ack_rx(&id).await else {
            warn!(transfer_id = %id, "Download pump has no ack channel");
            return;
        };

        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        loop {
            let n = match self.transfers.read_chunk(&id, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(transfer_id = %id, error = %e, "Download read failed");
                    self.transfers.fail(&id, &e.to_string()).await;
                    return;
                }
            };
            if n == 0 {
                break;
            }

            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
            if let Err(e) = self
                .write_instruction(&Instruction::new(
                    opcodes::FILE_DATA,
                    vec![id.clone(), chunk],
                ))
                .await
            {
                self.transfers.fail(&id, &e.to_string()).await;
                return;
            }

            match tokio::time::timeout(FILE_ACK_TIMEOUT, ack_rx.recv()).await {
                Ok(Some(())) => {}
                Ok(None) => {
                    self.transfers.fail(&id, "ack channel closed").await;
                    return;
                }
                Err(_) => {
                    warn!(transfer_id = %id, "Timed out waiting for client ack");
                    self.transfers
                        .fail(&id, "timed out waiting for client ack")
                        .await;
                    return;
                }
            }
        }

        let _ = self
            .write_instruction(&Instruction::new(opcodes::FILE_COMPLETE, vec![id.clone()]))
            .await;
        let _ = self.transfers.complete(&id).await;
        debug!(transfer_id = %id, "Download complete");
    }
}

fn file_error(message: &str) -> Instruction {
    Instruction::new(opcodes::FILE_ERROR, vec![message.to_string()])
}

fn is_file_opcode(opcode: &str) -> bool {
    matches!(
        opcode,
        opcodes::FILE_UPLOAD
            | opcodes::FILE_DOWNLOAD
            | opcodes::FILE_DATA
            | opcodes::FILE_ACK
            | opcodes::FILE_COMPLETE
            | opcodes::FILE_ERROR
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn observer_params() -> TunnelParams {
        TunnelParams::Observer(super::super::params::ObserverParams {
            connection_id: "$existing".into(),
            width: 800,
            height: 600,
            dpi: 96,
        })
    }

    fn primary_params() -> TunnelParams {
        TunnelParams::Primary(super::super::params::PrimaryParams {
            scheme: "vnc".into(),
            hostname: "10.0.0.9".into(),
            port: 5900,
            username: "op".into(),
            password: "pw".into(),
            width: 1024,
            height: 768,
            dpi: 96,
            recording_name: "sess-t".into(),
            allow_copy: true,
            allow_paste: true,
            allow_upload: true,
            allow_download: true,
            drive_path: Some("/tmp/drive".into()),
        })
    }

    /// Read instructions from the server side until `connect` or EOF.
    async fn serve_handshake(
        listener: TcpListener,
        send_ready_early: bool,
    ) -> (Vec<String>, Option<String>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        let mut buf = Vec::new();
        let mut connect_args = None;

        if send_ready_early {
            stream
                .write_all(b"5.ready,4.$oop;")
                .await
                .unwrap();
        }

        let mut byte = [0u8; 1];
        loop {
            match stream.read(&mut byte).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            buf.push(byte[0]);
            if byte[0] != DELIMITER {
                continue;
            }
            let ins = Instruction::decode(&buf);
            buf.clear();
            seen.push(ins.opcode.clone());

            match ins.opcode.as_str() {
                "select" if !send_ready_early => {
                    stream
                        .write_all(b"4.args,8.hostname,4.port,8.username;")
                        .await
                        .unwrap();
                }
                "connect" => {
                    connect_args = Some(ins.args.join(","));
                    stream.write_all(b"5.ready,8.$conn-42;").await.unwrap();
                }
                _ => {}
            }
        }
        (seen, connect_args)
    }

    #[tokio::test]
    async fn handshake_success_assigns_connection_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_handshake(listener, false));

        let tunnel = GuacdTunnel::connect(
            "127.0.0.1",
            port,
            "sess-t",
            primary_params(),
            Arc::new(FileTransferManager::new()),
            None,
        )
        .await
        .unwrap();

        assert_eq!(tunnel.connection_id(), "$conn-42");
        assert!(tunnel.is_primary());

        drop(tunnel);
        let (seen, connect_args) = server.await.unwrap();
        assert_eq!(
            seen,
            vec!["select", "size", "audio", "video", "image", "connect"]
        );
        // Parameters answered in the order the daemon asked for them.
        assert_eq!(connect_args.as_deref(), Some("10.0.0.9,5900,op"));
    }

    #[tokio::test]
    async fn handshake_out_of_order_fails_without_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_handshake(listener, true));

        let err = GuacdTunnel::connect(
            "127.0.0.1",
            port,
            "sess-t",
            observer_params(),
            Arc::new(FileTransferManager::new()),
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            Error::Handshake { ref expected, ref actual }
                if expected == "args" && actual == "ready"
        ));

        let (seen, connect_args) = server.await.unwrap();
        assert!(seen.contains(&"select".to_string()));
        assert!(!seen.contains(&"connect".to_string()));
        assert!(connect_args.is_none());
    }

    #[tokio::test]
    async fn dial_failure_is_a_setup_error() {
        // A port nothing listens on.
        let err = GuacdTunnel::connect(
            "127.0.0.1",
            1,
            "sess-t",
            observer_params(),
            Arc::new(FileTransferManager::new()),
            None,
        )
        .await
        .unwrap_err();
        assert!(err.is_fatal_setup());
    }

    #[test]
    fn file_opcode_coverage() {
        for op in [
            "file-upload",
            "file-download",
            "file-data",
            "file-ack",
            "file-complete",
            "file-error",
        ] {
            assert!(is_file_opcode(op));
        }
        assert!(!is_file_opcode("mouse"));
        assert!(!is_file_opcode(""));
    }
}
