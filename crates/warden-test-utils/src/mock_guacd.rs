//! Scriptable mock guacd daemon.
//!
//! Listens on a loopback port, speaks the instruction wire format, and
//! records everything the tunnel under test sends. The handshake can be
//! played correctly or deliberately out of order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use warden_core::guacd::{DELIMITER, Instruction, opcodes};

/// How the mock daemon plays the handshake.
#[derive(Debug, Clone)]
pub struct MockGuacdBehavior {
    /// Connection id announced in `ready`.
    pub connection_id: String,
    /// Parameter names requested via `args`.
    pub arg_names: Vec<String>,
    /// Send `ready` before `args` to violate the handshake order.
    pub ready_before_args: bool,
}

impl Default for MockGuacdBehavior {
    fn default() -> Self {
        Self {
            connection_id: "$mock-conn".into(),
            arg_names: vec!["hostname".into(), "port".into(), "username".into()],
            ready_before_args: false,
        }
    }
}

/// A mock guacd accepting a single tunnel connection.
pub struct MockGuacd {
    addr: SocketAddr,
    inject_tx: mpsc::Sender<Bytes>,
    received: Arc<Mutex<Vec<Instruction>>>,
    task: JoinHandle<()>,
}

impl MockGuacd {
    /// Bind a loopback listener and start serving one connection.
    pub async fn spawn(behavior: MockGuacdBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (inject_tx, inject_rx) = mpsc::channel(64);
        let received: Arc<Mutex<Vec<Instruction>>> = Arc::new(Mutex::new(Vec::new()));

        let record = Arc::clone(&received);
        let task = tokio::spawn(async move {
            serve(listener, behavior, inject_rx, record).await;
        });

        Self {
            addr,
            inject_tx,
            received,
            task,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Push an instruction to the connected tunnel.
    pub async fn inject(&self, instruction: Instruction) {
        let _ = self.inject_tx.send(instruction.bytes()).await;
    }

    /// Push raw bytes to the connected tunnel.
    pub async fn inject_raw(&self, raw: &[u8]) {
        let _ = self.inject_tx.send(Bytes::copy_from_slice(raw)).await;
    }

    /// Everything the tunnel has sent so far.
    pub async fn received(&self) -> Vec<Instruction> {
        self.received.lock().await.clone()
    }

    /// Wait until an instruction with `opcode` arrives, or time out.
    pub async fn wait_for_opcode(&self, opcode: &str, timeout: Duration) -> Option<Instruction> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self
                .received
                .lock()
                .await
                .iter()
                .find(|i| i.opcode == opcode)
                .cloned()
            {
                return Some(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop serving.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn serve(
    listener: TcpListener,
    behavior: MockGuacdBehavior,
    mut inject_rx: mpsc::Receiver<Bytes>,
    received: Arc<Mutex<Vec<Instruction>>>,
) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    if behavior.ready_before_args {
        let ready = Instruction::new(opcodes::READY, vec![behavior.connection_id.clone()]);
        let _ = write_half.write_all(ready.render().as_bytes()).await;
        let _ = write_half.flush().await;
    }

    let mut buf = Vec::new();
    loop {
        tokio::select! {
            injected = inject_rx.recv() => {
                let Some(frame) = injected else { break };
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
                let _ = write_half.flush().await;
            }
            read = reader.read_until(DELIMITER, &mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let ins = Instruction::decode(&buf);
                buf.clear();
                let opcode = ins.opcode.clone();
                received.lock().await.push(ins);

                match opcode.as_str() {
                    opcodes::SELECT if !behavior.ready_before_args => {
                        let args = Instruction::new(opcodes::ARGS, behavior.arg_names.clone());
                        let _ = write_half.write_all(args.render().as_bytes()).await;
                        let _ = write_half.flush().await;
                    }
                    opcodes::CONNECT => {
                        let ready = Instruction::new(
                            opcodes::READY,
                            vec![behavior.connection_id.clone()],
                        );
                        let _ = write_half.write_all(ready.render().as_bytes()).await;
                        let _ = write_half.flush().await;
                    }
                    _ => {}
                }
            }
        }
    }
}
