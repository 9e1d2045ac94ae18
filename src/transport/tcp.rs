// Persistent connection over TCP
// Frames are JSON objects, one per line, tagged by "type"

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::chat::connection::Transport;
use crate::error::{ChatError, Result};
use crate::models::{Message, OutgoingMessage, SendAck};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { conversation_id: String },
    Leave { conversation_id: String },
    Send { request_id: u64, message: OutgoingMessage },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack {
        request_id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Message { message: Message },
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<SendAck>>>>;

fn lock_acks(acks: &PendingAcks) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<SendAck>>> {
    acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct AckWaiter {
    request_id: u64,
    pending_acks: PendingAcks,
}

impl Drop for AckWaiter {
    fn drop(&mut self) {
        if lock_acks(&self.pending_acks).remove(&self.request_id).is_some() {
            debug!("Stopped waiting for acknowledgment of request {}", self.request_id);
        }
    }
}

pub struct TcpTransport {
    writer: TokioMutex<OwnedWriteHalf>,
    pending_acks: PendingAcks,
    next_request: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Connect and spawn the frame reader. Broadcast messages arrive on the
    /// returned receiver.
    pub async fn connect(addr: &str) -> Result<(Arc<Self>, mpsc::Receiver<Message>)> {
        info!("Connecting to chat server at {}", addr);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ChatError::Transport(format!("Could not connect to {}: {}", addr, e)))?;
        let (read_half, write_half) = stream.into_split();
        let (events_tx, events_rx) = mpsc::channel(100);

        let pending_acks: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(read_frames(read_half, events_tx, pending_acks.clone(), closed.clone()));

        let transport = TcpTransport {
            writer: TokioMutex::new(write_half),
            pending_acks,
            next_request: AtomicU64::new(1),
            closed,
        };
        Ok((Arc::new(transport), events_rx))
    }

    async fn write_frame(&self, frame: &ClientFrame) -> Result<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn read_frames(
    read_half: OwnedReadHalf,
    events: mpsc::Sender<Message>,
    pending_acks: PendingAcks,
    closed: Arc<AtomicBool>,
) {
    let mut lines = LinesStream::new(BufReader::new(read_half).lines());

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Error reading from chat server: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<ServerFrame>(&line) {
            Ok(ServerFrame::Ack {
                request_id,
                success,
                error,
            }) => {
                let waiter = lock_acks(&pending_acks).remove(&request_id);
                match waiter {
                    Some(waiter) => {
                        if waiter.send(SendAck { success, error }).is_err() {
                            debug!("Sender of request {} stopped waiting", request_id);
                        }
                    }
                    None => debug!("Acknowledgment for unknown request {}", request_id),
                }
            }
            Ok(ServerFrame::Message { message }) => {
                if events.send(message).await.is_err() {
                    info!("Broadcast receiver dropped, stopping reader");
                    break;
                }
            }
            Err(e) => warn!("Ignoring malformed frame from chat server: {}", e),
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the waiters fails every outstanding send
    lock_acks(&pending_acks).clear();
    info!("Chat server connection closed");
}

#[async_trait]
impl Transport for TcpTransport {
    async fn join(&self, conversation_id: &str) -> Result<()> {
        self.write_frame(&ClientFrame::Join {
            conversation_id: conversation_id.to_string(),
        })
        .await
    }

    async fn leave(&self, conversation_id: &str) -> Result<()> {
        self.write_frame(&ClientFrame::Leave {
            conversation_id: conversation_id.to_string(),
        })
        .await
    }

    async fn send(&self, message: OutgoingMessage) -> Result<SendAck> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock_acks(&self.pending_acks).insert(request_id, tx);
        // Removes the waiter however this future ends, including being dropped by a timeout
        let _waiter = AckWaiter {
            request_id,
            pending_acks: self.pending_acks.clone(),
        };

        if self.is_closed() {
            return Err(ChatError::ConnectionClosed);
        }

        self.write_frame(&ClientFrame::Send { request_id, message }).await?;
        rx.await.map_err(|_| ChatError::ConnectionClosed)
    }
}
