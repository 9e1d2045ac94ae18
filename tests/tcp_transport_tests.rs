// TCP transport tests
// These tests run a small line-delimited JSON chat server on localhost and
// drive the TCP transport and a full session against it

mod common;
use common::{fast_settings, setup_logging, wait_for_update, CONVERSATION, ME};

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use dugout::chat::{ChatServices, ChatSession, ConnectionManager, ConversationCache, QueryCache, SessionUpdate, Transport};
use dugout::models::{DeliveryStatus, Message, OutgoingMessage};
use dugout::transport::tcp::{ClientFrame, ServerFrame};
use dugout::transport::{LoopbackServer, TcpTransport};
use dugout::ChatError;

/// Accept one client. Sends with text "reject" are refused, "hang up" closes
/// the socket, everything else is acknowledged and echoed. Every client
/// frame is forwarded to `seen`.
async fn spawn_server(seen: mpsc::UnboundedSender<ClientFrame>) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    tokio::spawn(async move {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let frame: ClientFrame = match serde_json::from_str(&line) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            let _ = seen.send(frame.clone());

            let replies = match frame {
                ClientFrame::Send { message, .. } if message.text == "hang up" => return,
                ClientFrame::Send { request_id, message } if message.text == "reject" => vec![ServerFrame::Ack {
                    request_id,
                    success: false,
                    error: Some("muted".to_string()),
                }],
                ClientFrame::Send { request_id, message } => vec![
                    ServerFrame::Message {
                        message: Message {
                            id: format!("srv-{}", request_id),
                            conversation_id: message.conversation_id,
                            sender_id: message.sender_id,
                            text: message.text,
                            created_at: Utc::now(),
                            failed_to_send: false,
                            client_temp_id: Some(message.client_temp_id),
                        },
                    },
                    ServerFrame::Ack {
                        request_id,
                        success: true,
                        error: None,
                    },
                ],
                ClientFrame::Join { .. } | ClientFrame::Leave { .. } => Vec::new(),
            };

            for reply in replies {
                let mut line = match serde_json::to_string(&reply) {
                    Ok(line) => line,
                    Err(_) => return,
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });

    Ok(addr)
}

fn outgoing(text: &str) -> OutgoingMessage {
    OutgoingMessage {
        text: text.to_string(),
        conversation_id: CONVERSATION.to_string(),
        sender_id: ME.to_string(),
        client_temp_id: "1-0-0000-local".to_string(),
    }
}

#[tokio::test]
async fn test_send_is_acknowledged_and_echoed() -> Result<()> {
    setup_logging();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let addr = spawn_server(seen_tx).await?;

    let (transport, mut events) = TcpTransport::connect(&addr).await?;
    transport.join(CONVERSATION).await?;
    let ack = transport.send(outgoing("Warmups at 5:30")).await?;
    assert!(ack.success);

    let echo = timeout(Duration::from_secs(1), events.recv()).await?.expect("echo");
    assert_eq!(echo.text, "Warmups at 5:30");
    assert_eq!(echo.client_temp_id.as_deref(), Some("1-0-0000-local"));

    let rejected = transport.send(outgoing("reject")).await?;
    assert!(!rejected.success);
    assert_eq!(rejected.error.as_deref(), Some("muted"));

    let first = timeout(Duration::from_secs(1), seen_rx.recv()).await?;
    assert_eq!(
        first,
        Some(ClientFrame::Join {
            conversation_id: CONVERSATION.to_string()
        })
    );

    Ok(())
}

#[tokio::test]
async fn test_closed_connection_fails_outstanding_send() -> Result<()> {
    setup_logging();
    let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
    let addr = spawn_server(seen_tx).await?;

    let (transport, _events) = TcpTransport::connect(&addr).await?;
    let result = timeout(Duration::from_secs(2), transport.send(outgoing("hang up"))).await?;
    assert!(matches!(result, Err(ChatError::ConnectionClosed)));

    for _ in 0..50 {
        if transport.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(transport.is_closed());
    assert!(matches!(transport.send(outgoing("anyone?")).await, Err(ChatError::ConnectionClosed)));

    Ok(())
}

#[tokio::test]
async fn test_session_over_tcp() -> Result<()> {
    setup_logging();
    let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
    let addr = spawn_server(seen_tx).await?;

    let (transport, events) = TcpTransport::connect(&addr).await?;
    let (history, _unused_events) = LoopbackServer::new();
    let services = ChatServices {
        connection: ConnectionManager::start(transport, events),
        history,
        conversations: ConversationCache::new(Arc::new(QueryCache::new())),
        directory: None,
    };
    let mut session = ChatSession::open(services, CONVERSATION, ME, fast_settings()).await?;

    let temp = session.send_message("Lineup is posted")?;
    let update = wait_for_update(&mut session, |u| matches!(u, SessionUpdate::Confirmed(_)), 2).await?;
    let server_id = match update {
        SessionUpdate::Confirmed(id) => id,
        other => panic!("Expected confirmation, got {:?}", other),
    };
    assert!(server_id.starts_with("srv-"));
    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.delivery_status(&server_id), Some(DeliveryStatus::Confirmed));
    assert!(session.delivery_status(&temp.id).is_none());

    let rejected = session.send_message("reject")?;
    wait_for_update(&mut session, |u| matches!(u, SessionUpdate::Failed(_)), 2).await?;
    assert_eq!(session.delivery_status(&rejected.id), Some(DeliveryStatus::Failed));

    session.close().await?;
    Ok(())
}
