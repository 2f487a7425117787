//! End-to-end approval roundtrip: a JSON-RPC app-server session issues a
//! command-approval server request, the broker posts chat buttons, a user
//! click resolves the adapter's callback, and the turn completes with the
//! backend's final text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

use sb_domain::config::ThrottleConfig;
use sb_domain::event::AgentEvent;
use sb_domain::snapshot::Provider;
use sb_gateway::approvals::{ApprovalBroker, BrokerRequestHandler};
use sb_gateway::chat::throttle::{ChatExecutor, ThrottleQueue};
use sb_gateway::chat::{ChatError, Component, Interaction, OutboundMessage};
use sb_gateway::routes::{RouteStore, ThreadRoute};
use sb_providers::app_server::{AppServerConnection, AppServerSession};
use sb_providers::manager::SessionOptions;
use sb_providers::session::AgentSession;

struct RecordingChat {
    posts: Mutex<Vec<(String, OutboundMessage)>>,
}

#[async_trait]
impl ChatExecutor for RecordingChat {
    async fn execute(&self, channel_id: &str, message: &OutboundMessage) -> Result<(), ChatError> {
        self.posts
            .lock()
            .push((channel_id.to_string(), message.clone()));
        Ok(())
    }
}

/// Scripted app-server peer: answers the handshake, issues one command
/// approval request at turn start, records the client's decision reply,
/// then streams the final message.
async fn mock_app_server(io: tokio::io::DuplexStream, decision_seen: Arc<Mutex<Option<Value>>>) {
    let (read_half, mut write_half) = tokio::io::split(io);
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let msg: Value = serde_json::from_str(&line).unwrap();
        let id = msg.get("id").cloned();
        match msg.get("method").and_then(Value::as_str).unwrap_or("") {
            "initialize" => {
                let reply = json!({"jsonrpc":"2.0","id":id,"result":{}});
                write_half
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
            "thread/start" => {
                let reply = json!({"jsonrpc":"2.0","id":id,"result":{"threadId":"thread-mock"}});
                write_half
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
            "turn/start" => {
                let reply = json!({"jsonrpc":"2.0","id":id,"result":{"turnId":"turn-mock"}});
                write_half
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();

                let request = json!({"jsonrpc":"2.0","id":900,
                    "method":"item/commandExecution/requestApproval",
                    "params":{"threadId":"thread-mock","turnId":"turn-mock",
                              "itemId":"item-1","command":"echo test"}});
                write_half
                    .write_all(format!("{request}\n").as_bytes())
                    .await
                    .unwrap();

                // Block until the client resolves the approval.
                if let Ok(Some(reply_line)) = lines.next_line().await {
                    let reply: Value = serde_json::from_str(&reply_line).unwrap();
                    *decision_seen.lock() = reply.get("result").cloned();
                }

                for notification in [
                    json!({"jsonrpc":"2.0","method":"item/completed",
                           "params":{"item":{"type":"agentMessage",
                                              "text":"mock assistant final response"}}}),
                    json!({"jsonrpc":"2.0","method":"turn/completed",
                           "params":{"turn":{"status":"completed",
                               "usage":{"input_tokens":12,"output_tokens":4}}}}),
                ] {
                    write_half
                        .write_all(format!("{notification}\n").as_bytes())
                        .await
                        .unwrap();
                }
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn command_approval_roundtrip() {
    let chat = Arc::new(RecordingChat {
        posts: Mutex::new(Vec::new()),
    });
    let throttle = ThrottleQueue::new(chat.clone(), ThrottleConfig::default());
    let broker = ApprovalBroker::new(throttle, "sbx".into(), 1_000);

    // The route binding a chat thread to the backend thread must exist
    // before the approval arrives (discovery normally writes it).
    let routes = Arc::new(RouteStore::in_memory().unwrap());
    routes
        .upsert(&ThreadRoute {
            thread_id: "chat-thread".into(),
            parent_channel_id: "chan".into(),
            mapping_key: "/home/me/proj".into(),
            provider: Provider::CodexAppServer,
            provider_session_id: "thread-mock".into(),
            owner_user_id: None,
            cwd: "/home/me/proj".into(),
            created_at: 1,
            updated_at: 1,
            auto_discovered: true,
        })
        .unwrap();
    let handler = BrokerRequestHandler::new(broker.clone(), routes, None);

    let decision_seen = Arc::new(Mutex::new(None));
    let (client_io, server_io) = duplex(64 * 1024);
    tokio::spawn(mock_app_server(server_io, decision_seen.clone()));

    let (read_half, write_half) = tokio::io::split(client_io);
    let conn = AppServerConnection::start(read_half, write_half);
    let session = AppServerSession::from_connection(conn, None, &SessionOptions::default());
    session.set_handler(handler);

    // Drive the turn in the background; it suspends on the approval.
    let collect = tokio::spawn(async move {
        let mut stream = session.send("run echo test").await.unwrap();
        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        events
    });

    // The broker should post a prompt into the bound chat thread.
    let pending_id = loop {
        if let Some(info) = broker.list_pending().first().cloned() {
            break info.pending_id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    // Let the prompt flush through the throttle, then click accept.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let reply = broker
        .handle_interaction(&Interaction {
            custom_id: format!("sbx:a:cmd:{pending_id}:accept"),
            user_id: "reviewer".into(),
            channel_id: "chat-thread".into(),
            values: vec![],
        })
        .expect("interaction belongs to the broker");
    assert!(reply.text.contains("accept"));

    let events = collect.await.unwrap();
    assert!(events.contains(&AgentEvent::Session {
        session_id: "thread-mock".into()
    }));
    assert!(events.contains(&AgentEvent::Text {
        text: "mock assistant final response".into(),
        partial: false
    }));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::TurnComplete { usage, .. }
            if usage.input == 12 && usage.output == 4)));

    // The adapter replied to the server with the clicked decision.
    let decision = decision_seen.lock().clone().expect("decision recorded");
    assert_eq!(decision["decision"], "accept");

    // The prompt landed in the chat thread bound by the route.
    let posts = chat.posts.lock();
    let prompt = posts
        .iter()
        .find(|(channel, _)| channel == "chat-thread")
        .expect("prompt posted to the bound thread");
    assert!(prompt.1.text.contains("echo test"));
    assert!(matches!(
        prompt.1.components.first(),
        Some(Component::Buttons { .. })
    ));
}
