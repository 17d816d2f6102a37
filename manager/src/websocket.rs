use crate::models::ProgressMessage;
use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Heartbeat ping cadence for progress connections.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Fixed inactivity window after which a silent peer is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Seam through which the orchestrator pushes status transitions. Delivery is
/// best-effort; `false` means nobody received the message.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn send_progress(&self, message: ProgressMessage) -> bool;
}

/// One live duplex connection bound to a session.
pub struct ProgressConnection {
    session_id: String,
    /// Last heartbeat time
    hb: Instant,
    server: Addr<ProgressChannelServer>,
}

impl ProgressConnection {
    pub fn new(session_id: String, server: Addr<ProgressChannelServer>) -> Self {
        Self {
            session_id,
            hb: Instant::now(),
            server,
        }
    }

    fn hb(&self, ctx: &mut <Self as Actor>::Context) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(
                    session_id = %act.session_id,
                    "Progress connection failed heartbeat, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for ProgressConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(session_id = %self.session_id, "Progress connection started");
        self.hb(ctx);

        self.server.do_send(Connect {
            session_id: self.session_id.clone(),
            addr: ctx.address().recipient(),
        });
    }

    fn stopping(&mut self, ctx: &mut Self::Context) -> Running {
        tracing::info!(session_id = %self.session_id, "Progress connection stopping");
        self.server.do_send(Disconnect {
            session_id: self.session_id.clone(),
            addr: ctx.address().recipient(),
        });
        Running::Stop
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ProgressConnection {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();

                match ping_reply(&text) {
                    Some(reply) => ctx.text(reply),
                    None => {
                        tracing::debug!(
                            session_id = %self.session_id,
                            content = %text,
                            "Ignoring unrecognized inbound message"
                        );
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::debug!(session_id = %self.session_id, "Binary message ignored");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(session_id = %self.session_id, ?reason, "Peer closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            _ => {
                ctx.stop();
            }
        }
    }
}

/// The only recognized inbound text is an application-level liveness ping,
/// answered in kind. Everything else yields no reply.
fn ping_reply(text: &str) -> Option<&'static str> {
    let is_ping = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str().map(String::from)))
        .is_some_and(|t| t == "ping");
    is_ping.then_some(r#"{"type":"pong"}"#)
}

/// Event pushed from the registry to a bound connection: either a progress
/// frame to forward to the peer, or the instruction to step aside because a
/// newer connection took over the session.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub enum ChannelEvent {
    Frame(ProgressMessage),
    Superseded,
}

impl Handler<ChannelEvent> for ProgressConnection {
    type Result = ();

    fn handle(&mut self, msg: ChannelEvent, ctx: &mut Self::Context) {
        match msg {
            ChannelEvent::Frame(frame) => {
                if let Ok(json) = serde_json::to_string(&frame) {
                    ctx.text(json);
                }
            }
            ChannelEvent::Superseded => {
                tracing::info!(
                    session_id = %self.session_id,
                    "Closing superseded progress connection"
                );
                ctx.close(Some(ws::CloseReason::from(ws::CloseCode::Policy)));
                ctx.stop();
            }
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub session_id: String,
    pub addr: Recipient<ChannelEvent>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub session_id: String,
    pub addr: Recipient<ChannelEvent>,
}

#[derive(Message)]
#[rtype(result = "bool")]
pub struct SendProgress {
    pub message: ProgressMessage,
}

#[derive(Message)]
#[rtype(result = "bool")]
pub struct IsConnected {
    pub session_id: String,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Broadcast {
    pub message: ProgressMessage,
}

/// Registry of live progress connections, at most one per session.
#[derive(Debug, Default)]
pub struct ProgressChannelServer {
    connections: HashMap<String, Recipient<ChannelEvent>>,
}

impl Actor for ProgressChannelServer {
    type Context = Context<Self>;
}

impl Handler<Connect> for ProgressChannelServer {
    type Result = ();

    fn handle(&mut self, msg: Connect, _: &mut Self::Context) {
        // Last connect wins: the previous connection for this session is
        // closed before the new one is bound.
        if let Some(old) = self
            .connections
            .insert(msg.session_id.clone(), msg.addr.clone())
        {
            if old != msg.addr {
                tracing::info!(
                    session_id = %msg.session_id,
                    "Replacing existing progress connection"
                );
                old.do_send(ChannelEvent::Superseded);
            }
        }

        tracing::info!(session_id = %msg.session_id, "Progress connection bound");
        msg.addr
            .do_send(ChannelEvent::Frame(ProgressMessage::welcome(msg.session_id)));
    }
}

impl Handler<Disconnect> for ProgressChannelServer {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _: &mut Self::Context) {
        // Only unbind if this address is still the bound one; a superseded
        // connection must not evict its replacement.
        if self.connections.get(&msg.session_id) == Some(&msg.addr) {
            tracing::info!(session_id = %msg.session_id, "Progress connection unbound");
            self.connections.remove(&msg.session_id);
        }
    }
}

impl Handler<SendProgress> for ProgressChannelServer {
    type Result = bool;

    fn handle(&mut self, msg: SendProgress, _: &mut Self::Context) -> bool {
        let session_id = msg.message.session_id.clone();
        match self.connections.get(&session_id) {
            Some(addr) => {
                if addr.try_send(ChannelEvent::Frame(msg.message)).is_err() {
                    // A failed transport send is an implicit disconnect.
                    tracing::warn!(
                        session_id = %session_id,
                        "Failed to push progress, dropping connection"
                    );
                    self.connections.remove(&session_id);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }
}

impl Handler<IsConnected> for ProgressChannelServer {
    type Result = bool;

    fn handle(&mut self, msg: IsConnected, _: &mut Self::Context) -> bool {
        self.connections.contains_key(&msg.session_id)
    }
}

impl Handler<Broadcast> for ProgressChannelServer {
    type Result = ();

    fn handle(&mut self, msg: Broadcast, _: &mut Self::Context) {
        tracing::debug!(
            connections = self.connections.len(),
            "Broadcasting progress message"
        );
        let mut to_remove = Vec::new();
        for (session_id, addr) in &self.connections {
            if addr.try_send(ChannelEvent::Frame(msg.message.clone())).is_err() {
                to_remove.push(session_id.clone());
            }
        }
        for session_id in to_remove {
            self.connections.remove(&session_id);
        }
    }
}

/// Facade handed to the orchestrator and handlers for pushing to the
/// channel registry without touching actor plumbing.
pub struct ProgressNotifier {
    server: Addr<ProgressChannelServer>,
}

impl ProgressNotifier {
    pub fn new(server: Addr<ProgressChannelServer>) -> Self {
        Self { server }
    }

    pub async fn is_connected(&self, session_id: &str) -> bool {
        self.server
            .send(IsConnected {
                session_id: session_id.to_string(),
            })
            .await
            .unwrap_or(false)
    }

    pub fn broadcast(&self, message: ProgressMessage) {
        self.server.do_send(Broadcast { message });
    }
}

#[async_trait]
impl ProgressSink for ProgressNotifier {
    async fn send_progress(&self, message: ProgressMessage) -> bool {
        match self.server.send(SendProgress { message }).await {
            Ok(delivered) => delivered,
            Err(e) => {
                tracing::warn!("Progress channel registry unavailable: {e}");
                false
            }
        }
    }
}

/// WebSocket endpoint handler for the session-scoped progress channel.
pub async fn progress_websocket_handler(
    req: HttpRequest,
    stream: web::Payload,
    srv: web::Data<Addr<ProgressChannelServer>>,
    session_id: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let session_id = session_id.into_inner();
    tracing::debug!(session_id = %session_id, "Progress connection request received");

    ws::start(
        ProgressConnection::new(session_id, srv.get_ref().clone()),
        &req,
        stream,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GenerationRun, RunStatus};
    use std::sync::{Arc, Mutex};

    /// Stands in for a bound peer: records every event the registry pushes.
    struct TestPeer {
        frames: Arc<Mutex<Vec<ProgressMessage>>>,
        superseded: Arc<Mutex<bool>>,
    }

    impl TestPeer {
        fn spawn() -> (
            Addr<TestPeer>,
            Arc<Mutex<Vec<ProgressMessage>>>,
            Arc<Mutex<bool>>,
        ) {
            let frames = Arc::new(Mutex::new(Vec::new()));
            let superseded = Arc::new(Mutex::new(false));
            let addr = TestPeer {
                frames: Arc::clone(&frames),
                superseded: Arc::clone(&superseded),
            }
            .start();
            (addr, frames, superseded)
        }
    }

    impl Actor for TestPeer {
        type Context = Context<Self>;
    }

    impl Handler<ChannelEvent> for TestPeer {
        type Result = ();

        fn handle(&mut self, msg: ChannelEvent, _: &mut Context<Self>) {
            match msg {
                ChannelEvent::Frame(frame) => self.frames.lock().unwrap().push(frame),
                ChannelEvent::Superseded => *self.superseded.lock().unwrap() = true,
            }
        }
    }

    fn sample_message(session_id: &str) -> ProgressMessage {
        ProgressMessage::from_run(
            &GenerationRun::new(session_id.to_string()),
            "Generation request received".to_string(),
        )
    }

    /// Lets do_send deliveries drain through the peer mailboxes.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[actix_rt::test]
    async fn connect_sends_a_welcome_frame() {
        let server = ProgressChannelServer::default().start();
        let (peer, frames, _) = TestPeer::spawn();

        server
            .send(Connect {
                session_id: "s1".to_string(),
                addr: peer.clone().recipient(),
            })
            .await
            .unwrap();
        settle().await;

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].session_id, "s1");
        assert_eq!(frames[0].status, RunStatus::Received);
        assert_eq!(frames[0].progress, 0);
    }

    #[actix_rt::test]
    async fn last_connect_wins_and_supersedes_the_previous_peer() {
        let server = ProgressChannelServer::default().start();
        let (first, first_frames, first_superseded) = TestPeer::spawn();
        let (second, second_frames, second_superseded) = TestPeer::spawn();

        server
            .send(Connect {
                session_id: "s1".to_string(),
                addr: first.clone().recipient(),
            })
            .await
            .unwrap();
        server
            .send(Connect {
                session_id: "s1".to_string(),
                addr: second.clone().recipient(),
            })
            .await
            .unwrap();
        settle().await;
        assert!(*first_superseded.lock().unwrap());
        assert!(!*second_superseded.lock().unwrap());

        // Progress pushes reach only the replacement
        let notifier = ProgressNotifier::new(server);
        assert!(notifier.send_progress(sample_message("s1")).await);
        settle().await;
        assert_eq!(first_frames.lock().unwrap().len(), 1); // welcome only
        assert_eq!(second_frames.lock().unwrap().len(), 2); // welcome + push
    }

    #[actix_rt::test]
    async fn stale_disconnect_does_not_evict_the_replacement() {
        let server = ProgressChannelServer::default().start();
        let (first, _first_frames, _) = TestPeer::spawn();
        let (second, _second_frames, _) = TestPeer::spawn();

        server
            .send(Connect {
                session_id: "s1".to_string(),
                addr: first.clone().recipient(),
            })
            .await
            .unwrap();
        server
            .send(Connect {
                session_id: "s1".to_string(),
                addr: second.clone().recipient(),
            })
            .await
            .unwrap();

        // The superseded connection disconnecting must not unbind its
        // replacement
        server
            .send(Disconnect {
                session_id: "s1".to_string(),
                addr: first.clone().recipient(),
            })
            .await
            .unwrap();
        let notifier = ProgressNotifier::new(server.clone());
        assert!(notifier.is_connected("s1").await);

        // The currently bound connection disconnecting does unbind
        server
            .send(Disconnect {
                session_id: "s1".to_string(),
                addr: second.clone().recipient(),
            })
            .await
            .unwrap();
        assert!(!notifier.is_connected("s1").await);
        assert!(!notifier.send_progress(sample_message("s1")).await);
    }

    #[actix_rt::test]
    async fn send_progress_without_a_connection_reports_false() {
        let server = ProgressChannelServer::default().start();
        let notifier = ProgressNotifier::new(server);

        assert!(!notifier.is_connected("nobody").await);
        assert!(!notifier.send_progress(sample_message("nobody")).await);
    }

    #[actix_rt::test]
    async fn broadcast_reaches_every_bound_session() {
        let server = ProgressChannelServer::default().start();
        let (a, a_frames, _) = TestPeer::spawn();
        let (b, b_frames, _) = TestPeer::spawn();

        server
            .send(Connect {
                session_id: "a".to_string(),
                addr: a.clone().recipient(),
            })
            .await
            .unwrap();
        server
            .send(Connect {
                session_id: "b".to_string(),
                addr: b.clone().recipient(),
            })
            .await
            .unwrap();

        let notifier = ProgressNotifier::new(server);
        notifier.broadcast(sample_message("a"));
        settle().await;

        assert_eq!(a_frames.lock().unwrap().len(), 2); // welcome + broadcast
        assert_eq!(b_frames.lock().unwrap().len(), 2);
    }

    #[test]
    fn ping_text_gets_a_pong_reply() {
        assert_eq!(ping_reply(r#"{"type":"ping"}"#), Some(r#"{"type":"pong"}"#));
    }

    #[test]
    fn other_inbound_text_gets_no_reply() {
        assert_eq!(ping_reply(r#"{"type":"status"}"#), None);
        assert_eq!(ping_reply("not json"), None);
        assert_eq!(ping_reply(r#"{"kind":"ping"}"#), None);
    }
}
