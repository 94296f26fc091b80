use std::collections::VecDeque;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::json;
use rustls::crypto::{CryptoProvider, ring};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::util::{now_millis, wait_until};

use super::machine::{Failure, SessionAction, SessionMachine, SessionState};

type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Connecting = BoxFuture<'static, Result<FeedStream, tungstenite::Error>>;

pub const DEFAULT_ENDPOINT: &str = "wss://ris-live.ripe.net/v1/ws/?client=bgp-livegraph";

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub endpoint: String,
    pub collector: String,
    pub prefix: Option<String>,
    pub reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            collector: "rrc00".to_owned(),
            prefix: None,
            reconnect_delay: Duration::from_secs(4),
        }
    }
}

impl SessionConfig {
    pub fn subscription(&self) -> String {
        let mut data = json!({ "host": self.collector });
        if let Some(prefix) = &self.prefix {
            data["prefix"] = json!(prefix);
        }
        json!({ "type": "ris_subscribe", "data": data }).to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionCommand {
    Start,
    Stop,
    Reconnect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Status(SessionState),
    Frame { payload: String, received_at: i64 },
}

/// Handle kept by the orchestrator. Dropping it shuts the session down.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            debug!(?command, "feed session already shut down");
        }
    }
}

pub fn spawn_session(
    config: SessionConfig,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    install_crypto_provider();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let session = FeedSession {
        config,
        commands: command_rx,
        events: event_tx,
    };
    tokio::spawn(session.run());
    (
        SessionHandle {
            commands: command_tx,
        },
        event_rx,
    )
}

/// `wss` endpoints need a process-wide rustls provider before the first
/// handshake.
fn install_crypto_provider() {
    if CryptoProvider::get_default().is_some() {
        return;
    }
    if ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider installed concurrently");
    }
}

/// Live connection state owned by the session task.
#[derive(Default)]
struct Link {
    connecting: Option<Connecting>,
    stream: Option<FeedStream>,
    reconnect_at: Option<Instant>,
}

struct FeedSession {
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl FeedSession {
    async fn run(mut self) {
        let mut machine = SessionMachine::new(self.config.reconnect_delay);
        let mut link = Link::default();
        let mut pending: VecDeque<SessionAction> = machine.start().into();

        loop {
            while let Some(action) = pending.pop_front() {
                if let Some(failure) = self.apply(action, &mut link).await {
                    pending.extend(machine.on_failure(failure));
                }
            }

            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        for action in machine.stop() {
                            self.apply(action, &mut link).await;
                        }
                        break;
                    };
                    info!(?command, "feed session command");
                    pending.extend(match command {
                        SessionCommand::Start => machine.start(),
                        SessionCommand::Stop => machine.stop(),
                        SessionCommand::Reconnect => machine.reconnect(),
                    });
                }
                result = next_connect(&mut link.connecting) => {
                    link.connecting = None;
                    match result {
                        Ok(stream) => {
                            link.stream = Some(stream);
                            pending.extend(machine.on_open());
                        }
                        Err(error) => {
                            warn!(endpoint = %self.config.endpoint, %error, "feed connection failed");
                            pending.extend(machine.on_failure(Failure::Errored));
                        }
                    }
                }
                frame = next_frame(&mut link.stream) => {
                    if let Some(failure) = self.handle_frame(frame) {
                        link.stream = None;
                        pending.extend(machine.on_failure(failure));
                    }
                }
                () = wait_until(link.reconnect_at) => {
                    link.reconnect_at = None;
                    pending.extend(machine.on_reconnect_timer());
                }
            }

            if self.events.is_closed() {
                debug!("feed session receiver dropped; shutting down");
                for action in machine.stop() {
                    self.apply(action, &mut link).await;
                }
                break;
            }
        }
    }

    async fn apply(&self, action: SessionAction, link: &mut Link) -> Option<Failure> {
        match action {
            SessionAction::Connect => {
                info!(endpoint = %self.config.endpoint, "connecting to feed");
                link.stream = None;
                link.connecting = Some(
                    connect_async(self.config.endpoint.clone())
                        .map(|result| result.map(|(stream, _response)| stream))
                        .boxed(),
                );
            }
            SessionAction::Subscribe => {
                let stream = link.stream.as_mut()?;
                let request = self.config.subscription();
                if let Err(error) = stream.send(Message::text(request)).await {
                    warn!(%error, "could not send feed subscription");
                    link.stream = None;
                    return Some(Failure::Errored);
                }
                debug!(collector = %self.config.collector, "subscription sent");
            }
            SessionAction::Disconnect => {
                link.connecting = None;
                if let Some(mut stream) = link.stream.take()
                    && let Err(error) = stream.close(None).await
                {
                    debug!(%error, "feed connection did not close cleanly");
                }
            }
            SessionAction::ArmReconnect(delay) => {
                debug!(?delay, "reconnect scheduled");
                link.reconnect_at = Some(Instant::now() + delay);
            }
            SessionAction::CancelReconnect => link.reconnect_at = None,
            SessionAction::Publish(state) => {
                info!(status = state.label(), "feed session status");
                if self.events.send(SessionEvent::Status(state)).is_err() {
                    debug!(status = state.label(), "session status dropped, receiver gone");
                }
            }
        }
        None
    }

    fn handle_frame(
        &self,
        frame: Option<Result<Message, tungstenite::Error>>,
    ) -> Option<Failure> {
        let payload = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!("dropping non UTF-8 binary frame");
                    return None;
                }
            },
            Some(Ok(Message::Close(reason))) => {
                info!(?reason, "feed closed the connection");
                return Some(Failure::Closed);
            }
            Some(Ok(_)) => return None,
            Some(Err(error)) => {
                warn!(%error, "feed connection errored");
                return Some(Failure::Errored);
            }
            None => {
                warn!("feed stream ended without a close frame");
                return Some(Failure::Errored);
            }
        };

        let frame = SessionEvent::Frame {
            payload,
            received_at: now_millis(),
        };
        if self.events.send(frame).is_err() {
            debug!("feed frame dropped, receiver gone");
        }
        None
    }
}

async fn next_connect(
    connecting: &mut Option<Connecting>,
) -> Result<FeedStream, tungstenite::Error> {
    match connecting {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    stream: &mut Option<FeedStream>,
) -> Option<Result<Message, tungstenite::Error>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
