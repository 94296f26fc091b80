mod events;
mod tracker;
mod worker;

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::feed::{
    CanonicalUpdate, SessionCommand, SessionConfig, SessionEvent, SessionHandle, SessionState,
    parse_frame, spawn_session,
};
use crate::graph::{GraphPayload, build_graph};
use crate::layout::{LayoutConfig, LayoutEngine, LayoutFrame};
use crate::util::wait_until;
use crate::window::{DEFAULT_WINDOW_LIMIT, UpdateWindow};

pub use events::{PipelineCommand, RendererEvent, UnknownCommand};
use tracker::{RebuildThrottle, RequestTracker, Throttled};
use worker::{Job, Tagged, Worker};

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub session: SessionConfig,
    pub layout: LayoutConfig,
    pub window_limit: usize,
    /// Zero builds on every batch.
    pub rebuild_delay: Duration,
    /// Presence selects the durable window.
    pub store: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            layout: LayoutConfig::default(),
            window_limit: DEFAULT_WINDOW_LIMIT,
            rebuild_delay: Duration::from_millis(1500),
            store: None,
        }
    }
}

/// The whole current window; the aggregator always recomputes from scratch.
struct BuildRequest(Vec<CanonicalUpdate>);

impl Job for BuildRequest {}

struct LayoutRequest {
    graph: GraphPayload,
    reset: bool,
}

impl Job for LayoutRequest {
    fn supersede(self, newer: Self) -> Self {
        LayoutRequest {
            graph: newer.graph,
            reset: self.reset || newer.reset,
        }
    }
}

struct LaidOut {
    graph: GraphPayload,
    frame: LayoutFrame,
}

struct Workers {
    aggregator: Worker<BuildRequest>,
    layout: Worker<LayoutRequest>,
}

fn spawn_workers(
    layout_config: LayoutConfig,
    built: mpsc::UnboundedSender<Tagged<GraphPayload>>,
    laid_out: mpsc::UnboundedSender<Tagged<LaidOut>>,
) -> Result<Workers, WorkerError> {
    let aggregator = Worker::spawn(
        "aggregator",
        |request: BuildRequest| build_graph(&request.0),
        built,
    )?;

    let mut engine = LayoutEngine::new(layout_config);
    let layout = Worker::spawn(
        "layout",
        move |request: LayoutRequest| {
            if request.reset {
                engine.reset();
            }
            let frame = engine.layout(&request.graph);
            LaidOut {
                graph: request.graph,
                frame,
            }
        },
        laid_out,
    )?;

    Ok(Workers { aggregator, layout })
}

/// Runs until `quit` or until the command stream ends. Every failure along
/// the way is reported on `events`; none of them ends the loop.
pub async fn run(
    config: PipelineConfig,
    mut commands: mpsc::UnboundedReceiver<PipelineCommand>,
    events: mpsc::UnboundedSender<RendererEvent>,
) {
    let mut pipeline = Pipeline::start(&config, events).await;
    let mut feed = FeedLink::spawn(config.session.clone());

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PipelineCommand::Quit) | None => break,
                Some(command) => pipeline.on_command(command, &mut feed).await,
            },
            event = feed.events.recv(), if feed.alive => match event {
                Some(event) => pipeline.on_session_event(event).await,
                None => {
                    feed.alive = false;
                    pipeline.on_session_lost();
                }
            },
            built = pipeline.built.recv(), if pipeline.workers.is_some() => {
                pipeline.on_aggregator_reply(built);
            }
            laid_out = pipeline.laid_out.recv(), if pipeline.workers.is_some() => {
                pipeline.on_layout_reply(laid_out);
            }
            () = wait_until(pipeline.throttle.deadline()) => {
                if pipeline.throttle.fire() {
                    pipeline.request_build().await;
                }
            }
        }
    }

    feed.send(SessionCommand::Stop);
    info!("pipeline stopped");
}

/// The ingestion session as seen from the pipeline. A session task that ends
/// on its own is respawned by the next `start` or `reconnect`.
struct FeedLink {
    config: SessionConfig,
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    alive: bool,
}

impl FeedLink {
    fn spawn(config: SessionConfig) -> Self {
        let (handle, events) = spawn_session(config.clone());
        Self {
            config,
            handle,
            events,
            alive: true,
        }
    }

    fn send(&mut self, command: SessionCommand) {
        if !self.alive && command != SessionCommand::Stop {
            info!(?command, "respawning feed session");
            *self = Self::spawn(self.config.clone());
            return;
        }
        self.handle.send(command);
    }
}

struct Pipeline {
    window: UpdateWindow,
    workers: Option<Workers>,
    built: mpsc::UnboundedReceiver<Tagged<GraphPayload>>,
    laid_out: mpsc::UnboundedReceiver<Tagged<LaidOut>>,
    requests: RequestTracker,
    throttle: RebuildThrottle,
    reset_layout: bool,
    fit_pending: bool,
    degraded: bool,
    events: mpsc::UnboundedSender<RendererEvent>,
}

impl Pipeline {
    async fn start(config: &PipelineConfig, events: mpsc::UnboundedSender<RendererEvent>) -> Self {
        let window = match &config.store {
            Some(path) => match UpdateWindow::durable(path, config.window_limit).await {
                Ok(window) => window,
                Err(err) => {
                    warn!(path = %path.display(), %err, "durable window unavailable, keeping updates in memory");
                    if events.send(RendererEvent::error(&err)).is_err() {
                        debug!("renderer stream closed");
                    }
                    UpdateWindow::in_memory(config.window_limit)
                }
            },
            None => UpdateWindow::in_memory(config.window_limit),
        };

        let (built_tx, built) = mpsc::unbounded_channel();
        let (laid_out_tx, laid_out) = mpsc::unbounded_channel();
        let workers = spawn_workers(config.layout.clone(), built_tx, laid_out_tx);

        let mut pipeline = Self::assemble(
            window,
            workers,
            built,
            laid_out,
            config.rebuild_delay,
            events,
        );
        if pipeline.window.is_durable() {
            pipeline.request_build().await;
        }
        pipeline
    }

    fn assemble(
        window: UpdateWindow,
        workers: Result<Workers, WorkerError>,
        built: mpsc::UnboundedReceiver<Tagged<GraphPayload>>,
        laid_out: mpsc::UnboundedReceiver<Tagged<LaidOut>>,
        rebuild_delay: Duration,
        events: mpsc::UnboundedSender<RendererEvent>,
    ) -> Self {
        let mut pipeline = Self {
            window,
            workers: None,
            built,
            laid_out,
            requests: RequestTracker::default(),
            throttle: RebuildThrottle::new(rebuild_delay),
            reset_layout: false,
            fit_pending: true,
            degraded: false,
            events,
        };
        match workers {
            Ok(workers) => pipeline.workers = Some(workers),
            Err(err) => pipeline.degrade(err),
        }
        pipeline
    }

    fn emit(&self, event: RendererEvent) {
        if self.events.send(event).is_err() {
            debug!("renderer stream closed");
        }
    }

    async fn on_command(&mut self, command: PipelineCommand, feed: &mut FeedLink) {
        match command {
            PipelineCommand::Start => feed.send(SessionCommand::Start),
            PipelineCommand::Stop => feed.send(SessionCommand::Stop),
            PipelineCommand::Reconnect => feed.send(SessionCommand::Reconnect),
            PipelineCommand::Clear => self.clear().await,
            PipelineCommand::Quit => {}
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Status(status) => self.emit(RendererEvent::Status { status }),
            SessionEvent::Frame {
                payload,
                received_at,
            } => self.on_frame(&payload, received_at).await,
        }
    }

    fn on_session_lost(&self) {
        error!("feed session ended unexpectedly");
        self.emit(RendererEvent::Status {
            status: SessionState::Errored,
        });
        self.emit(RendererEvent::error(
            "feed session ended unexpectedly; send `start` or `reconnect` to restart it",
        ));
    }

    async fn on_frame(&mut self, payload: &str, received_at: i64) {
        let batch = match parse_frame(payload, received_at) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(%err, "discarding feed frame");
                self.emit(RendererEvent::error(&err));
                return;
            }
        };
        if batch.is_empty() {
            debug!("frame carried no updates");
            return;
        }

        debug!(updates = batch.len(), "appending batch to window");
        if let Err(err) = self.window.append(batch).await {
            warn!(%err, "could not persist batch");
            self.emit(RendererEvent::error(&err));
        }

        match self.throttle.note_update(Instant::now()) {
            Throttled::BuildNow => self.request_build().await,
            Throttled::Armed => debug!("rebuild scheduled"),
            Throttled::AlreadyArmed => {}
        }
    }

    async fn clear(&mut self) {
        info!("clearing update window");
        if let Err(err) = self.window.clear().await {
            warn!(%err, "could not clear durable window");
            self.emit(RendererEvent::error(&err));
        }
        self.reset_layout = true;
        self.fit_pending = true;
        self.request_build().await;
    }

    /// Issues a build against the latest window contents.
    async fn request_build(&mut self) {
        self.throttle.cancel();
        let updates = self.snapshot().await;
        let request_id = self.requests.issue();

        let Some(workers) = &self.workers else {
            self.publish_empty(request_id);
            return;
        };
        if let Err(err) = workers.aggregator.submit(request_id, BuildRequest(updates)) {
            self.degrade(err);
        }
    }

    async fn snapshot(&self) -> Vec<CanonicalUpdate> {
        match self.window.current().await {
            Ok(updates) => updates,
            Err(err) => {
                warn!(%err, "reading durable window failed, using in-memory copy");
                self.emit(RendererEvent::error(&err));
                self.window.fallback()
            }
        }
    }

    fn on_built(&mut self, response: Tagged<GraphPayload>) {
        if !self.requests.is_current(response.request_id) {
            debug!(
                request_id = response.request_id,
                latest = self.requests.latest(),
                "stale graph dropped"
            );
            return;
        }
        let Some(workers) = &self.workers else {
            return;
        };

        let request = LayoutRequest {
            graph: response.payload,
            reset: std::mem::take(&mut self.reset_layout),
        };
        if let Err(err) = workers.layout.submit(response.request_id, request) {
            self.degrade(err);
        }
    }

    fn on_aggregator_reply(&mut self, reply: Option<Tagged<GraphPayload>>) {
        match reply {
            Some(response) => self.on_built(response),
            None => self.degrade(WorkerError::Gone { name: "aggregator" }),
        }
    }

    fn on_layout_reply(&mut self, reply: Option<Tagged<LaidOut>>) {
        match reply {
            Some(response) => self.on_laid_out(response),
            None => self.degrade(WorkerError::Gone { name: "layout" }),
        }
    }

    fn on_laid_out(&mut self, response: Tagged<LaidOut>) {
        if !self.requests.is_current(response.request_id) {
            debug!(request_id = response.request_id, "stale layout dropped");
            return;
        }
        let LaidOut { graph, mut frame } = response.payload;
        if !graph.nodes.is_empty() {
            frame.fit_viewport = std::mem::take(&mut self.fit_pending);
        }
        debug!(
            request_id = response.request_id,
            nodes = graph.nodes.len(),
            links = graph.links.len(),
            iterations = frame.iterations,
            "graph published"
        );
        self.emit(RendererEvent::Graph {
            request_id: response.request_id,
            graph,
            layout: frame,
        });
    }

    fn publish_empty(&self, request_id: u64) {
        self.emit(RendererEvent::Graph {
            request_id,
            graph: GraphPayload::default(),
            layout: LayoutFrame::default(),
        });
    }

    /// Without both workers no graph can be computed again until restart. The
    /// request in flight, if any, resolves to an empty graph.
    fn degrade(&mut self, err: WorkerError) {
        self.workers = None;
        if std::mem::replace(&mut self.degraded, true) {
            return;
        }
        error!(%err, "graph pipeline degraded, publishing empty graphs");
        self.emit(RendererEvent::error(format!(
            "graph updates unavailable until restart: {err}"
        )));
        if self.requests.latest() > 0 {
            self.publish_empty(self.requests.latest());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::graph::NodeType;

    const FRAME: &str = r#"{
        "type": "ris_message",
        "data": {
            "timestamp": 1700000000.5,
            "peer": "192.0.2.1",
            "peer_asn": 65000,
            "host": "rrc00",
            "path": [65000, 64500],
            "announcements": [{"next_hop": "192.0.2.254", "prefixes": ["203.0.113.0/24"]}],
            "withdrawals": ["198.51.100.0/24"]
        }
    }"#;

    fn pipeline(
        workers: bool,
        rebuild_delay: Duration,
    ) -> (Pipeline, mpsc::UnboundedReceiver<RendererEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (built_tx, built) = mpsc::unbounded_channel();
        let (laid_out_tx, laid_out) = mpsc::unbounded_channel();
        let workers = if workers {
            spawn_workers(LayoutConfig::default(), built_tx, laid_out_tx)
        } else {
            Err(WorkerError::Spawn {
                name: "aggregator",
                source: io::Error::other("threads unavailable"),
            })
        };
        let pipeline = Pipeline::assemble(
            UpdateWindow::in_memory(DEFAULT_WINDOW_LIMIT),
            workers,
            built,
            laid_out,
            rebuild_delay,
            events,
        );
        (pipeline, rx)
    }

    async fn settle(pipeline: &mut Pipeline) {
        let built = pipeline.built.recv().await.unwrap();
        pipeline.on_built(built);
        let laid_out = pipeline.laid_out.recv().await.unwrap();
        pipeline.on_laid_out(laid_out);
    }

    #[tokio::test]
    async fn frame_flows_through_to_a_laid_out_graph() {
        let (mut pipeline, mut events) = pipeline(true, Duration::ZERO);
        pipeline
            .on_session_event(SessionEvent::Frame {
                payload: FRAME.to_owned(),
                received_at: 1,
            })
            .await;
        settle(&mut pipeline).await;

        let Some(RendererEvent::Graph {
            request_id,
            graph,
            layout,
        }) = events.recv().await
        else {
            panic!("expected a graph event");
        };
        assert_eq!(request_id, 1);
        assert_eq!(graph.nodes.len(), 4);
        assert!(
            graph
                .nodes
                .iter()
                .any(|node| node.node_type == NodeType::Origin && node.label == "AS64500")
        );
        assert_eq!(layout.positions.len(), 4);
        assert!(layout.fit_viewport);
    }

    #[tokio::test]
    async fn status_changes_are_forwarded() {
        let (mut pipeline, mut events) = pipeline(true, Duration::ZERO);
        pipeline
            .on_session_event(SessionEvent::Status(SessionState::Connected))
            .await;
        assert_eq!(
            events.recv().await,
            Some(RendererEvent::Status {
                status: SessionState::Connected
            })
        );
    }

    #[tokio::test]
    async fn malformed_frame_reports_and_continues() {
        let (mut pipeline, mut events) = pipeline(true, Duration::ZERO);
        pipeline.on_frame("{not json", 1).await;
        assert!(matches!(events.recv().await, Some(RendererEvent::Error { .. })));
        assert!(pipeline.window.is_empty());

        pipeline.on_frame(FRAME, 2).await;
        settle(&mut pipeline).await;
        assert!(matches!(events.recv().await, Some(RendererEvent::Graph { .. })));
    }

    #[tokio::test]
    async fn stale_build_response_is_dropped() {
        let (mut pipeline, mut events) = pipeline(true, Duration::ZERO);
        let first = pipeline.requests.issue();
        let second = pipeline.requests.issue();

        pipeline.on_built(Tagged {
            request_id: first,
            payload: GraphPayload::default(),
        });
        pipeline.on_laid_out(Tagged {
            request_id: first,
            payload: LaidOut {
                graph: GraphPayload::default(),
                frame: LayoutFrame::default(),
            },
        });
        assert!(events.try_recv().is_err());

        pipeline.on_built(Tagged {
            request_id: second,
            payload: GraphPayload::default(),
        });
        let laid_out = pipeline.laid_out.recv().await.unwrap();
        assert_eq!(laid_out.request_id, second);
        pipeline.on_laid_out(laid_out);
        assert!(matches!(
            events.recv().await,
            Some(RendererEvent::Graph { request_id, .. }) if request_id == second
        ));
    }

    #[tokio::test]
    async fn throttled_batches_wait_for_the_timer() {
        let (mut pipeline, mut events) = pipeline(true, Duration::from_secs(60));
        pipeline.on_frame(FRAME, 1).await;
        pipeline.on_frame(FRAME, 2).await;

        assert!(pipeline.throttle.deadline().is_some());
        assert_eq!(pipeline.requests.latest(), 0);
        assert!(events.try_recv().is_err());

        assert!(pipeline.throttle.fire());
        pipeline.request_build().await;
        settle(&mut pipeline).await;
        assert!(matches!(
            events.recv().await,
            Some(RendererEvent::Graph { request_id: 1, .. })
        ));
    }

    #[tokio::test]
    async fn clear_builds_immediately_and_resets_layout() {
        let (mut pipeline, mut events) = pipeline(true, Duration::from_secs(60));
        pipeline.on_frame(FRAME, 1).await;
        pipeline.throttle.fire();
        pipeline.request_build().await;
        settle(&mut pipeline).await;
        events.recv().await.unwrap();

        pipeline.on_frame(FRAME, 2).await;
        pipeline.clear().await;
        assert_eq!(pipeline.throttle.deadline(), None);
        settle(&mut pipeline).await;

        let Some(RendererEvent::Graph { graph, layout, .. }) = events.recv().await else {
            panic!("expected a graph event");
        };
        assert!(graph.is_empty());
        assert!(layout.positions.is_empty());

        pipeline.on_frame(FRAME, 3).await;
        pipeline.request_build().await;
        settle(&mut pipeline).await;
        let Some(RendererEvent::Graph { layout, .. }) = events.recv().await else {
            panic!("expected a graph event");
        };
        assert!(layout.fit_viewport);
    }

    #[tokio::test]
    async fn missing_workers_degrade_to_empty_graphs() {
        let (mut pipeline, mut events) = pipeline(false, Duration::ZERO);
        let Some(RendererEvent::Error { message }) = events.recv().await else {
            panic!("expected a degraded-mode error");
        };
        assert!(message.contains("aggregator"));

        pipeline.on_frame(FRAME, 1).await;
        assert_eq!(
            events.recv().await,
            Some(RendererEvent::Graph {
                request_id: 1,
                graph: GraphPayload::default(),
                layout: LayoutFrame::default(),
            })
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn viewport_fit_survives_a_superseded_layout() {
        let (mut pipeline, mut events) = pipeline(true, Duration::ZERO);
        pipeline.on_frame(FRAME, 1).await;
        let first = pipeline.built.recv().await.unwrap();
        pipeline.on_built(first);

        pipeline.on_frame(FRAME, 2).await;
        let stale = pipeline.laid_out.recv().await.unwrap();
        assert_eq!(stale.request_id, 1);
        pipeline.on_laid_out(stale);
        assert!(events.try_recv().is_err());

        settle(&mut pipeline).await;
        let Some(RendererEvent::Graph {
            request_id, layout, ..
        }) = events.recv().await
        else {
            panic!("expected a graph event");
        };
        assert_eq!(request_id, 2);
        assert!(layout.fit_viewport);

        pipeline.on_frame(FRAME, 3).await;
        settle(&mut pipeline).await;
        let Some(RendererEvent::Graph { layout, .. }) = events.recv().await else {
            panic!("expected a graph event");
        };
        assert!(!layout.fit_viewport);
    }

    #[tokio::test]
    async fn dead_aggregator_resolves_the_latest_request_to_an_empty_graph() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let (built_tx, built) = mpsc::unbounded_channel();
        let (laid_out_tx, laid_out) = mpsc::unbounded_channel();
        let aggregator = Worker::spawn(
            "aggregator",
            |_: BuildRequest| -> GraphPayload { panic!("aggregation failed") },
            built_tx,
        )
        .unwrap();
        let layout = Worker::spawn(
            "layout",
            |request: LayoutRequest| LaidOut {
                graph: request.graph,
                frame: LayoutFrame::default(),
            },
            laid_out_tx,
        )
        .unwrap();
        let mut pipeline = Pipeline::assemble(
            UpdateWindow::in_memory(DEFAULT_WINDOW_LIMIT),
            Ok(Workers { aggregator, layout }),
            built,
            laid_out,
            Duration::ZERO,
            events,
        );

        pipeline.on_frame(FRAME, 1).await;
        let reply = pipeline.built.recv().await;
        assert!(reply.is_none());
        pipeline.on_aggregator_reply(reply);

        let Some(RendererEvent::Error { message }) = rx.recv().await else {
            panic!("expected a degraded-mode error");
        };
        assert!(message.contains("aggregator"));
        assert_eq!(
            rx.recv().await,
            Some(RendererEvent::Graph {
                request_id: 1,
                graph: GraphPayload::default(),
                layout: LayoutFrame::default(),
            })
        );

        pipeline.on_frame(FRAME, 2).await;
        assert!(matches!(
            rx.recv().await,
            Some(RendererEvent::Graph { request_id: 2, .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lost_session_is_reported() {
        let (pipeline, mut events) = pipeline(true, Duration::ZERO);
        pipeline.on_session_lost();
        assert_eq!(
            events.recv().await,
            Some(RendererEvent::Status {
                status: SessionState::Errored
            })
        );
        let Some(RendererEvent::Error { message }) = events.recv().await else {
            panic!("expected an error event");
        };
        assert!(message.contains("start"));
    }

    #[tokio::test]
    async fn dead_feed_link_respawns_on_start() {
        let config = SessionConfig {
            endpoint: "ws://127.0.0.1:9/".to_owned(),
            reconnect_delay: Duration::from_secs(60),
            ..SessionConfig::default()
        };
        let mut feed = FeedLink::spawn(config);
        feed.alive = false;

        feed.send(SessionCommand::Stop);
        assert!(!feed.alive);

        feed.send(SessionCommand::Start);
        assert!(feed.alive);
        assert_eq!(
            feed.events.recv().await,
            Some(SessionEvent::Status(SessionState::Connecting))
        );
        feed.send(SessionCommand::Stop);
    }

    #[tokio::test]
    async fn durable_start_replays_stored_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window.sqlite");
        {
            let mut window = UpdateWindow::durable(&path, DEFAULT_WINDOW_LIMIT).await.unwrap();
            let batch = parse_frame(FRAME, 1).unwrap();
            window.append(batch).await.unwrap();
        }

        let config = PipelineConfig {
            store: Some(path),
            ..PipelineConfig::default()
        };
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = Pipeline::start(&config, events).await;
        settle(&mut pipeline).await;

        let Some(RendererEvent::Graph { graph, .. }) = rx.recv().await else {
            panic!("expected a replayed graph");
        };
        assert_eq!(graph.nodes.len(), 4);
    }
}
