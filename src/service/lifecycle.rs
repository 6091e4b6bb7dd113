//! Service orchestration
//!
//! [`ServiceLifecycle`] is the single owner of negotiation state. Capture,
//! signaling and peer backends only talk to it through channels, and its
//! event loop handles one event at a time.

use super::{HostNotification, ServiceError, StopReport};
use crate::capture::{default_devices, CaptureDevice, CaptureError, CaptureEvent, CaptureManager, SourceKind};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::session::{PeerBackendFactory, PeerEvent, PeerSessionController, PendingSignalQueue, WebRtcBackendFactory};
use crate::signaling::{
    AlwaysOnline, Connector, NetworkMonitor, SignalingClient, SignalingEvent, SignalingHandle, SignalingStatus,
    WebSocketConnector,
};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Collaborators the service runs against
pub struct ServiceDeps {
    pub devices: Vec<Arc<dyn CaptureDevice>>,
    pub connector: Arc<dyn Connector>,
    pub network: Arc<dyn NetworkMonitor>,
    pub backends: Arc<dyn PeerBackendFactory>,
    pub clock: Arc<dyn Clock>,
}

impl ServiceDeps {
    /// WebSocket signaling, webrtc-rs peers and RTP track devices
    pub fn production(config: &Config) -> Self {
        Self {
            devices: default_devices(&config.capture.all_sources(), config.capture.video_codec),
            connector: Arc::new(WebSocketConnector::new(config.signaling.connect_timeout())),
            network: Arc::new(AlwaysOnline),
            backends: Arc::new(WebRtcBackendFactory::new(config.webrtc.clone())),
            clock: Arc::new(SystemClock),
        }
    }
}

enum Command {
    Stop(oneshot::Sender<StopReport>),
}

type InitResults = Vec<(SourceKind, Result<(), CaptureError>)>;

/// Host-facing control handle. Cheap to clone.
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::UnboundedSender<Command>,
    signaling: SignalingHandle,
    capture: Arc<CaptureManager>,
    cancel: CancellationToken,
}

impl ServiceHandle {
    /// Tear the service down. Calling it again is a no-op returning an
    /// empty report.
    pub async fn stop(&self) -> StopReport {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Stop(reply_tx)).is_err() {
            debug!("Service already stopped");
            return StopReport::default();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn signaling_status(&self) -> SignalingStatus {
        self.signaling.status()
    }

    pub fn is_source_ready(&self, kind: SourceKind) -> bool {
        self.capture.is_source_ready(kind)
    }

    /// Forward an auxiliary event verbatim. Dropped unless connected.
    pub fn forward(&self, event: &str, data: Value) -> bool {
        if !self.is_running() {
            debug!("Service stopped; dropping '{}' event", event);
            return false;
        }
        self.signaling.send(event, data)
    }

    /// Retry acquiring a source, e.g. after the user granted a permission
    pub async fn grant_source(&self, kind: SourceKind) -> Result<(), ServiceError> {
        if !self.is_running() {
            return Err(ServiceError::NotRunning);
        }
        self.capture.initialize_source(kind).await?;
        Ok(())
    }

    /// Report that a ready source stopped producing
    pub fn mark_source_lost(&self, kind: SourceKind, reason: &str) {
        self.capture.mark_lost(kind, reason);
    }
}

/// Event loop owning the controller
pub struct ServiceLifecycle {
    controller: PeerSessionController,
    signaling: Arc<SignalingClient>,
    capture: Arc<CaptureManager>,
    required: HashSet<SourceKind>,
    notifications: mpsc::UnboundedSender<HostNotification>,
    cancel: CancellationToken,
    init_task: Option<JoinHandle<()>>,
}

impl ServiceLifecycle {
    /// Validate the configuration, start capture and signaling, and spawn
    /// the event loop. Must be called inside a tokio runtime.
    pub fn start(
        config: Config,
        deps: ServiceDeps,
    ) -> Result<(ServiceHandle, mpsc::UnboundedReceiver<HostNotification>), ServiceError> {
        config.validate()?;

        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let capture = Arc::new(CaptureManager::new(deps.devices, capture_tx));
        let signaling = Arc::new(SignalingClient::new(
            &config.signaling,
            deps.connector,
            deps.network,
            signaling_tx,
        ));
        let signaling_handle = signaling.handle();

        let controller = PeerSessionController::new(
            deps.backends,
            Arc::new(signaling_handle.clone()),
            capture.clone(),
            config.capture.gating_set(),
            PendingSignalQueue::new(config.negotiation.pending_ttl(), deps.clock),
            peer_tx,
        );

        let kinds = config.capture.all_sources();
        info!(
            "Starting service: sources {:?}, signaling {}",
            kinds, config.signaling.url
        );

        let init_capture = capture.clone();
        let init_task = tokio::spawn(async move {
            let results = init_capture.initialize_all(&kinds).await;
            let _ = init_tx.send(results);
        });
        signaling.connect();

        let cancel = CancellationToken::new();
        let lifecycle = ServiceLifecycle {
            controller,
            signaling,
            capture: capture.clone(),
            required: config.capture.required.iter().copied().collect(),
            notifications: notify_tx,
            cancel: cancel.clone(),
            init_task: Some(init_task),
        };
        tokio::spawn(lifecycle.run(command_rx, capture_rx, signaling_rx, peer_rx, init_rx));

        let handle = ServiceHandle {
            commands: command_tx,
            signaling: signaling_handle,
            capture,
            cancel,
        };
        Ok((handle, notify_rx))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
        mut signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
        mut init_rx: mpsc::UnboundedReceiver<InitResults>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => {
                    let reply = match command {
                        Some(Command::Stop(reply)) => Some(reply),
                        None => None,
                    };
                    let report = self.teardown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(report);
                    }
                    break;
                }
                Some(results) = init_rx.recv() => {
                    if self.on_capture_initialized(results) {
                        let report = self.teardown().await;
                        if !report.is_clean() {
                            warn!("Teardown after fatal capture failure reported {} errors", report.errors.len());
                        }
                        break;
                    }
                }
                Some(event) = capture_rx.recv() => {
                    match &event {
                        CaptureEvent::SourceReady(kind) => debug!("Capture source {} became ready", kind),
                        CaptureEvent::SourceFailed { kind, reason } => debug!("Capture source {} not ready: {}", kind, reason),
                    }
                    self.controller.on_sources_changed().await;
                }
                Some(event) = signaling_rx.recv() => self.on_signaling_event(event).await,
                Some(event) = peer_rx.recv() => self.controller.on_peer_event(event).await,
            }
        }
        info!("Service event loop stopped");
    }

    /// Returns true when the failure is fatal
    fn on_capture_initialized(&mut self, results: InitResults) -> bool {
        let failed: Vec<SourceKind> = results
            .iter()
            .filter(|(kind, result)| result.is_err() && self.required.contains(kind))
            .map(|(kind, _)| *kind)
            .collect();
        let ready = results.iter().filter(|(_, result)| result.is_ok()).count();
        info!("Capture initialized: {}/{} sources ready", ready, results.len());

        if failed.is_empty() {
            return false;
        }

        let fatal = !self.required.iter().any(|kind| self.capture.is_source_ready(*kind));
        if fatal {
            error!("No required capture source could be acquired; stopping");
        } else {
            warn!("Required capture sources unavailable: {:?}", failed);
        }
        let _ = self.notifications.send(HostNotification::PermissionOrCaptureError {
            sources: failed,
            fatal,
        });
        fatal
    }

    async fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => debug!("Signaling connected"),
            SignalingEvent::ConnectError(reason) => debug!("Signaling connect error: {}", reason),
            SignalingEvent::Disconnected(reason) => {
                debug!("Signaling disconnected: {}", reason);
                self.controller.on_signaling_lost().await;
            }
            SignalingEvent::ViewerReady(viewer_id) => {
                info!("Viewer {} ready", viewer_id);
                self.controller.on_viewer_ready(&viewer_id).await;
            }
            SignalingEvent::ViewerDisconnected(viewer_id) => {
                info!("Viewer {} disconnected", viewer_id);
                self.controller.on_viewer_disconnected(&viewer_id).await;
            }
            SignalingEvent::Signal { viewer_id, payload } => {
                self.controller.on_signal(&viewer_id, payload).await;
            }
            SignalingEvent::Unavailable { attempts } => {
                let _ = self
                    .notifications
                    .send(HostNotification::SignalingUnavailable { attempts });
            }
        }
    }

    /// Every step runs regardless of earlier failures
    async fn teardown(&mut self) -> StopReport {
        info!("Stopping service");
        self.cancel.cancel();
        let mut report = StopReport::default();

        if let Err(e) = self.controller.shutdown().await {
            report.errors.push(e.into());
        }

        self.signaling.disconnect().await;

        if let Some(task) = self.init_task.take() {
            task.abort();
        }
        for e in self.capture.shutdown_all().await {
            report.errors.push(e.into());
        }

        if report.is_clean() {
            info!("Service stopped");
        } else {
            warn!("Service stopped with {} errors", report.errors.len());
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::manager::tests::{BrokenDevice, CountingDevice};
    use crate::capture::{RtpTrackDevice, TrackHandle};
    use crate::clock::ManualClock;
    use crate::config::VideoCodec;
    use crate::session::controller::tests::FakeFactory;
    use crate::signaling::client::tests::{Outcome, ScriptedConnector, ServerEnd};
    use crate::signaling::LinkMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Refuses to acquire until the user grants permission
    struct PermissionDevice {
        inner: RtpTrackDevice,
        granted: AtomicBool,
    }

    impl PermissionDevice {
        fn new(kind: SourceKind) -> Self {
            Self {
                inner: RtpTrackDevice::new(kind, VideoCodec::VP8),
                granted: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl CaptureDevice for PermissionDevice {
        fn kind(&self) -> SourceKind {
            self.inner.kind()
        }

        async fn acquire(&self) -> Result<TrackHandle, CaptureError> {
            if !self.granted.load(Ordering::SeqCst) {
                return Err(CaptureError::Unavailable {
                    kind: self.inner.kind(),
                    reason: "permission denied".to_string(),
                });
            }
            self.inner.acquire().await
        }

        async fn release(&self) -> Result<(), CaptureError> {
            self.inner.release().await
        }
    }

    fn config(required: &[SourceKind], optional: &[SourceKind]) -> Config {
        let mut config = Config::default();
        config.capture.required = required.to_vec();
        config.capture.optional = optional.to_vec();
        config
    }

    fn deps(devices: Vec<Arc<dyn CaptureDevice>>, connector: Arc<ScriptedConnector>) -> ServiceDeps {
        ServiceDeps {
            devices,
            connector,
            network: Arc::new(AlwaysOnline),
            backends: Arc::new(FakeFactory::default()),
            clock: Arc::new(ManualClock::new()),
        }
    }

    async fn wait_for_server(connector: &ScriptedConnector) -> ServerEnd {
        loop {
            if let Some(server) = connector.take_server() {
                return server;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next_frame(server: &mut ServerEnd) -> Value {
        let text = server.from_client.recv().await.unwrap();
        serde_json::from_str(&text).unwrap()
    }

    async fn next_offer(server: &mut ServerEnd) -> Value {
        let frame = next_frame(server).await;
        assert_eq!(frame["event"], "signal");
        assert_eq!(frame["data"]["signal"]["type"], "offer");
        frame
    }

    #[tokio::test(start_paused = true)]
    async fn viewer_gets_one_offer_end_to_end() {
        let connector = Arc::new(ScriptedConnector::new(vec![Outcome::Accept]));
        let camera: Arc<dyn CaptureDevice> = Arc::new(RtpTrackDevice::new(SourceKind::Camera, VideoCodec::VP8));
        let (handle, _notifications) = ServiceLifecycle::start(
            config(&[SourceKind::Camera], &[]),
            deps(vec![camera], connector.clone()),
        )
        .unwrap();

        let mut server = wait_for_server(&connector).await;
        assert_eq!(next_frame(&mut server).await["event"], "identify");

        server.push(r#"{"event":"id","data":"pub-1"}"#);
        server.push(r#"{"event":"web-client-ready","data":"v1"}"#);
        server.push(r#"{"event":"web-client-ready","data":"v1"}"#);

        let offer = next_frame(&mut server).await;
        assert_eq!(offer["event"], "signal");
        assert_eq!(offer["data"]["to"], "v1");
        assert_eq!(offer["data"]["from"], "pub-1");
        assert_eq!(offer["data"]["signal"]["type"], "offer");
        assert!(offer["data"]["signal"]["sdp"].as_str().unwrap().contains("a=sendonly"));

        assert!(handle.forward("battery", serde_json::json!({"level": 80})));
        let forwarded = next_frame(&mut server).await;
        assert_eq!(forwarded["event"], "battery");
        assert_eq!(forwarded["data"]["level"], 80);

        let report = handle.stop().await;
        assert!(report.is_clean());
        assert!(!handle.is_running());
        assert!(!handle.forward("battery", serde_json::json!({})));
    }

    #[tokio::test(start_paused = true)]
    async fn viewer_is_offered_again_after_signaling_reconnect() {
        let connector = Arc::new(ScriptedConnector::new(vec![Outcome::Accept, Outcome::Accept]));
        let camera: Arc<dyn CaptureDevice> = Arc::new(RtpTrackDevice::new(SourceKind::Camera, VideoCodec::VP8));
        let (handle, _notifications) = ServiceLifecycle::start(
            config(&[SourceKind::Camera], &[]),
            deps(vec![camera], connector.clone()),
        )
        .unwrap();

        let mut first = wait_for_server(&connector).await;
        assert_eq!(next_frame(&mut first).await["event"], "identify");
        first.push(r#"{"event":"id","data":"pub-1"}"#);
        first.push(r#"{"event":"web-client-ready","data":"v1"}"#);
        let offer = next_offer(&mut first).await;
        assert_eq!(offer["data"]["to"], "v1");
        assert_eq!(offer["data"]["from"], "pub-1");

        let _ = first.to_client.send(LinkMessage::Closed("server restart".to_string()));

        let mut second = wait_for_server(&connector).await;
        assert_eq!(next_frame(&mut second).await["event"], "identify");
        second.push(r#"{"event":"id","data":"pub-2"}"#);
        second.push(r#"{"event":"web-client-ready","data":"v1"}"#);
        let offer = next_offer(&mut second).await;
        assert_eq!(offer["data"]["to"], "v1");
        assert_eq!(offer["data"]["from"], "pub-2");

        assert_eq!(connector.call_count(), 2);
        assert!(handle.stop().await.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn granted_and_lost_sources_renegotiate_live_session() {
        let connector = Arc::new(ScriptedConnector::new(vec![Outcome::Accept]));
        let mic = Arc::new(PermissionDevice::new(SourceKind::Microphone));
        let devices: Vec<Arc<dyn CaptureDevice>> = vec![
            Arc::new(RtpTrackDevice::new(SourceKind::Camera, VideoCodec::VP8)),
            mic.clone(),
        ];
        let (handle, _notifications) = ServiceLifecycle::start(
            config(&[SourceKind::Camera], &[SourceKind::Microphone]),
            deps(devices, connector.clone()),
        )
        .unwrap();

        let mut server = wait_for_server(&connector).await;
        assert_eq!(next_frame(&mut server).await["event"], "identify");
        server.push(r#"{"event":"id","data":"pub-1"}"#);
        server.push(r#"{"event":"web-client-ready","data":"v1"}"#);
        assert_eq!(next_offer(&mut server).await["data"]["to"], "v1");
        assert!(!handle.is_source_ready(SourceKind::Microphone));

        let answer = r#"{"event":"signal","data":{"to":"pub-1","from":"v1","signal":{"type":"answer","sdp":"v=0"}}}"#;
        server.push(answer);

        mic.granted.store(true, Ordering::SeqCst);
        handle.grant_source(SourceKind::Microphone).await.unwrap();
        assert!(handle.is_source_ready(SourceKind::Microphone));
        assert_eq!(next_offer(&mut server).await["data"]["to"], "v1");

        server.push(answer);
        handle.mark_source_lost(SourceKind::Microphone, "permission revoked");
        assert_eq!(next_offer(&mut server).await["data"]["to"], "v1");

        assert!(handle.stop().await.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_twice_releases_once() {
        let connector = Arc::new(ScriptedConnector::new(vec![Outcome::Accept]));
        let camera = Arc::new(CountingDevice::new(SourceKind::Camera));
        let devices: Vec<Arc<dyn CaptureDevice>> = vec![camera.clone()];
        let (handle, _notifications) = ServiceLifecycle::start(
            config(&[SourceKind::Camera], &[]),
            deps(devices, connector.clone()),
        )
        .unwrap();

        while !handle.is_source_ready(SourceKind::Camera) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(handle.stop().await.is_clean());
        assert!(handle.stop().await.is_clean());
        assert_eq!(camera.releases.load(Ordering::SeqCst), 1);
        assert!(matches!(
            handle.grant_source(SourceKind::Camera).await,
            Err(ServiceError::NotRunning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_required_source_is_reported_but_not_fatal() {
        let connector = Arc::new(ScriptedConnector::new(vec![Outcome::Accept]));
        let devices: Vec<Arc<dyn CaptureDevice>> = vec![
            Arc::new(BrokenDevice { kind: SourceKind::Camera }),
            Arc::new(CountingDevice::new(SourceKind::Microphone)),
        ];
        let (handle, mut notifications) = ServiceLifecycle::start(
            config(&[SourceKind::Camera, SourceKind::Microphone], &[]),
            deps(devices, connector),
        )
        .unwrap();

        assert_eq!(
            notifications.recv().await.unwrap(),
            HostNotification::PermissionOrCaptureError {
                sources: vec![SourceKind::Camera],
                fatal: false,
            }
        );
        assert!(handle.is_running());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_required_source_stops_the_service() {
        let connector = Arc::new(ScriptedConnector::new(vec![Outcome::Accept]));
        let screen = Arc::new(CountingDevice::new(SourceKind::Screen));
        let devices: Vec<Arc<dyn CaptureDevice>> = vec![
            Arc::new(BrokenDevice { kind: SourceKind::Camera }),
            screen.clone(),
        ];
        let (handle, mut notifications) = ServiceLifecycle::start(
            config(&[SourceKind::Camera], &[SourceKind::Screen]),
            deps(devices, connector),
        )
        .unwrap();

        assert_eq!(
            notifications.recv().await.unwrap(),
            HostNotification::PermissionOrCaptureError {
                sources: vec![SourceKind::Camera],
                fatal: true,
            }
        );
        while handle.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.stop().await.is_clean());
        while screen.releases.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(screen.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_signaling_is_surfaced_once() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let camera: Arc<dyn CaptureDevice> = Arc::new(RtpTrackDevice::new(SourceKind::Camera, VideoCodec::VP8));
        let (handle, mut notifications) = ServiceLifecycle::start(
            config(&[SourceKind::Camera], &[]),
            deps(vec![camera], connector.clone()),
        )
        .unwrap();

        assert_eq!(
            notifications.recv().await.unwrap(),
            HostNotification::SignalingUnavailable { attempts: 10 }
        );
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(notifications.try_recv().is_err());
        assert_eq!(connector.call_count(), 11);
        assert!(!handle.forward("battery", serde_json::json!({})));
        assert!(handle.stop().await.is_clean());
    }

    #[test]
    fn invalid_config_is_rejected_before_anything_starts() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let connector = Arc::new(ScriptedConnector::new(vec![]));
            let result = ServiceLifecycle::start(config(&[], &[]), deps(vec![], connector.clone()));
            assert!(matches!(result, Err(ServiceError::Config(_))));
            assert_eq!(connector.call_count(), 0);
        });
    }
}
