//! Connection resource management for the pairchat runtime
//!
//! `ConnectionResources` owns everything tied to one session's negotiated
//! connection object: the ordered worker that issues every call on it, the
//! attached `TrackSet`, the remote `CandidateBuffer`, and the teardown sequence.
//! Results of asynchronous calls come back to the controller as epoch-tagged
//! `EngineEvent`s, so nothing produced for a torn-down session can touch a
//! newer one.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashSet;
use pairchat_core::{
    channel::EngineEventSender, CandidateBuffer, ConnectionSignal, ConnectionSignalReceiver,
    EngineConfig, EngineEvent, Generation, IceCandidate, MediaTrack, NegotiationError,
    PairchatError, PairchatResult, PeerConnection, PeerConnectionFactory, PeerConnectionState,
    ResourceError, SdpType, SessionDescription, SessionEpoch, SessionId, TrackId, TrackSet,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------------
// Connection Operations
// ----------------------------------------------------------------------------

/// One call on the connection object. Executed strictly in submission order.
#[derive(Debug, Clone)]
pub enum ConnectionOp {
    AttachTrack(MediaTrack),
    /// Create an offer and install it as the local description
    CreateOffer { generation: Generation },
    /// Create an answer and install it as the local description
    CreateAnswer { generation: Generation },
    Rollback { generation: Generation },
    ApplyRemote {
        generation: Generation,
        description: SessionDescription,
    },
    AddCandidate(IceCandidate),
}

impl ConnectionOp {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionOp::AttachTrack(_) => "AttachTrack",
            ConnectionOp::CreateOffer { .. } => "CreateOffer",
            ConnectionOp::CreateAnswer { .. } => "CreateAnswer",
            ConnectionOp::Rollback { .. } => "Rollback",
            ConnectionOp::ApplyRemote { .. } => "ApplyRemote",
            ConnectionOp::AddCandidate(_) => "AddCandidate",
        }
    }
}

/// Outcome of handing a remote candidate to the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Held until the remote description is applied
    Buffered,
    /// Submitted to the connection
    Applied,
    /// Already seen during this negotiation
    Duplicate,
    /// The resources are torn down
    Discarded,
}

/// What a teardown released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub tracks_released: usize,
    pub candidates_discarded: usize,
    pub already_torn_down: bool,
}

// ----------------------------------------------------------------------------
// Connection Worker
// ----------------------------------------------------------------------------

/// Issues calls on the connection object one at a time
struct ConnectionWorker {
    connection: Arc<dyn PeerConnection>,
    epoch: SessionEpoch,
    description_timeout: Duration,
    ops: mpsc::UnboundedReceiver<ConnectionOp>,
    events: EngineEventSender,
}

impl ConnectionWorker {
    async fn run(mut self) {
        while let Some(op) = self.ops.recv().await {
            debug!("Connection worker {} executing {}", self.epoch, op.name());
            if let Some(event) = self.execute(op).await {
                if self.events.send(event).is_err() {
                    debug!("Controller gone, stopping connection worker {}", self.epoch);
                    break;
                }
            }
        }
        debug!("Connection worker {} stopped", self.epoch);
    }

    async fn execute(&self, op: ConnectionOp) -> Option<EngineEvent> {
        match op {
            ConnectionOp::AttachTrack(track) => match self.connection.add_track(&track).await {
                Ok(()) => None,
                Err(e) => {
                    let error = ResourceError::TrackAttachFailed {
                        track_id: track.id.to_string(),
                        reason: e.to_string(),
                    };
                    warn!("{}", error);
                    Some(EngineEvent::TrackAttachFailed {
                        epoch: self.epoch,
                        track_id: track.id,
                        reason: e.to_string(),
                    })
                }
            },
            ConnectionOp::CreateOffer { generation } => Some(EngineEvent::LocalDescriptionReady {
                epoch: self.epoch,
                generation,
                kind: SdpType::Offer,
                result: self.produce_local(SdpType::Offer).await,
            }),
            ConnectionOp::CreateAnswer { generation } => Some(EngineEvent::LocalDescriptionReady {
                epoch: self.epoch,
                generation,
                kind: SdpType::Answer,
                result: self.produce_local(SdpType::Answer).await,
            }),
            ConnectionOp::Rollback { generation } => {
                if let Err(e) = self.connection.rollback().await {
                    let error = NegotiationError::RollbackFailed {
                        reason: e.to_string(),
                    };
                    warn!("Discarding local offer of {}: {}", generation, error);
                }
                None
            }
            ConnectionOp::ApplyRemote {
                generation,
                description,
            } => Some(EngineEvent::RemoteDescriptionSettled {
                epoch: self.epoch,
                generation,
                result: self.apply_remote(description).await,
            }),
            ConnectionOp::AddCandidate(candidate) => {
                if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                    let error = ResourceError::CandidateRejected {
                        reason: e.to_string(),
                    };
                    warn!("Skipping remote candidate: {}", error);
                }
                None
            }
        }
    }

    async fn produce_local(&self, kind: SdpType) -> Result<SessionDescription, String> {
        let call = async {
            let description = match kind {
                SdpType::Offer => self.connection.create_offer().await?,
                SdpType::Answer => self.connection.create_answer().await?,
            };
            self.connection
                .set_local_description(description.clone())
                .await?;
            Ok::<_, PairchatError>(description)
        };

        match tokio::time::timeout(self.description_timeout, call).await {
            Ok(Ok(description)) => Ok(description),
            Ok(Err(e)) => {
                Err(PairchatError::description_creation_failed(kind.as_str(), e.to_string())
                    .to_string())
            }
            Err(_) => Err(self.timeout_reason()),
        }
    }

    async fn apply_remote(&self, description: SessionDescription) -> Result<(), String> {
        let kind = description.kind;
        let call = self.connection.set_remote_description(description);
        match tokio::time::timeout(self.description_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PairchatError::description_application_failed(
                kind.as_str(),
                e.to_string(),
            )
            .to_string()),
            Err(_) => Err(self.timeout_reason()),
        }
    }

    fn timeout_reason(&self) -> String {
        PairchatError::from(NegotiationError::Timeout {
            duration_ms: self.description_timeout.as_millis() as u64,
        })
        .to_string()
    }
}

/// Tag connection signals with the epoch they were produced under
async fn forward_signals(
    epoch: SessionEpoch,
    mut signals: ConnectionSignalReceiver,
    events: EngineEventSender,
) {
    while let Some(signal) = signals.recv().await {
        let event = match signal {
            ConnectionSignal::StateChanged(state) if state.is_lost() => {
                EngineEvent::ConnectivityLost { epoch, state }
            }
            signal => EngineEvent::Connection { epoch, signal },
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Resources
// ----------------------------------------------------------------------------

/// Resources of one session's negotiated connection
pub struct ConnectionResources {
    session_id: SessionId,
    epoch: SessionEpoch,
    connection: Arc<dyn PeerConnection>,
    ops: Option<mpsc::UnboundedSender<ConnectionOp>>,
    worker: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    tracks: TrackSet,
    candidates: CandidateBuffer,
    seen_remote: HashSet<IceCandidate>,
    torn_down: bool,
}

impl ConnectionResources {
    /// Build the connection object for a session and start its worker
    pub fn open(
        session_id: SessionId,
        epoch: SessionEpoch,
        factory: &dyn PeerConnectionFactory,
        config: &EngineConfig,
        events: EngineEventSender,
    ) -> PairchatResult<Self> {
        let (signal_sender, signal_receiver) = mpsc::unbounded_channel();
        let connection = factory.create(&config.ice, signal_sender)?;

        let forwarder = tokio::spawn(forward_signals(epoch, signal_receiver, events.clone()));

        let (op_sender, op_receiver) = mpsc::unbounded_channel();
        let worker = ConnectionWorker {
            connection: connection.clone(),
            epoch,
            description_timeout: config.negotiation.description_timeout(),
            ops: op_receiver,
            events,
        };
        let worker = tokio::spawn(worker.run());

        info!("Opened connection for session {} ({})", session_id, epoch);

        Ok(Self {
            session_id,
            epoch,
            connection,
            ops: Some(op_sender),
            worker: Some(worker),
            forwarder: Some(forwarder),
            tracks: TrackSet::new(),
            candidates: CandidateBuffer::new(),
            seen_remote: HashSet::new(),
            torn_down: false,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    pub fn tracks(&self) -> &TrackSet {
        &self.tracks
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn remote_description_set(&self) -> bool {
        self.candidates.is_drained()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.connection.connection_state()
    }

    fn submit(&self, op: ConnectionOp) -> bool {
        let name = op.name();
        match &self.ops {
            Some(ops) if ops.send(op).is_ok() => true,
            _ => {
                debug!(
                    "Dropping {} for session {}: {}",
                    name,
                    self.session_id,
                    ResourceError::WorkerStopped
                );
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Tracks
    // ------------------------------------------------------------------------

    /// Attach every track of `desired` not already attached. Returns how many
    /// were newly attached.
    pub fn attach_tracks(&mut self, desired: &TrackSet) -> usize {
        if self.torn_down {
            return 0;
        }
        let missing: Vec<MediaTrack> = desired.missing_from(&self.tracks).cloned().collect();
        let mut attached = 0;
        for track in missing {
            if self.tracks.attach(track.clone()) && self.submit(ConnectionOp::AttachTrack(track)) {
                attached += 1;
            }
        }
        if attached > 0 {
            debug!("Attached {} track(s) to session {}", attached, self.session_id);
        }
        attached
    }

    /// Forget a track the connection refused
    pub fn forget_track(&mut self, track_id: &TrackId) -> bool {
        self.tracks.detach(track_id).is_some()
    }

    // ------------------------------------------------------------------------
    // Descriptions
    // ------------------------------------------------------------------------

    pub fn create_offer(&self, generation: Generation) {
        self.submit(ConnectionOp::CreateOffer { generation });
    }

    pub fn create_answer(&self, generation: Generation) {
        self.submit(ConnectionOp::CreateAnswer { generation });
    }

    pub fn rollback(&self, generation: Generation) {
        self.submit(ConnectionOp::Rollback { generation });
    }

    pub fn apply_remote(&self, generation: Generation, description: SessionDescription) {
        self.submit(ConnectionOp::ApplyRemote {
            generation,
            description,
        });
    }

    // ------------------------------------------------------------------------
    // Candidates
    // ------------------------------------------------------------------------

    /// Buffer a remote candidate until the remote description is applied, or
    /// apply it straight away afterwards
    pub fn buffer_or_apply_candidate(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        if self.torn_down {
            return CandidateDisposition::Discarded;
        }
        if !self.seen_remote.insert(candidate.clone()) {
            return CandidateDisposition::Duplicate;
        }
        match self.candidates.push(candidate) {
            Some(candidate) => {
                self.submit(ConnectionOp::AddCandidate(candidate));
                CandidateDisposition::Applied
            }
            None => CandidateDisposition::Buffered,
        }
    }

    /// Apply every buffered candidate in receipt order. Only the first call
    /// per negotiation does anything.
    pub fn drain_buffer(&mut self) -> usize {
        match self.candidates.drain() {
            Some(candidates) => {
                let count = candidates.len();
                for candidate in candidates {
                    self.submit(ConnectionOp::AddCandidate(candidate));
                }
                count
            }
            None => 0,
        }
    }

    /// Discard buffered candidates and re-arm the buffer
    pub fn reset_candidates(&mut self) {
        self.candidates.clear();
        self.seen_remote.clear();
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Release everything: detach callbacks, stop the worker, remove tracks,
    /// close the connection, clear the candidate buffer. Idempotent.
    pub async fn teardown(&mut self) -> TeardownReport {
        if self.torn_down {
            debug!("Session {} resources already torn down", self.session_id);
            return TeardownReport {
                already_torn_down: true,
                ..TeardownReport::default()
            };
        }
        self.torn_down = true;
        info!("Tearing down connection for session {} ({})", self.session_id, self.epoch);

        self.connection.detach_handlers();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            let _ = forwarder.await;
        }
        self.ops = None;
        if let Some(worker) = self.worker.take() {
            worker.abort();
            let _ = worker.await;
        }

        let mut report = TeardownReport::default();
        for track in self.tracks.drain() {
            if let Err(e) = self.connection.remove_track(&track.id).await {
                let error = ResourceError::TrackDetachFailed {
                    track_id: track.id.to_string(),
                    reason: e.to_string(),
                };
                warn!("{}", error);
            }
            report.tracks_released += 1;
        }

        if let Err(e) = self.connection.close().await {
            let error = ResourceError::CloseFailed {
                reason: e.to_string(),
            };
            warn!("{}", error);
        }

        report.candidates_discarded = self.candidates.len();
        self.reset_candidates();

        debug!(
            "Session {} released {} track(s), discarded {} candidate(s)",
            self.session_id, report.tracks_released, report.candidates_discarded
        );
        report
    }
}

impl Drop for ConnectionResources {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

impl core::fmt::Debug for ConnectionResources {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionResources")
            .field("session_id", &self.session_id)
            .field("epoch", &self.epoch)
            .field("tracks", &self.tracks.len())
            .field("buffered_candidates", &self.candidates.len())
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairchat_core::channel::create_engine_event_channel;
    use pairchat_core::{EngineEvent, TrackKind};
    use pairchat_harness::{MockCall, MockConnectionFactory};
    use tokio::time::{timeout, Duration};

    fn tracks() -> TrackSet {
        [
            MediaTrack::new("mic", TrackKind::Audio),
            MediaTrack::new("cam", TrackKind::Video),
        ]
        .into_iter()
        .collect()
    }

    fn open(factory: &MockConnectionFactory) -> (ConnectionResources, pairchat_core::channel::EngineEventReceiver) {
        let (sender, receiver) = create_engine_event_channel();
        let resources = ConnectionResources::open(
            SessionId::new("a-b"),
            SessionEpoch::new(1),
            factory,
            &EngineConfig::testing(),
            sender,
        )
        .expect("Failed to open connection resources");
        (resources, receiver)
    }

    #[tokio::test]
    async fn test_attach_tracks_is_idempotent() {
        let factory = MockConnectionFactory::new("alice");
        let (mut resources, _events) = open(&factory);

        assert_eq!(resources.attach_tracks(&tracks()), 2);
        assert_eq!(resources.attach_tracks(&tracks()), 0);
        assert_eq!(resources.tracks().len(), 2);

        resources.teardown().await;
        let connection = factory.last_connection().expect("connection created");
        let added = connection
            .calls()
            .into_iter()
            .filter(|call| matches!(call, MockCall::AddTrack(_)))
            .count();
        assert_eq!(added, 2);
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_remote_applied() {
        let factory = MockConnectionFactory::new("alice");
        let (mut resources, _events) = open(&factory);

        let first = IceCandidate::new("candidate:1");
        let second = IceCandidate::new("candidate:2");
        assert_eq!(
            resources.buffer_or_apply_candidate(first.clone()),
            CandidateDisposition::Buffered
        );
        assert_eq!(
            resources.buffer_or_apply_candidate(first.clone()),
            CandidateDisposition::Duplicate
        );
        assert_eq!(resources.buffered_candidates(), 1);

        assert_eq!(resources.drain_buffer(), 1);
        assert_eq!(resources.drain_buffer(), 0);
        assert_eq!(
            resources.buffer_or_apply_candidate(second.clone()),
            CandidateDisposition::Applied
        );
        assert!(resources.remote_description_set());
    }

    #[tokio::test]
    async fn test_description_results_carry_epoch_and_generation() {
        let factory = MockConnectionFactory::new("alice");
        let (resources, mut events) = open(&factory);

        resources.create_offer(Generation::new(3));
        let event = timeout(Duration::from_secs(1), async {
            loop {
                match events.recv().await {
                    Some(EngineEvent::LocalDescriptionReady {
                        epoch,
                        generation,
                        kind,
                        result,
                    }) => break (epoch, generation, kind, result),
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("offer result not reported");

        assert_eq!(event.0, SessionEpoch::new(1));
        assert_eq!(event.1, Generation::new(3));
        assert_eq!(event.2, SdpType::Offer);
        assert!(event.3.expect("offer created").is_offer());
    }

    #[tokio::test]
    async fn test_teardown_order_and_idempotence() {
        let factory = MockConnectionFactory::new("alice");
        let (mut resources, _events) = open(&factory);
        resources.attach_tracks(&tracks());
        resources.buffer_or_apply_candidate(IceCandidate::new("candidate:9"));

        // Let the worker attach both tracks first
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = resources.teardown().await;
        assert_eq!(report.tracks_released, 2);
        assert_eq!(report.candidates_discarded, 1);
        assert!(resources.tracks().is_empty());
        assert_eq!(resources.buffered_candidates(), 0);

        let again = resources.teardown().await;
        assert!(again.already_torn_down);

        let connection = factory.last_connection().expect("connection created");
        let calls = connection.calls();
        let detach = calls
            .iter()
            .position(|call| *call == MockCall::DetachHandlers)
            .expect("handlers detached");
        let close = calls
            .iter()
            .position(|call| *call == MockCall::Close)
            .expect("connection closed");
        let last_remove = calls
            .iter()
            .rposition(|call| matches!(call, MockCall::RemoveTrack(_)))
            .expect("tracks removed");
        assert!(detach < last_remove && last_remove < close);
        assert_eq!(calls.iter().filter(|call| **call == MockCall::Close).count(), 1);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_torn_down_resources_discard_input() {
        let factory = MockConnectionFactory::new("alice");
        let (mut resources, _events) = open(&factory);
        resources.teardown().await;

        assert_eq!(
            resources.buffer_or_apply_candidate(IceCandidate::new("candidate:1")),
            CandidateDisposition::Discarded
        );
        assert_eq!(resources.attach_tracks(&tracks()), 0);
    }
}
