//! Connection state machine.
//!
//! A [`Backend`] owns the transport, the candidate list and the connection
//! state, and is the only writer of any of them. Every [`Hub`] operation and
//! every transport event is funnelled through its single loop. Hubs read
//! snapshots through `watch` channels and follow events through bounded
//! `broadcast` channels; a consumer that falls behind loses the oldest items
//! and never stalls the backend.

use std::{sync::Arc, time::Duration};

use futures::{stream, Stream};
use log::{debug, info, warn};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use uuid::Uuid;

use crate::{
    config::Config,
    devices::{CandidateSet, PeripheralFilter, PeripheralHandle, Sighting},
    frame,
    message::TelemetryReading,
    permission::{PermissionGate, PermissionStatus},
    state::{ConnectionState, ErrorKind, Status},
    transport::{select_characteristic, CharacteristicInfo, Transport, TransportEvent},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("bluetooth backend is dead")]
    BackendDead,
    #[error("a connection is already {0}")]
    Busy(Status),
    #[error("cannot {op} while {status}")]
    InvalidState { op: &'static str, status: Status },
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Kind(#[from] ErrorKind),
}

type Reply = oneshot::Sender<Result<Status, Error>>;

#[derive(Debug)]
enum BusMessage {
    StartScan(Reply),
    StopScan(Reply),
    Connect(PeripheralHandle, Reply),
    Disconnect(Reply),
    Reset(Reply),
    Terminate,
}

#[derive(Debug)]
enum Progress {
    Linked(CharacteristicInfo),
    Subscribed,
    Failed(ErrorKind),
}

#[derive(Debug)]
struct AttemptUpdate {
    attempt: u64,
    progress: Progress,
}

struct Attempt {
    id: u64,
    reply: Option<Reply>,
    task: JoinHandle<()>,
}

impl Attempt {
    fn finish(mut self, result: Result<Status, Error>) {
        if let Some(reply) = self.reply.take() {
            reply.send(result).ok();
        }
    }

    fn cancel(mut self, result: Result<Status, Error>) {
        self.task.abort();
        if let Some(reply) = self.reply.take() {
            reply.send(result).ok();
        }
    }
}

struct Publisher {
    state: watch::Sender<ConnectionState>,
    candidates: watch::Sender<Vec<PeripheralHandle>>,
    last_reading: watch::Sender<Option<TelemetryReading>>,
    readings: broadcast::Sender<TelemetryReading>,
    errors: broadcast::Sender<ErrorKind>,
    discoveries: broadcast::Sender<PeripheralHandle>,
}

pub struct Backend<T> {
    control_recv: mpsc::UnboundedReceiver<BusMessage>,
    transport_events: mpsc::Receiver<TransportEvent>,
    progress_send: mpsc::UnboundedSender<AttemptUpdate>,
    progress_recv: mpsc::UnboundedReceiver<AttemptUpdate>,

    transport: Arc<T>,
    gate: Arc<dyn PermissionGate>,
    filter: PeripheralFilter,
    scan_timeout: Duration,
    connect_timeout: Duration,
    preferred_characteristic: Option<Uuid>,

    state: ConnectionState,
    candidates: CandidateSet,
    scan_deadline: Option<Instant>,
    attempt: Option<Attempt>,
    next_attempt: u64,
    data_channel: Option<Uuid>,
    publisher: Publisher,
}

impl<T: Transport> Backend<T> {
    /// Run until [`Hub::shutdown`] is called or every hub is dropped.
    pub async fn serve(mut self) {
        info!("bluetooth backend started");
        loop {
            let deadline = self.scan_deadline;
            tokio::select! {
                biased;

                // An attempt reports its data channel before subscribing, so
                // progress must be handled ahead of the frames that follow it
                Some(update) = self.progress_recv.recv() => self.handle_progress(update).await,
                command = self.control_recv.recv() => match command {
                    Some(BusMessage::Terminate) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.transport_events.recv() => self.handle_event(event).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    info!(
                        "scan window elapsed, {} candidate(s) found",
                        self.candidates.len()
                    );
                    self.halt_scan().await;
                    self.set_status(Status::Idle);
                }
            }
        }
        self.teardown().await;
        info!("bluetooth backend stopped");
    }

    async fn handle_command(&mut self, command: BusMessage) {
        match command {
            BusMessage::StartScan(reply) => {
                reply.send(self.start_scan().await).ok();
            }
            BusMessage::StopScan(reply) => {
                reply.send(self.stop_scan().await).ok();
            }
            BusMessage::Connect(peripheral, reply) => self.connect(peripheral, reply).await,
            BusMessage::Disconnect(reply) => {
                reply.send(self.disconnect().await).ok();
            }
            BusMessage::Reset(reply) => {
                reply.send(self.reset()).ok();
            }
            BusMessage::Terminate => {}
        }
    }

    async fn start_scan(&mut self) -> Result<Status, Error> {
        match self.state.status {
            Status::Scanning => return Ok(Status::Scanning),
            Status::Idle | Status::Error => {}
            status => {
                return Err(Error::InvalidState {
                    op: "start scan",
                    status,
                })
            }
        }

        if self.gate.check() != PermissionStatus::Granted {
            warn!("scan refused, bluetooth permission not granted");
            self.publisher.errors.send(ErrorKind::PermissionDenied).ok();
            return Err(ErrorKind::PermissionDenied.into());
        }

        match self.transport.powered().await {
            Ok(true) => {}
            Ok(false) => return Err(self.fail(ErrorKind::AdapterPoweredOff)),
            Err(e) => return Err(self.fail(ErrorKind::ScanFailed(e.to_string()))),
        }
        if let Err(e) = self.transport.start_scan().await {
            return Err(self.fail(ErrorKind::ScanFailed(e.to_string())));
        }

        self.candidates.clear();
        self.publisher.candidates.send_replace(Vec::new());
        self.scan_deadline = Some(Instant::now() + self.scan_timeout);
        self.set_status(Status::Scanning);
        Ok(Status::Scanning)
    }

    async fn stop_scan(&mut self) -> Result<Status, Error> {
        if self.state.status == Status::Scanning {
            self.halt_scan().await;
            self.set_status(Status::Idle);
        }
        Ok(self.state.status)
    }

    async fn halt_scan(&mut self) {
        self.scan_deadline = None;
        if let Err(e) = self.transport.stop_scan().await {
            warn!("failed to stop scanning: {}", e);
        }
    }

    async fn connect(&mut self, peripheral: PeripheralHandle, reply: Reply) {
        match self.state.status {
            status if status.is_busy() => {
                debug!("refusing to connect to {} while {}", peripheral, status);
                reply.send(Err(Error::Busy(status))).ok();
                return;
            }
            Status::Scanning => self.halt_scan().await,
            _ => {}
        }

        self.next_attempt += 1;
        let id = self.next_attempt;
        info!("connecting to {}", peripheral);
        let task = tokio::spawn(establish(
            self.transport.clone(),
            peripheral.id().to_string(),
            self.preferred_characteristic,
            self.connect_timeout,
            id,
            self.progress_send.clone(),
        ));
        self.attempt = Some(Attempt {
            id,
            reply: Some(reply),
            task,
        });
        self.state.active_peripheral = Some(peripheral);
        self.set_status(Status::Connecting);
    }

    async fn disconnect(&mut self) -> Result<Status, Error> {
        if !self.state.status.is_busy() {
            return Ok(self.state.status);
        }
        if let Some(attempt) = self.attempt.take() {
            attempt.cancel(Err(Error::Cancelled));
        }
        if let Some(peripheral) = self.state.active_peripheral.take() {
            info!("disconnecting from {}", peripheral);
            if let Err(e) = self.transport.disconnect(peripheral.id()).await {
                warn!("failed to disconnect from {}: {}", peripheral, e);
            }
        }
        self.data_channel = None;
        self.publisher.last_reading.send_replace(None);
        self.set_status(Status::Idle);
        Ok(Status::Idle)
    }

    fn reset(&mut self) -> Result<Status, Error> {
        match self.state.status {
            Status::Error => {
                self.set_status(Status::Idle);
                Ok(Status::Idle)
            }
            Status::Idle => Ok(Status::Idle),
            status => Err(Error::InvalidState { op: "reset", status }),
        }
    }

    async fn handle_progress(&mut self, update: AttemptUpdate) {
        if self.attempt.as_ref().map(|a| a.id) != Some(update.attempt) {
            debug!("dropping progress of stale attempt {}", update.attempt);
            return;
        }
        match update.progress {
            Progress::Linked(characteristic) => {
                info!(
                    "link established, telemetry on characteristic {}",
                    characteristic.uuid
                );
                self.data_channel = Some(characteristic.uuid);
                self.set_status(Status::Connected);
            }
            Progress::Subscribed => {
                self.set_status(Status::Streaming);
                if let Some(attempt) = self.attempt.take() {
                    attempt.finish(Ok(Status::Streaming));
                }
            }
            Progress::Failed(kind) => {
                let error = self.fail(kind);
                if let Some(attempt) = self.attempt.take() {
                    attempt.finish(Err(error));
                }
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement { id, name, rssi } => {
                if self.state.status != Status::Scanning {
                    return;
                }
                match self.candidates.observe(&self.filter, &id, name, rssi) {
                    Ok(Sighting::New) => {
                        self.publisher.candidates.send_replace(self.candidates.to_vec());
                        if let Some(handle) = self.candidates.get(&id) {
                            info!("candidate discovered: {}", handle);
                            self.publisher.discoveries.send(handle.clone()).ok();
                        }
                    }
                    Ok(Sighting::Refreshed) => {
                        self.publisher.candidates.send_replace(self.candidates.to_vec());
                    }
                    Ok(Sighting::Ignored) => {}
                    Err(e) => warn!("dropping advertisement: {}", e),
                }
            }
            TransportEvent::Notification {
                id,
                characteristic,
                value,
            } => {
                if !self.is_data_channel(&id, characteristic) {
                    debug!(
                        "dropping notification from {} on {} while {}",
                        id, characteristic, self.state.status
                    );
                    return;
                }
                match frame::decode(&value) {
                    Ok(reading) => {
                        debug!("reading decoded: {:?}", reading);
                        self.publisher.last_reading.send_replace(Some(reading));
                        self.publisher.readings.send(reading).ok();
                    }
                    Err(e) => {
                        warn!("{} from {}: {:x?}", e, id, value);
                        self.publisher.errors.send(e.into()).ok();
                    }
                }
            }
            TransportEvent::LinkLost { id, reason } => {
                let active = self.state.active_peripheral.as_ref().map(|p| p.id() == id);
                if !self.state.status.is_busy() || active != Some(true) {
                    debug!("ignoring link loss of {}: {}", id, reason);
                    return;
                }
                warn!("link to {} lost: {}", id, reason);
                let error = self.fail(ErrorKind::Disconnected(reason));
                if let Some(attempt) = self.attempt.take() {
                    attempt.cancel(Err(error));
                }
                // Release whatever the transport still holds for the dead link
                if let Err(e) = self.transport.disconnect(&id).await {
                    debug!("cleanup after link loss of {} failed: {}", id, e);
                }
            }
        }
    }

    fn is_data_channel(&self, id: &str, characteristic: Uuid) -> bool {
        matches!(self.state.status, Status::Connected | Status::Streaming)
            && self.data_channel == Some(characteristic)
            && self
                .state
                .active_peripheral
                .as_ref()
                .map_or(false, |p| p.id() == id)
    }

    /// Enter the error state and surface `kind` to subscribers.
    fn fail(&mut self, kind: ErrorKind) -> Error {
        warn!("{}", kind);
        self.scan_deadline = None;
        self.data_channel = None;
        self.state.active_peripheral = None;
        self.state.last_error = Some(kind.clone());
        self.publisher.last_reading.send_replace(None);
        self.publisher.errors.send(kind.clone()).ok();
        self.set_status(Status::Error);
        Error::Kind(kind)
    }

    fn set_status(&mut self, status: Status) {
        if status != Status::Error {
            self.state.last_error = None;
        }
        if self.state.status != status {
            info!("state {} -> {}", self.state.status, status);
        }
        self.state.status = status;
        self.publisher.state.send_replace(self.state.clone());
    }

    async fn teardown(&mut self) {
        if self.state.status == Status::Scanning {
            self.halt_scan().await;
        }
        if self.state.status.is_busy() {
            self.disconnect().await.ok();
        }
    }
}

async fn establish<T: Transport>(
    transport: Arc<T>,
    id: String,
    preferred: Option<Uuid>,
    limit: Duration,
    attempt: u64,
    progress: mpsc::UnboundedSender<AttemptUpdate>,
) {
    let outcome = link(transport.as_ref(), &id, preferred, limit, attempt, &progress).await;
    let progress_update = match outcome {
        Ok(()) => Progress::Subscribed,
        Err(kind) => {
            // Leave nothing half-open behind a failed attempt
            transport.disconnect(&id).await.ok();
            Progress::Failed(kind)
        }
    };
    progress
        .send(AttemptUpdate {
            attempt,
            progress: progress_update,
        })
        .ok();
}

async fn link<T: Transport>(
    transport: &T,
    id: &str,
    preferred: Option<Uuid>,
    limit: Duration,
    attempt: u64,
    progress: &mpsc::UnboundedSender<AttemptUpdate>,
) -> Result<(), ErrorKind> {
    match timeout(limit, transport.connect(id)).await {
        Ok(Ok(())) => debug!("connected to {}", id),
        Ok(Err(e)) => return Err(ErrorKind::ConnectionFailed(e.to_string())),
        Err(_) => {
            return Err(ErrorKind::ConnectionFailed(format!(
                "timed out after {:?}",
                limit
            )))
        }
    }

    let characteristics = match timeout(limit, transport.discover(id)).await {
        Ok(Ok(characteristics)) => characteristics,
        Ok(Err(e)) => {
            warn!("service discovery on {} failed: {}", id, e);
            return Err(ErrorKind::ServiceDiscoveryFailed);
        }
        Err(_) => {
            warn!("service discovery on {} timed out after {:?}", id, limit);
            return Err(ErrorKind::ServiceDiscoveryFailed);
        }
    };
    let characteristic = select_characteristic(&characteristics, preferred)
        .ok_or(ErrorKind::NoNotifiableCharacteristic)?;
    progress
        .send(AttemptUpdate {
            attempt,
            progress: Progress::Linked(characteristic),
        })
        .ok();

    transport
        .subscribe(id, &characteristic)
        .await
        .map_err(|e| ErrorKind::SubscriptionFailed(e.to_string()))
}

fn follow<T: Clone + Send + 'static>(
    receiver: broadcast::Receiver<T>,
    what: &'static str,
) -> impl Stream<Item = T> + Send + 'static {
    stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(item) => return Some((item, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{} subscriber lagging, {} oldest dropped", what, skipped)
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// Handle to the connection state machine.
pub struct Hub {
    control_send: mpsc::UnboundedSender<BusMessage>,
    gate: Arc<dyn PermissionGate>,
    state: watch::Receiver<ConnectionState>,
    candidates: watch::Receiver<Vec<PeripheralHandle>>,
    last_reading: watch::Receiver<Option<TelemetryReading>>,
    readings: broadcast::Receiver<TelemetryReading>,
    errors: broadcast::Receiver<ErrorKind>,
    discoveries: broadcast::Receiver<PeripheralHandle>,
}

impl Clone for Hub {
    fn clone(&self) -> Self {
        Self {
            control_send: self.control_send.clone(),
            gate: self.gate.clone(),
            state: self.state.clone(),
            candidates: self.candidates.clone(),
            last_reading: self.last_reading.clone(),
            readings: self.readings.resubscribe(),
            errors: self.errors.resubscribe(),
            discoveries: self.discoveries.resubscribe(),
        }
    }
}

impl Hub {
    async fn request<F>(&self, message: F) -> Result<Status, Error>
    where
        F: FnOnce(Reply) -> BusMessage,
    {
        let (send, recv) = oneshot::channel();
        self.control_send
            .send(message(send))
            .map_err(|_| Error::BackendDead)?;
        recv.await.map_err(|_| Error::BackendDead)?
    }

    /// Start a bounded scan. A no-op while already scanning.
    pub async fn start_scan(&self) -> Result<Status, Error> {
        self.request(BusMessage::StartScan).await
    }

    pub async fn stop_scan(&self) -> Result<Status, Error> {
        self.request(BusMessage::StopScan).await
    }

    /// Connect and subscribe; resolves once streaming or failed.
    pub async fn connect(&self, peripheral: PeripheralHandle) -> Result<Status, Error> {
        self.request(|reply| BusMessage::Connect(peripheral, reply)).await
    }

    /// Drop the link, or cancel an attempt in progress.
    pub async fn disconnect(&self) -> Result<Status, Error> {
        self.request(BusMessage::Disconnect).await
    }

    /// Leave the error state.
    pub async fn reset(&self) -> Result<Status, Error> {
        self.request(BusMessage::Reset).await
    }

    pub fn permission(&self) -> PermissionStatus {
        self.gate.check()
    }

    pub async fn request_permission(&self) -> bool {
        self.gate.request().await
    }

    pub fn shutdown(&self) {
        self.control_send.send(BusMessage::Terminate).ok();
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn candidates(&self) -> Vec<PeripheralHandle> {
        self.candidates.borrow().clone()
    }

    pub fn last_reading(&self) -> Option<TelemetryReading> {
        *self.last_reading.borrow()
    }

    /// Readings decoded from now on, across reconnects.
    pub fn readings(&self) -> impl Stream<Item = TelemetryReading> + Send + 'static {
        follow(self.readings.resubscribe(), "reading")
    }

    pub fn errors(&self) -> impl Stream<Item = ErrorKind> + Send + 'static {
        follow(self.errors.resubscribe(), "error")
    }

    pub fn discoveries(&self) -> impl Stream<Item = PeripheralHandle> + Send + 'static {
        follow(self.discoveries.resubscribe(), "discovery")
    }
}

pub fn init<T, G>(
    config: &Config,
    transport: T,
    events: mpsc::Receiver<TransportEvent>,
    gate: G,
) -> (Hub, Backend<T>)
where
    T: Transport,
    G: PermissionGate + 'static,
{
    let (control_send, control_recv) = mpsc::unbounded_channel();
    let (progress_send, progress_recv) = mpsc::unbounded_channel();
    let (state_send, state_recv) = watch::channel(ConnectionState::default());
    let (candidates_send, candidates_recv) = watch::channel(Vec::new());
    let (reading_send, reading_recv) = watch::channel(None);
    let (readings, readings_recv) = broadcast::channel(config.event_capacity);
    let (errors, errors_recv) = broadcast::channel(config.event_capacity);
    let (discoveries, discoveries_recv) = broadcast::channel(config.event_capacity);
    let gate: Arc<dyn PermissionGate> = Arc::new(gate);

    let hub = Hub {
        control_send,
        gate: gate.clone(),
        state: state_recv,
        candidates: candidates_recv,
        last_reading: reading_recv,
        readings: readings_recv,
        errors: errors_recv,
        discoveries: discoveries_recv,
    };
    let backend = Backend {
        control_recv,
        transport_events: events,
        progress_send,
        progress_recv,
        transport: Arc::new(transport),
        gate,
        filter: PeripheralFilter::new(config.name_marker.clone()),
        scan_timeout: config.scan_timeout,
        connect_timeout: config.connect_timeout,
        preferred_characteristic: config.characteristic,
        state: ConnectionState::default(),
        candidates: CandidateSet::new(),
        scan_deadline: None,
        attempt: None,
        next_attempt: 0,
        data_channel: None,
        publisher: Publisher {
            state: state_send,
            candidates: candidates_send,
            last_reading: reading_send,
            readings,
            errors,
            discoveries,
        },
    };
    (hub, backend)
}
