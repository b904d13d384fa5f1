use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    FailureTracker, HANDSHAKE_SEQUENCE, SequenceCounter, SessionState, SessionStats,
};
use crate::codec::decode_frame;
use crate::command::{ACK_OK, Command, LightStatus, NONCE_LEN, Opcode};
use crate::config::{MeshConfig, MeshIdentity, SessionConfig};
use crate::crypto::{LinkKeys, SessionKey};
use crate::error::{MeshError, Result, TransportError};
use crate::packet::{open_frame, seal_command};
use crate::state::{Device, Roster};
use crate::transport::{Link, TransportId};

type AckWaiter = oneshot::Sender<Result<u8>>;

/// Login sent, waiting for the fixture's nonce
struct PendingLogin {
    key: SessionKey,
    reply: oneshot::Sender<Result<[u8; NONCE_LEN]>>,
}

/// Only the session's own send path touches this
struct Outbound {
    key: Option<SessionKey>,
    sequence: SequenceCounter,
}

/// State shared between the send path and the inbound task
struct Shared {
    state: SessionState,
    receive_key: Option<SessionKey>,
    last_inbound: u32,
    identity: Option<MeshIdentity>,
    pending_login: Option<PendingLogin>,
    ack_waiters: HashMap<u32, AckWaiter>,
    last_status: Option<LightStatus>,
    failures: FailureTracker,
    stats: SessionStats,
}

impl Shared {
    /// Returns true when this failure invalidated the session
    fn record_failure(&mut self, reason: &str) -> bool {
        self.stats.failures += 1;
        if self.state == SessionState::Authenticated && self.failures.record_failure(reason) {
            self.invalidate();
            return true;
        }
        false
    }

    /// Drop back to Unauthenticated and fail everything waiting on an ack
    fn invalidate(&mut self) {
        self.state = SessionState::Unauthenticated;
        self.receive_key = None;
        self.stats.invalidations += 1;
        for (sequence, waiter) in self.ack_waiters.drain() {
            let _ = waiter.send(Err(MeshError::Authentication(format!(
                "session invalidated while waiting for ack of sequence {sequence}"
            ))));
        }
    }

    fn close(&mut self, reason: fn() -> MeshError) {
        self.state = SessionState::Disconnected;
        self.receive_key = None;
        if let Some(pending) = self.pending_login.take() {
            let _ = pending.reply.send(Err(reason()));
        }
        for (_, waiter) in self.ack_waiters.drain() {
            let _ = waiter.send(Err(reason()));
        }
    }
}

#[derive(Default)]
struct Cancellation {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// One authenticated conversation with one fixture over one link.
///
/// Sends are serialized: the outbound lock is held from sequence assignment
/// until the acknowledgment arrives or the wait gives up. When inbound
/// failures invalidate an idle session, a background task logs in again,
/// bounded by `rehandshake_attempts`.
pub struct SessionManager {
    core: Arc<SessionCore>,
}

/// Everything a session owns. Shared with its inbound and recovery tasks.
pub(crate) struct SessionCore {
    device: Device,
    link: Arc<dyn Link>,
    config: SessionConfig,
    identities: Vec<(MeshIdentity, SessionKey)>,
    outbound: Mutex<Outbound>,
    shared: Mutex<Shared>,
    roster: Arc<Mutex<Roster>>,
    cancel: Cancellation,
    relogin: Notify,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    /// Subscribe to the link, start inbound processing and log in, trying
    /// each configured identity in order
    pub async fn establish(
        link: Arc<dyn Link>,
        device: Device,
        config: &MeshConfig,
        roster: Arc<Mutex<Roster>>,
    ) -> Result<Self> {
        config.validate()?;

        let identities = config
            .credentials
            .iter()
            .map(|identity| (identity.clone(), identity.session_key()))
            .collect();
        let notifications = link.subscribe().await.map_err(MeshError::Connection)?;

        let core = Arc::new(SessionCore {
            device,
            link,
            config: config.session.clone(),
            identities,
            outbound: Mutex::new(Outbound {
                key: None,
                sequence: SequenceCounter::new(),
            }),
            shared: Mutex::new(Shared {
                state: SessionState::Unauthenticated,
                receive_key: None,
                last_inbound: HANDSHAKE_SEQUENCE,
                identity: None,
                pending_login: None,
                ack_waiters: HashMap::new(),
                last_status: None,
                failures: FailureTracker::new(config.session.failure_threshold),
                stats: SessionStats::default(),
            }),
            roster,
            cancel: Cancellation::default(),
            relogin: Notify::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let inbound = tokio::spawn(run_inbound(core.clone(), notifications));
        let recovery = tokio::spawn(run_recovery(core.clone()));
        if let Ok(mut tasks) = core.tasks.lock() {
            tasks.extend([inbound, recovery]);
        }

        let manager = Self { core };
        let login = {
            let mut outbound = manager.core.outbound.lock().await;
            manager.core.authenticate(&mut outbound).await
        };
        if let Err(e) = login {
            if let Err(close_err) = manager.disconnect().await {
                debug!("Error closing link after failed login: {}", close_err);
            }
            return Err(e);
        }

        Ok(manager)
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub fn device(&self) -> &Device {
        &self.core.device
    }

    pub fn transport_id(&self) -> &TransportId {
        &self.core.device.transport_id
    }

    pub async fn state(&self) -> SessionState {
        self.core.state().await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state().await == SessionState::Authenticated
    }

    /// Identity that the current login succeeded with
    pub async fn identity(&self) -> Option<MeshIdentity> {
        self.core.shared.lock().await.identity.clone()
    }

    pub async fn stats(&self) -> SessionStats {
        self.core.shared.lock().await.stats.clone()
    }

    /// Sequence of the most recent command frame. Waits for any send in
    /// progress.
    pub async fn last_sequence(&self) -> Option<u32> {
        self.core.outbound.lock().await.sequence.last()
    }

    /// Last status report received from the fixture
    pub async fn last_status(&self) -> Option<LightStatus> {
        self.core.shared.lock().await.last_status
    }

    /// Encrypt and send one command to the connected fixture, returning once
    /// it acknowledges.
    ///
    /// Logs in again when the session was invalidated, and retries a bounded
    /// number of times when the exchange fails on authentication, a malformed
    /// reply or a missing ack.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        self.send_command_to(self.core.device.mesh_address, command)
            .await
    }

    /// Like [`send_command`](Self::send_command), but addressed to another
    /// mesh node (or [`BROADCAST_ADDRESS`](crate::codec::BROADCAST_ADDRESS))
    /// relayed through the connected fixture. The connected fixture
    /// acknowledges.
    pub async fn send_command_to(&self, mesh_address: u16, command: Command) -> Result<()> {
        self.core.send_command(mesh_address, command).await
    }

    /// Ask the fixture for its light state
    pub async fn query_status(&self) -> Result<LightStatus> {
        self.send_command(Command::QueryStatus).await?;
        self.last_status()
            .await
            .ok_or_else(|| MeshError::Timeout("status report".to_string()))
    }

    /// Abort anything in flight and close the link. The session is finished
    /// afterwards.
    pub async fn disconnect(&self) -> Result<()> {
        self.core.disconnect().await
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.core.abort_tasks();
    }
}

impl SessionCore {
    pub(crate) fn transport_id(&self) -> &TransportId {
        &self.device.transport_id
    }

    pub(crate) async fn state(&self) -> SessionState {
        self.shared.lock().await.state
    }

    pub(crate) async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from {}", self.device.transport_id);
        self.cancel.cancel();
        self.shared.lock().await.close(|| MeshError::Cancelled);
        self.abort_tasks();

        self.roster
            .lock()
            .await
            .mark_authenticated(&self.device.transport_id, false);

        self.link.disconnect().await.map_err(MeshError::Connection)
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        Ok(())
    }

    /// Count a failure, waking the recovery task if it invalidated the session
    fn fail(&self, shared: &mut Shared, reason: &str) {
        if shared.record_failure(reason) {
            self.relogin.notify_one();
        }
    }

    async fn send_command(&self, mesh_address: u16, command: Command) -> Result<()> {
        if !command.expects_ack() {
            return Err(MeshError::InvalidArgument(format!(
                "{} is not a client command",
                command.opcode().name()
            )));
        }

        let mut outbound = self.outbound.lock().await;
        let mut retries = 0;

        loop {
            self.check_cancelled()?;

            let state = self.state().await;
            match state {
                SessionState::Disconnected => return Err(MeshError::NotConnected),
                SessionState::Unauthenticated => {
                    info!("Logging in to {} again", self.device.transport_id);
                    self.authenticate(&mut outbound).await?;
                }
                SessionState::Authenticated if outbound.sequence.is_exhausted() => {
                    info!(
                        "Sequence space exhausted on {}, logging in again",
                        self.device.transport_id
                    );
                    self.authenticate(&mut outbound).await?;
                }
                SessionState::Authenticated => {}
            }

            match self.exchange(&mut outbound, mesh_address, &command).await {
                Ok(ACK_OK) => return Ok(()),
                Ok(status) => return Err(MeshError::Rejected(status)),
                Err(e)
                    if e.counts_as_session_failure()
                        && retries < self.config.rehandshake_attempts =>
                {
                    retries += 1;
                    warn!(
                        "{} to {} failed: {} (retry {}/{})",
                        command.opcode().name(),
                        self.device.transport_id,
                        e,
                        retries,
                        self.config.rehandshake_attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Log in again after an invalidation nobody is sending through
    async fn recover(&self) {
        for attempt in 1..=self.config.rehandshake_attempts {
            {
                let mut outbound = self.outbound.lock().await;
                if self.cancel.is_cancelled()
                    || self.state().await != SessionState::Unauthenticated
                {
                    return;
                }

                info!(
                    "Session with {} invalidated, logging in again ({}/{})",
                    self.device.transport_id, attempt, self.config.rehandshake_attempts
                );
                match self.authenticate(&mut outbound).await {
                    Ok(()) => return,
                    Err(e @ (MeshError::Cancelled | MeshError::NotConnected)) => {
                        debug!("Recovery for {} stopped: {}", self.device.transport_id, e);
                        return;
                    }
                    Err(e) => warn!(
                        "Recovery login to {} failed: {}",
                        self.device.transport_id, e
                    ),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.backoff(attempt)) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    async fn authenticate(&self, outbound: &mut Outbound) -> Result<()> {
        for (identity, key) in &self.identities {
            self.check_cancelled()?;

            match self.login(outbound, identity, key).await {
                Ok(()) => {
                    info!(
                        "Authenticated with {} as mesh '{}'",
                        self.device.transport_id, identity
                    );
                    return Ok(());
                }
                Err(e @ (MeshError::Cancelled | MeshError::NotConnected | MeshError::Io(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Mesh '{}' not accepted by {}: {}",
                        identity, self.device.transport_id, e
                    );
                }
            }
        }

        Err(MeshError::Authentication(format!(
            "none of {} mesh identities accepted by {}",
            self.identities.len(),
            self.device.transport_id
        )))
    }

    async fn login(
        &self,
        outbound: &mut Outbound,
        identity: &MeshIdentity,
        key: &SessionKey,
    ) -> Result<()> {
        let client_nonce: [u8; NONCE_LEN] = rand::random();
        let (tx, rx) = oneshot::channel();

        {
            let mut shared = self.shared.lock().await;
            if shared.state == SessionState::Disconnected {
                return Err(MeshError::NotConnected);
            }
            shared.state = SessionState::Unauthenticated;
            shared.receive_key = None;
            shared.pending_login = Some(PendingLogin {
                key: key.login_reply_key(&client_nonce),
                reply: tx,
            });
        }

        let bytes = seal_command(
            &key.login_key(),
            self.device.mesh_address,
            HANDSHAKE_SEQUENCE,
            &Command::Login {
                nonce: client_nonce,
            },
        )?;
        debug!(
            "Sending login for mesh '{}' to {}",
            identity, self.device.transport_id
        );

        let reply = match self.write_frame(&bytes).await {
            Ok(()) => {
                self.wait(rx, self.config.handshake_timeout(), "login acknowledgment")
                    .await
            }
            Err(e) => Err(e),
        };

        let device_nonce = match reply {
            Ok(nonce) => nonce,
            Err(e) => {
                self.shared.lock().await.pending_login = None;
                return Err(match e {
                    MeshError::Timeout(what) => MeshError::Authentication(format!("no {what}")),
                    other => other,
                });
            }
        };

        let LinkKeys {
            client_to_device,
            device_to_client,
        } = key.link_keys(&client_nonce, &device_nonce);
        outbound.key = Some(client_to_device);
        outbound.sequence = SequenceCounter::new();

        {
            let mut shared = self.shared.lock().await;
            if shared.state == SessionState::Disconnected {
                return Err(MeshError::Cancelled);
            }
            shared.state = SessionState::Authenticated;
            shared.receive_key = Some(device_to_client);
            shared.last_inbound = HANDSHAKE_SEQUENCE;
            shared.identity = Some(identity.clone());
            shared.failures.record_success();
            shared.stats.handshakes += 1;
        }

        let mut roster = self.roster.lock().await;
        roster.mark_authenticated(&self.device.transport_id, true);
        roster.record_exchange(&self.device.transport_id);
        Ok(())
    }

    /// One command, one sequence number, one ack
    async fn exchange(
        &self,
        outbound: &mut Outbound,
        mesh_address: u16,
        command: &Command,
    ) -> Result<u8> {
        let key = outbound.key.as_ref().ok_or(MeshError::NotConnected)?;
        let sequence = outbound.sequence.next().ok_or_else(|| {
            MeshError::Authentication("sequence space exhausted".to_string())
        })?;
        let bytes = seal_command(key, mesh_address, sequence, command)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut shared = self.shared.lock().await;
            shared.ack_waiters.insert(sequence, tx);
            if matches!(command, Command::QueryStatus) {
                shared.last_status = None;
            }
        }

        debug!(
            "Sending {} (sequence {}) to {:#06x} via {}",
            command.opcode().name(),
            sequence,
            mesh_address,
            self.device.transport_id
        );

        if let Err(e) = self.write_frame(&bytes).await {
            self.shared.lock().await.ack_waiters.remove(&sequence);
            if matches!(e, MeshError::Io(_)) {
                self.roster
                    .lock()
                    .await
                    .record_unreachable(&self.device.transport_id);
            }
            return Err(e);
        }

        let what = format!("{} ack for sequence {sequence}", command.opcode().name());
        match self.wait(rx, self.config.ack_timeout(), &what).await {
            Ok(status) => Ok(status),
            Err(e) => {
                let mut shared = self.shared.lock().await;
                shared.ack_waiters.remove(&sequence);
                if matches!(e, MeshError::Timeout(_)) {
                    self.fail(&mut shared, &e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Write with bounded exponential backoff. The cancellation flag is
    /// checked before every attempt.
    async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        let mut attempt = 0;

        loop {
            self.check_cancelled()?;

            match self.link.write(bytes).await {
                Ok(()) => {
                    self.shared.lock().await.stats.frames_sent += 1;
                    return Ok(());
                }
                Err(TransportError::Closed) => return Err(MeshError::NotConnected),
                Err(e) if attempt < self.config.write_retries => {
                    attempt += 1;
                    let delay = self.config.backoff(attempt);
                    warn!(
                        "Write to {} failed: {} (retry {}/{} in {:?})",
                        self.device.transport_id, e, attempt, self.config.write_retries, delay
                    );
                    self.shared.lock().await.stats.write_retries += 1;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(MeshError::Cancelled),
                    }
                }
                Err(e) => return Err(MeshError::Io(e)),
            }
        }
    }

    async fn wait<T>(
        &self,
        rx: oneshot::Receiver<Result<T>>,
        timeout: Duration,
        what: &str,
    ) -> Result<T> {
        tokio::select! {
            received = tokio::time::timeout(timeout, rx) => match received {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(MeshError::NotConnected),
                Err(_) => Err(MeshError::Timeout(what.to_string())),
            },
            _ = self.cancel.cancelled() => Err(MeshError::Cancelled),
        }
    }

    async fn process_notification(&self, bytes: &[u8]) -> Result<()> {
        let id = &self.device.transport_id;
        let mut session = self.shared.lock().await;
        session.stats.frames_received += 1;

        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(&mut session, &e.to_string());
                return Err(e.into());
            }
        };

        if frame.opcode == Opcode::LOGIN_ACK {
            let Some(pending) = session.pending_login.take() else {
                return Err(MeshError::Authentication(
                    "unsolicited login acknowledgment".to_string(),
                ));
            };
            let nonce = match open_frame(&pending.key, &frame) {
                Ok(Command::LoginAck { nonce }) if frame.sequence == HANDSHAKE_SEQUENCE => {
                    Ok(nonce)
                }
                Ok(_) => Err(MeshError::Authentication(
                    "malformed login acknowledgment".to_string(),
                )),
                Err(e) => Err(e),
            };
            let _ = pending.reply.send(nonce);
            return Ok(());
        }

        let opened = match session.receive_key.as_ref() {
            Some(key) => open_frame(key, &frame),
            None => {
                return Err(MeshError::Authentication(format!(
                    "{} frame outside an authenticated session",
                    frame.opcode.name()
                )));
            }
        };
        let command = match opened {
            Ok(command) => command,
            Err(e) => {
                self.fail(&mut session, &e.to_string());
                return Err(e);
            }
        };

        if frame.sequence <= session.last_inbound {
            let error = MeshError::Authentication(format!(
                "replayed inbound sequence {}",
                frame.sequence
            ));
            self.fail(&mut session, &error.to_string());
            return Err(error);
        }
        session.last_inbound = frame.sequence;
        session.failures.record_success();

        let mut status_report = None;
        match command {
            Command::Ack { sequence, status } => {
                session.stats.acks_received += 1;
                match session.ack_waiters.remove(&sequence) {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(status));
                    }
                    None => debug!("Ack for sequence {} with nobody waiting", sequence),
                }
            }
            Command::Status(status) => {
                debug!("Status from {}: {:?}", id, status);
                session.last_status = Some(status);
                status_report = Some(status);
            }
            other => debug!("Ignoring {:?} from {}", other, id),
        }
        drop(session);

        let mut roster = self.roster.lock().await;
        roster.record_exchange(id);
        if let Some(status) = status_report {
            roster.update_status(id, status);
        }
        Ok(())
    }
}

async fn run_inbound(core: Arc<SessionCore>, mut notifications: BoxStream<'static, Vec<u8>>) {
    let id = core.device.transport_id.clone();
    debug!("Starting inbound processing for {}", id);

    while let Some(bytes) = notifications.next().await {
        if let Err(e) = core.process_notification(&bytes).await {
            debug!("Dropped inbound frame from {}: {}", id, e);
        }
    }

    let mut session = core.shared.lock().await;
    if session.state != SessionState::Disconnected {
        warn!("Link to {} lost", id);
        session.close(|| MeshError::NotConnected);
        drop(session);
        core.roster.lock().await.record_unreachable(&id);
    }
    debug!("Inbound processing for {} ended", id);
}

async fn run_recovery(core: Arc<SessionCore>) {
    loop {
        tokio::select! {
            _ = core.relogin.notified() => {}
            _ = core.cancel.cancelled() => return,
        }
        core.recover().await;
    }
}
