//! In-memory fixtures that speak the device side of the protocol.
//!
//! A [`SimulatedDevice`] answers logins, executes light commands,
//! acknowledges them and reports status, exactly as a real fixture would
//! over its notify characteristic. Fault knobs let callers make writes fail,
//! swallow acknowledgments, garble replies, refuse connections or drop the
//! link.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

use super::{Advertisement, Link, Transport, TransportId};
use crate::codec::{BROADCAST_ADDRESS, Frame, LOCAL_ADDRESS, decode_frame};
use crate::command::{ACK_OK, Command, LightStatus, NONCE_LEN, Opcode};
use crate::config::{MeshIdentity, TELINK_MESH_SERVICE};
use crate::crypto::{LinkKeys, SessionKey};
use crate::error::TransportError;
use crate::packet::{open_frame, seal_command};

/// Manufacturer id the fixtures advertise their mesh address under
pub const SIMULATED_COMPANY_ID: u16 = 0x0211;

/// A command the fixture accepted, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCommand {
    pub sequence: u32,
    pub command: Command,
}

#[derive(Debug, Default)]
struct Faults {
    refuse_connects: u32,
    fail_writes: u32,
    drop_acks: u32,
    corrupt_replies: u32,
}

struct DeviceSession {
    keys: LinkKeys,
    last_received: u32,
    last_sent: u32,
}

struct Fixture {
    mesh_key: SessionKey,
    connected: bool,
    generation: u64,
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    session: Option<DeviceSession>,
    status: LightStatus,
    received: Vec<ReceivedCommand>,
    written: Vec<Vec<u8>>,
    logins: u32,
    rejected: u32,
    faults: Faults,
}

impl Fixture {
    fn reject(&mut self, reason: &str) -> Vec<Vec<u8>> {
        debug!("Simulated fixture rejected frame: {}", reason);
        self.rejected += 1;
        Vec::new()
    }

    fn receive(&mut self, mesh_address: u16, bytes: &[u8]) -> Vec<Vec<u8>> {
        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => return self.reject(&e.to_string()),
        };

        if ![mesh_address, LOCAL_ADDRESS, BROADCAST_ADDRESS].contains(&frame.mesh_address) {
            return self.reject("addressed to another node");
        }

        if frame.opcode == Opcode::LOGIN {
            self.login(mesh_address, &frame)
        } else {
            self.command(mesh_address, &frame)
        }
    }

    fn login(&mut self, mesh_address: u16, frame: &Frame) -> Vec<Vec<u8>> {
        if frame.sequence != 0 {
            return self.reject("login outside sequence 0");
        }

        let client_nonce = match open_frame(&self.mesh_key.login_key(), frame) {
            Ok(Command::Login { nonce }) => nonce,
            Ok(_) => return self.reject("unexpected login body"),
            Err(e) => return self.reject(&e.to_string()),
        };

        self.logins += 1;
        self.received.push(ReceivedCommand {
            sequence: frame.sequence,
            command: Command::Login {
                nonce: client_nonce,
            },
        });

        let device_nonce: [u8; NONCE_LEN] = rand::random();
        self.session = Some(DeviceSession {
            keys: self.mesh_key.link_keys(&client_nonce, &device_nonce),
            last_received: 0,
            last_sent: 0,
        });

        let reply = Command::LoginAck {
            nonce: device_nonce,
        };
        let reply_key = self.mesh_key.login_reply_key(&client_nonce);
        match seal_command(&reply_key, mesh_address, 0, &reply) {
            Ok(bytes) => vec![bytes],
            Err(e) => self.reject(&e.to_string()),
        }
    }

    fn command(&mut self, mesh_address: u16, frame: &Frame) -> Vec<Vec<u8>> {
        let Some(session) = self.session.as_mut() else {
            return self.reject("no session");
        };

        let command = match open_frame(&session.keys.client_to_device, frame) {
            Ok(command) => command,
            Err(e) => return self.reject(&e.to_string()),
        };
        if frame.sequence <= session.last_received {
            return self.reject("replayed sequence");
        }
        session.last_received = frame.sequence;

        let mut replies = vec![];
        match command {
            Command::Power(on) => self.status.on = on,
            Command::Brightness(level) => self.status.brightness = level,
            Command::Color(rgb) => self.status.color = rgb,
            Command::QueryStatus => replies.push(Command::Status(self.status)),
            _ => return self.reject("not a client command"),
        }
        self.received.push(ReceivedCommand {
            sequence: frame.sequence,
            command,
        });

        if self.faults.drop_acks > 0 {
            self.faults.drop_acks -= 1;
        } else {
            replies.push(Command::Ack {
                sequence: frame.sequence,
                status: ACK_OK,
            });
        }

        let mut sealed = Vec::with_capacity(replies.len());
        for reply in replies {
            match self.seal_reply(mesh_address, &reply) {
                Some(bytes) => sealed.push(bytes),
                None => return self.reject("sequence space exhausted"),
            }
        }
        self.garble(sealed)
    }

    fn seal_reply(&mut self, mesh_address: u16, reply: &Command) -> Option<Vec<u8>> {
        let session = self.session.as_mut()?;
        session.last_sent += 1;
        seal_command(
            &session.keys.device_to_client,
            mesh_address,
            session.last_sent,
            reply,
        )
        .ok()
    }

    /// Swap the replies for garbage while the corrupt-replies knob is set.
    /// Even slots carry a flipped tag, odd slots are cut short.
    fn garble(&mut self, replies: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        if self.faults.corrupt_replies == 0 || replies.is_empty() {
            return replies;
        }
        let count = std::mem::take(&mut self.faults.corrupt_replies);
        let template = &replies[0];

        (0..count)
            .map(|i| {
                let mut bytes = template.clone();
                if i % 2 == 0 {
                    if let Some(last) = bytes.last_mut() {
                        *last ^= 0x01;
                    }
                } else {
                    bytes.truncate(5);
                }
                bytes
            })
            .collect()
    }

    fn deliver(&mut self, replies: Vec<Vec<u8>>) {
        for reply in replies {
            self.subscribers.retain(|tx| tx.send(reply.clone()).is_ok());
        }
    }

    fn close(&mut self) {
        self.connected = false;
        self.subscribers.clear();
        self.session = None;
    }
}

/// A light fixture living in memory. Clones share the same fixture.
#[derive(Clone)]
pub struct SimulatedDevice {
    transport_id: TransportId,
    mesh_address: u16,
    name: Option<String>,
    rssi: i16,
    service_uuids: Vec<Uuid>,
    fixture: Arc<Mutex<Fixture>>,
}

impl SimulatedDevice {
    /// A fixture provisioned into the mesh `identity`
    pub fn new(transport_id: impl Into<String>, mesh_address: u16, identity: &MeshIdentity) -> Self {
        Self {
            transport_id: TransportId::new(transport_id),
            mesh_address,
            name: Some(format!("{} {:04x}", identity.name(), mesh_address)),
            rssi: -55,
            service_uuids: vec![TELINK_MESH_SERVICE],
            fixture: Arc::new(Mutex::new(Fixture {
                mesh_key: identity.session_key(),
                connected: false,
                generation: 0,
                subscribers: Vec::new(),
                session: None,
                status: LightStatus::default(),
                received: Vec::new(),
                written: Vec::new(),
                logins: 0,
                rejected: 0,
                faults: Faults::default(),
            })),
        }
    }

    pub fn with_name(mut self, name: Option<&str>) -> Self {
        self.name = name.map(str::to_string);
        self
    }

    pub fn with_services(mut self, services: Vec<Uuid>) -> Self {
        self.service_uuids = services;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn transport_id(&self) -> &TransportId {
        &self.transport_id
    }

    pub fn mesh_address(&self) -> u16 {
        self.mesh_address
    }

    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            transport_id: self.transport_id.clone(),
            local_name: self.name.clone(),
            rssi: Some(self.rssi),
            service_uuids: self.service_uuids.clone(),
            manufacturer_data: [(
                SIMULATED_COMPANY_ID,
                self.mesh_address.to_le_bytes().to_vec(),
            )]
            .into_iter()
            .collect(),
        }
    }

    /// Fail the next `n` connection attempts
    pub async fn refuse_connects(&self, n: u32) {
        self.fixture.lock().await.faults.refuse_connects = n;
    }

    /// Fail the next `n` writes before they reach the fixture
    pub async fn fail_writes(&self, n: u32) {
        self.fixture.lock().await.faults.fail_writes = n;
    }

    /// Execute the next `n` commands without acknowledging them
    pub async fn drop_acks(&self, n: u32) {
        self.fixture.lock().await.faults.drop_acks = n;
    }

    /// Replace the next reply with `n` frames that will not open
    pub async fn corrupt_replies(&self, n: u32) {
        self.fixture.lock().await.faults.corrupt_replies = n;
    }

    /// Simulate the radio link going away
    pub async fn drop_link(&self) {
        self.fixture.lock().await.close();
    }

    /// Send an unsolicited status report over the current session
    pub async fn push_status(&self) -> bool {
        let mut fixture = self.fixture.lock().await;
        let status = Command::Status(fixture.status);
        match fixture.seal_reply(self.mesh_address, &status) {
            Some(bytes) => {
                fixture.deliver(vec![bytes]);
                true
            }
            None => false,
        }
    }

    /// Deliver raw bytes to subscribed clients as if the fixture had sent them
    pub async fn notify(&self, bytes: &[u8]) {
        self.fixture.lock().await.deliver(vec![bytes.to_vec()]);
    }

    /// Feed bytes to the fixture as if a client had written them
    pub async fn inject(&self, bytes: &[u8]) {
        let mut fixture = self.fixture.lock().await;
        let replies = fixture.receive(self.mesh_address, bytes);
        fixture.deliver(replies);
    }

    pub async fn set_status(&self, status: LightStatus) {
        self.fixture.lock().await.status = status;
    }

    pub async fn status(&self) -> LightStatus {
        self.fixture.lock().await.status
    }

    pub async fn received(&self) -> Vec<ReceivedCommand> {
        self.fixture.lock().await.received.clone()
    }

    /// Raw bytes of every write that reached the fixture
    pub async fn written(&self) -> Vec<Vec<u8>> {
        self.fixture.lock().await.written.clone()
    }

    pub async fn login_count(&self) -> u32 {
        self.fixture.lock().await.logins
    }

    /// Frames the fixture refused to act on
    pub async fn rejected(&self) -> u32 {
        self.fixture.lock().await.rejected
    }

    pub async fn is_connected(&self) -> bool {
        self.fixture.lock().await.connected
    }

    async fn open(&self) -> Result<u64, TransportError> {
        let mut fixture = self.fixture.lock().await;
        if fixture.faults.refuse_connects > 0 {
            fixture.faults.refuse_connects -= 1;
            return Err(TransportError::Connect(format!(
                "{} refused the connection",
                self.transport_id
            )));
        }

        fixture.close();
        fixture.connected = true;
        fixture.generation += 1;
        Ok(fixture.generation)
    }
}

pub struct SimulatedLink {
    device: SimulatedDevice,
    generation: u64,
}

impl SimulatedLink {
    async fn live(&self) -> Result<tokio::sync::MutexGuard<'_, Fixture>, TransportError> {
        let fixture = self.device.fixture.lock().await;
        if !fixture.connected || fixture.generation != self.generation {
            return Err(TransportError::Closed);
        }
        Ok(fixture)
    }
}

#[async_trait]
impl Link for SimulatedLink {
    fn id(&self) -> &TransportId {
        &self.device.transport_id
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut fixture = self.live().await?;
        if fixture.faults.fail_writes > 0 {
            fixture.faults.fail_writes -= 1;
            return Err(TransportError::Write("injected write failure".to_string()));
        }

        fixture.written.push(bytes.to_vec());
        let replies = fixture.receive(self.device.mesh_address, bytes);
        fixture.deliver(replies);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let mut fixture = self.live().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        fixture.subscribers.push(tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|bytes| (bytes, rx))
        })
        .boxed())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut fixture = self.device.fixture.lock().await;
        if fixture.generation == self.generation {
            fixture.close();
        }
        Ok(())
    }
}

/// Transport over a fixed set of simulated fixtures
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    devices: Vec<SimulatedDevice>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: SimulatedDevice) -> Self {
        self.devices.push(device);
        self
    }

    pub fn devices(&self) -> &[SimulatedDevice] {
        &self.devices
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn scan(
        &self,
        timeout: Duration,
    ) -> Result<BoxStream<'static, Advertisement>, TransportError> {
        let adverts: Vec<Advertisement> = self.devices.iter().map(|d| d.advertisement()).collect();
        Ok(stream::iter(adverts)
            .take_until(tokio::time::sleep(timeout))
            .boxed())
    }

    async fn connect(&self, id: &TransportId) -> Result<Arc<dyn Link>, TransportError> {
        let device = self
            .devices
            .iter()
            .find(|d| &d.transport_id == id)
            .ok_or_else(|| TransportError::DeviceNotFound(id.to_string()))?;

        let generation = device.open().await?;
        Ok(Arc::new(SimulatedLink {
            device: device.clone(),
            generation,
        }))
    }
}
