//! Management session over stdout
//!
//! Everything the bridge publishes is turned into a [`Packet`] and queued
//! to a single writer task, so signal listeners and the request loop never
//! interleave partial lines.

use dbus_bridge_core::{
    AgentSession, BridgeError, DataObject, Event, Packet, Result as BridgeResult, Schema,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// [`AgentSession`] that emits newline-delimited JSON packets
#[derive(Clone)]
pub struct StdioSession {
    sender: mpsc::UnboundedSender<Packet>,
}

impl StdioSession {
    /// Create the session and spawn the task draining it into `writer`
    ///
    /// The task ends once every clone of the session is dropped.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_packets(receiver, writer));
        (Self { sender }, task)
    }

    /// Queue a packet for the writer task
    pub fn send(&self, packet: Packet) -> BridgeResult<()> {
        debug!("Queueing {} packet", packet.packet_type);
        self.sender
            .send(packet)
            .map_err(|_| BridgeError::Session("management output closed".to_string()))
    }
}

impl AgentSession for StdioSession {
    fn register_schema(&self, schema: Schema) -> BridgeResult<()> {
        self.send(Packet::schema(&schema)?)
    }

    fn add_data(&self, object: DataObject) -> BridgeResult<()> {
        self.send(Packet::data(&object)?)
    }

    fn raise_event(&self, event: Event) -> BridgeResult<()> {
        self.send(Packet::event(&event)?)
    }
}

async fn write_packets<W>(mut receiver: mpsc::UnboundedReceiver<Packet>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = receiver.recv().await {
        let bytes = match packet.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize {} packet: {}", packet.packet_type, e);
                continue;
            }
        };

        if let Err(e) = writer.write_all(&bytes).await {
            error!("Failed to write management packet: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("Failed to flush management output: {}", e);
            break;
        }
    }

    debug!("Management writer stopped");
}
