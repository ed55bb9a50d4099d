//! Serial Transport
//!
//! Every attached port carries newline-delimited JSON in both directions.
//! A reader task turns lines into envelopes for the hub; a writer task drains
//! a bounded queue of outbound lines. Lines that do not parse as protocol
//! messages are device chatter and are only logged at debug level.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use patchbay_core::transport::keepalive_payload;
use patchbay_core::{
    Envelope, InboundError, InboundSender, Transport, TransportAddress, TransportError,
    TransportKind, TransportResult,
};

/// Longest line accepted from a device
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Line speed used when none is configured
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// One attached port
struct PortLink {
    id: u64,
    writer: mpsc::Sender<String>,
    reader_task: JoinHandle<()>,
}

struct Inner {
    ports: DashMap<String, PortLink>,
    inbound: InboundSender,
    write_queue: usize,
    baud_rate: u32,
    next_id: AtomicU64,
}

impl Inner {
    /// Remove `port` only if it is still the link identified by `id`
    fn release(&self, port: &str, id: u64) {
        if self.ports.remove_if(port, |_, link| link.id == id).is_some() {
            tracing::info!("Serial port detached: {}", port);
        }
    }
}

/// Newline-delimited JSON over serial ports
#[derive(Clone)]
pub struct SerialTransport {
    inner: Arc<Inner>,
}

impl SerialTransport {
    pub fn new(inbound: InboundSender, write_queue: usize, baud_rate: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                ports: DashMap::new(),
                inbound,
                write_queue: write_queue.max(1),
                baud_rate,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.inner.baud_rate
    }

    /// Open a serial device at the configured speed, 8N1, and attach it
    /// under its path
    pub fn open(&self, path: &Path) -> std::io::Result<()> {
        let port = path.display().to_string();
        let stream = tokio_serial::new(port.as_str(), self.inner.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .open_native_async()?;

        let (reader, writer) = tokio::io::split(stream);
        self.attach(port, reader, writer);
        Ok(())
    }

    /// Attach a byte stream pair as `port`
    ///
    /// Returns `false` and leaves the existing link alone if `port` is
    /// already attached.
    pub fn attach<R, W>(&self, port: impl Into<String>, reader: R, writer: W) -> bool
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let port = port.into();
        let entry = match self.inner.ports.entry(port.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.write_queue);

        let reader_task = tokio::spawn(read_lines(
            Arc::downgrade(&self.inner),
            port.clone(),
            id,
            reader,
            self.inner.inbound.clone(),
        ));
        tokio::spawn(write_lines(
            Arc::downgrade(&self.inner),
            port.clone(),
            id,
            writer,
            rx,
        ));

        entry.insert(PortLink {
            id,
            writer: tx,
            reader_task,
        });
        tracing::info!("Serial port attached: {}", port);
        true
    }

    pub fn is_attached(&self, port: &str) -> bool {
        self.inner.ports.contains_key(port)
    }

    /// Attached port names, sorted
    pub fn connected_ports(&self) -> Vec<String> {
        let mut ports: Vec<_> = self.inner.ports.iter().map(|e| e.key().clone()).collect();
        ports.sort();
        ports
    }

    /// Stop reading from `port` and close it once queued lines are written
    pub fn detach(&self, port: &str) -> bool {
        match self.inner.ports.remove(port) {
            Some((_, link)) => {
                link.reader_task.abort();
                tracing::info!("Serial port detached: {}", port);
                true
            }
            None => false,
        }
    }

    pub fn detach_all(&self) {
        for port in self.connected_ports() {
            self.detach(&port);
        }
    }

    fn send_line(&self, port: &str, payload: &Value) -> TransportResult<()> {
        let line = serde_json::to_string(payload).map_err(|e| TransportError::Encode(e.to_string()))?;
        let link = self
            .inner
            .ports
            .get(port)
            .ok_or_else(|| TransportError::NotConnected(port.to_string()))?;

        link.writer.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Io(format!("write queue full for {}", port))
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected(port.to_string()),
        })
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("ports", &self.connected_ports())
            .field("write_queue", &self.inner.write_queue)
            .field("baud_rate", &self.inner.baud_rate)
            .finish()
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn deliver(&self, address: &TransportAddress, payload: Value) -> TransportResult<()> {
        match address {
            TransportAddress::Serial { port } => self.send_line(port, &payload),
            other => Err(TransportError::WrongAddress(other.to_string())),
        }
    }

    async fn keepalive(&self, address: &TransportAddress) -> TransportResult<()> {
        self.deliver(address, keepalive_payload()).await
    }
}

async fn read_lines<R>(
    inner: Weak<Inner>,
    port: String,
    id: u64,
    reader: R,
    inbound: InboundSender,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let source = TransportAddress::serial(port.clone());

    while let Some(result) = lines.next().await {
        let line = match result {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!("Discarding oversized line from {}", port);
                continue;
            }
            Err(LinesCodecError::Io(e)) => {
                tracing::warn!("Read error on {}: {}", port, e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match Envelope::parse(line.as_bytes(), source.clone()) {
            Ok(envelope) => {
                tracing::trace!("{} -> {}", port, envelope.kind());
                if let Err(InboundError::Closed) = inbound.send(envelope).await {
                    break;
                }
            }
            Err(e) => tracing::debug!("Ignoring line from {} ({}): {}", port, e, line),
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.release(&port, id);
    }
}

async fn write_lines<W>(
    inner: Weak<Inner>,
    port: String,
    id: u64,
    writer: W,
    mut rx: mpsc::Receiver<String>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new());

    while let Some(line) = rx.recv().await {
        if let Err(e) = sink.send(line).await {
            tracing::warn!("Write error on {}: {}", port, e);
            if let Some(inner) = inner.upgrade() {
                inner.release(&port, id);
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use patchbay_core::{Dispatcher, Hub, HubHandle, HubSettings, PluginStatus};
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf};

    struct Device {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Device {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(1), self.lines.next_line())
                .await
                .expect("no line from hub")
                .unwrap()
                .expect("stream closed");
            serde_json::from_str(&line).unwrap()
        }
    }

    fn start_hub() -> (SerialTransport, HubHandle) {
        let hub = Hub::new(HubSettings::default());
        let serial = SerialTransport::new(hub.inbound(), 8, DEFAULT_BAUD_RATE);
        let handle = hub.start(Dispatcher::new().with_transport(Arc::new(serial.clone())));
        (serial, handle)
    }

    fn connect(serial: &SerialTransport, port: &str) -> Device {
        let (hub_side, device_side) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(hub_side);
        assert!(serial.attach(port, reader, writer));

        let (device_reader, device_writer) = tokio::io::split(device_side);
        Device {
            lines: BufReader::new(device_reader).lines(),
            writer: device_writer,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_register_over_serial() {
        let (serial, handle) = start_hub();
        let mut device = connect(&serial, "sim0");

        device
            .send(r#"{"type":"register","plugin_name":"lamp","capabilities":["dim"],"heartbeat_interval":1000}"#)
            .await;
        assert_eq!(device.recv().await, json!({"cmd": "registered"}));

        let record = handle.registry().get("lamp").unwrap();
        assert_eq!(record.address, TransportAddress::serial("sim0"));
        assert_eq!(record.heartbeat_interval_ms, 1000);
        assert_eq!(record.status, PluginStatus::Connected);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_with_unfamiliar_method_surface() {
        let (serial, handle) = start_hub();
        let mut device = connect(&serial, "sim5");

        device
            .send(r#"{"type":"register","plugin_name":"dimmer","heartbeat_interval":18446744073709551615,"methods":[{"name":"set","parameters":[{"name":"n","type":"integer"}]},{"parameters":7}]}"#)
            .await;
        assert_eq!(device.recv().await, json!({"cmd": "registered"}));

        let record = handle.registry().get("dimmer").unwrap();
        assert_eq!(record.methods.len(), 1);
        assert_eq!(record.methods[0].parameters[0].param_type, "integer");
        assert_eq!(record.heartbeat_interval_ms, u64::MAX);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_chatter_is_ignored() {
        let (serial, handle) = start_hub();
        let mut device = connect(&serial, "sim1");

        device.send("boot: rev 3").await;
        device.send("").await;
        device.send(r#"{"no":"type"}"#).await;
        device.send("\r").await;
        device
            .send(r#"{"type":"register","plugin_name":"fan"}"#)
            .await;

        assert_eq!(device.recv().await, json!({"cmd": "registered"}));
        assert!(handle.registry().contains("fan"));
        assert!(serial.is_attached("sim1"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_between_ports() {
        let (serial, handle) = start_hub();
        let mut sensor = connect(&serial, "sim-a");
        let mut lamp = connect(&serial, "sim-b");

        lamp.send(r#"{"type":"register","plugin_name":"lamp"}"#).await;
        assert_eq!(lamp.recv().await, json!({"cmd": "registered"}));
        sensor.send(r#"{"type":"register","plugin_name":"sensor"}"#).await;
        assert_eq!(sensor.recv().await, json!({"cmd": "registered"}));

        sensor
            .send(r#"{"type":"publish","plugin_name":"sensor","to_plugin":"lamp","message":{"on":true}}"#)
            .await;
        assert_eq!(lamp.recv().await, json!({"on": true}));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_deliver_errors() {
        let hub = Hub::new(HubSettings::default());
        let serial = SerialTransport::new(hub.inbound(), 8, DEFAULT_BAUD_RATE);

        let result = serial
            .deliver(&TransportAddress::serial("COM9"), json!({}))
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected(_))));

        let result = serial
            .deliver(&TransportAddress::http("http://host:1"), json!({}))
            .await;
        assert!(matches!(result, Err(TransportError::WrongAddress(_))));
    }

    #[tokio::test]
    async fn test_keepalive_line() {
        let (serial, handle) = start_hub();
        let mut device = connect(&serial, "sim2");

        tokio_test::assert_ok!(serial.keepalive(&TransportAddress::serial("sim2")).await);
        assert_eq!(device.recv().await, json!({"cmd": "heartbeat"}));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_detach_on_eof() {
        let (serial, handle) = start_hub();
        let device = connect(&serial, "sim3");
        assert_eq!(serial.connected_ports(), vec!["sim3"]);

        drop(device);
        wait_for(|| !serial.is_attached("sim3")).await;

        // Reattaching the same name is allowed once the old link is gone
        let _device = connect(&serial, "sim3");
        assert!(serial.is_attached("sim3"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_attach_twice_rejected() {
        let hub = Hub::new(HubSettings::default());
        let serial = SerialTransport::new(hub.inbound(), 8, DEFAULT_BAUD_RATE);
        let _device = connect(&serial, "sim4");

        let (hub_side, _other) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(hub_side);
        assert!(!serial.attach("sim4", reader, writer));

        assert_eq!(serial.baud_rate(), DEFAULT_BAUD_RATE);
        assert!(serial.detach("sim4"));
        assert!(!serial.detach("sim4"));
        assert!(serial.connected_ports().is_empty());
    }
}
