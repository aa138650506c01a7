//! The monitor connection: a single Listen session per client that feeds
//! Attached/Detached events into the device registry.
// Jackson Coxson

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    ClientOptions, UsbmuxError, UsbmuxSocket,
    codec::{ListenRequest, MuxMessage, MuxPacketType, encode_mux_frame, read_mux_message},
    reader::ExactReader,
    registry::DeviceRegistry,
};

type MonitorReader = ExactReader<ReadHalf<UsbmuxSocket>>;
type ConnectAttempt = Shared<BoxFuture<'static, Result<(), Arc<UsbmuxError>>>>;

enum MonitorState {
    Idle,
    /// Every caller awaits this one attempt
    Connecting(ConnectAttempt),
    Listening(MonitorConnection),
}

struct MonitorConnection {
    /// Kept so the socket stays open while the dispatch task reads
    writer: WriteHalf<UsbmuxSocket>,
    dispatch: JoinHandle<()>,
}

struct MonitorSlot {
    /// Bumped for every attempt and on shutdown. Attempts and dispatch tasks
    /// only touch the state while their generation is current.
    generation: u64,
    state: MonitorState,
}

struct Inner {
    options: Arc<ClientOptions>,
    registry: DeviceRegistry,
    slot: Mutex<MonitorSlot>,
}

/// Owns the monitor connection and reconnects it on demand
pub(crate) struct MonitorManager {
    inner: Arc<Inner>,
}

impl MonitorManager {
    pub(crate) fn new(options: Arc<ClientOptions>, registry: DeviceRegistry) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                registry,
                slot: Mutex::new(MonitorSlot {
                    generation: 0,
                    state: MonitorState::Idle,
                }),
            }),
        }
    }

    /// Makes sure a Listen session is up, connecting if needed
    ///
    /// Concurrent callers share a single connection attempt and all observe
    /// its outcome. A failed attempt leaves the monitor idle, so the next
    /// call tries again.
    pub(crate) async fn ensure_connected(&self) -> Result<(), UsbmuxError> {
        let attempt = {
            let mut slot = self.inner.slot.lock().await;
            match &slot.state {
                MonitorState::Listening(conn) if !conn.dispatch.is_finished() => return Ok(()),
                MonitorState::Connecting(attempt) => attempt.clone(),
                _ => {
                    // No session is live, so nothing in the registry is current
                    self.inner.registry.clear().await;
                    slot.generation += 1;
                    let attempt = self
                        .inner
                        .clone()
                        .connect(slot.generation)
                        .boxed()
                        .shared();
                    slot.state = MonitorState::Connecting(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await.map_err(UsbmuxError::Monitor)
    }

    pub(crate) async fn is_listening(&self) -> bool {
        match &self.inner.slot.lock().await.state {
            MonitorState::Listening(conn) => !conn.dispatch.is_finished(),
            _ => false,
        }
    }

    /// Closes the monitor connection and forgets all devices
    ///
    /// Safe to call repeatedly. An attempt that is still in flight fails with
    /// `ClientClosed` once it completes.
    pub(crate) async fn shutdown(&self) {
        let mut slot = self.inner.slot.lock().await;
        slot.generation += 1;
        match std::mem::replace(&mut slot.state, MonitorState::Idle) {
            MonitorState::Listening(mut conn) => {
                info!("Closing monitor connection");
                conn.dispatch.abort();
                let _ = (&mut conn.dispatch).await;
                if let Err(e) = conn.writer.shutdown().await {
                    debug!("Monitor socket was already gone: {e}");
                }
            }
            MonitorState::Connecting(_) => debug!("Abandoning monitor connection attempt"),
            MonitorState::Idle => {}
        }
        self.inner.registry.clear().await;
    }
}

impl Inner {
    async fn connect(self: Arc<Self>, generation: u64) -> Result<(), Arc<UsbmuxError>> {
        let (reader, writer) = match self.listen().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to start listening on usbmuxd: {e}");
                let mut slot = self.slot.lock().await;
                if slot.generation == generation {
                    slot.state = MonitorState::Idle;
                }
                return Err(Arc::new(e));
            }
        };

        let dispatch = tokio::spawn(self.clone().dispatch(reader, generation));

        // Devices that were attached before we connected are reported right
        // after the handshake; let them land before anyone reads the registry
        tokio::time::sleep(self.options.settle_delay).await;

        let mut slot = self.slot.lock().await;
        if slot.generation != generation {
            debug!("Client closed while the monitor was connecting");
            dispatch.abort();
            let _ = dispatch.await;
            return Err(Arc::new(UsbmuxError::ClientClosed));
        }
        if dispatch.is_finished() {
            debug!("Monitor connection ended while settling");
            slot.state = MonitorState::Idle;
            return Ok(());
        }

        info!("Listening for device events");
        slot.state = MonitorState::Listening(MonitorConnection { writer, dispatch });
        Ok(())
    }

    /// Opens a connection and performs the Listen handshake
    async fn listen(&self) -> Result<(MonitorReader, WriteHalf<UsbmuxSocket>), UsbmuxError> {
        let socket = self.options.addr.to_socket().await?;
        let (read, mut write) = tokio::io::split(socket);

        let request = ListenRequest::new(
            self.options.client_version.clone(),
            self.options.prog_name.clone(),
        );
        let frame = encode_mux_frame(
            &request,
            self.options.header_version,
            MuxPacketType::Plist,
            self.options.tag,
        )?;
        write.write_all(&frame).await?;
        write.flush().await?;

        let mut reader = ExactReader::new(read);
        match read_mux_message(&mut reader, self.options.max_frame_len).await? {
            Some(MuxMessage::Result { number }) => match UsbmuxError::from_result_code(number) {
                None => Ok((reader, write)),
                Some(e) => Err(e),
            },
            Some(other) => Err(UsbmuxError::UnexpectedMessage {
                expected: "Result",
                got: other.message_type().to_string(),
            }),
            None => Err(UsbmuxError::ConnectionClosed),
        }
    }

    /// Applies device events in arrival order until the connection ends
    async fn dispatch(self: Arc<Self>, mut reader: MonitorReader, generation: u64) {
        loop {
            match read_mux_message(&mut reader, self.options.max_frame_len).await {
                Ok(Some(MuxMessage::Attached(record))) => {
                    let slot = self.slot.lock().await;
                    if slot.generation != generation {
                        debug!("Dropping Attached for {} from a closed session", record.device_id);
                        break;
                    }
                    self.registry.attach(record).await;
                }
                Ok(Some(MuxMessage::Detached { device_id })) => {
                    let slot = self.slot.lock().await;
                    if slot.generation != generation {
                        debug!("Dropping Detached for {device_id} from a closed session");
                        break;
                    }
                    self.registry.detach(device_id).await;
                }
                Ok(Some(other)) => debug!("Ignoring {} message", other.message_type()),
                Ok(None) => {
                    info!("usbmuxd closed the monitor connection");
                    break;
                }
                // The frame was consumed whole, so the stream is still in sync
                Err(UsbmuxError::UnknownMessageType(t)) => {
                    warn!("Received unexpected message type during listen: {t}")
                }
                Err(UsbmuxError::UnexpectedResponse) => {
                    warn!("Received malformed message during listen")
                }
                Err(e) => {
                    warn!("Monitor connection failed: {e}");
                    break;
                }
            }
        }
        self.disconnected(generation).await;
    }

    async fn disconnected(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.generation != generation {
            return;
        }
        self.registry.clear().await;
        if let MonitorState::Listening(_) = slot.state {
            slot.state = MonitorState::Idle;
        }
    }
}
