//! Raw tunnels to ports on a device
//!
//! Every tunnel is its own usbmuxd connection: a Connect request is sent, and
//! once usbmuxd answers with success the socket carries the device's bytes
//! unchanged.
// Jackson Coxson

use std::{
    collections::HashMap,
    fmt,
    io,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use bytes::BytesMut;
use futures::future::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info};

use crate::{
    ClientOptions, UsbmuxError, UsbmuxSocket,
    codec::{ConnectRequest, MuxMessage, MuxPacketType, encode_mux_frame, read_mux_message},
    reader::ExactReader,
};

/// The tunnel's socket, shared with the manager so `close_all` can drop it
type SocketSlot = Arc<Mutex<Option<UsbmuxSocket>>>;

struct OpenTunnel {
    token: CancellationToken,
    socket: SocketSlot,
}

type OpenTunnels = Arc<Mutex<HashMap<u64, OpenTunnel>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens tunnels and remembers which ones are still open
pub struct TunnelManager {
    options: Arc<ClientOptions>,
    open: OpenTunnels,
    next_id: AtomicU64,
}

impl TunnelManager {
    pub fn new(options: Arc<ClientOptions>) -> Self {
        Self {
            options,
            open: OpenTunnels::default(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Connects to a port on a device
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `port` - TCP port on the device (host byte order)
    ///
    /// # Errors
    /// * `Socket` if usbmuxd cannot be reached
    /// * the classified result code if usbmuxd refuses the request
    /// * `UnexpectedMessage` / `ConnectionClosed` if it answers with anything else
    pub async fn create_tunnel(
        &self,
        device_id: u32,
        port: u16,
    ) -> Result<DeviceTunnel, UsbmuxError> {
        debug!("Connecting to device {device_id} on port {port}");
        let socket = self.options.addr.to_socket().await?;
        let mut reader = ExactReader::new(socket);

        let request = ConnectRequest::new(
            self.options.client_version.clone(),
            self.options.prog_name.clone(),
            device_id,
            port,
        );
        let frame = encode_mux_frame(
            &request,
            self.options.header_version,
            MuxPacketType::Plist,
            self.options.tag,
        )?;
        reader.get_mut().write_all(&frame).await?;
        reader.get_mut().flush().await?;

        match read_mux_message(&mut reader, self.options.max_frame_len).await? {
            Some(MuxMessage::Result { number }) => {
                if let Some(e) = UsbmuxError::from_result_code(number) {
                    debug!("usbmuxd refused tunnel to {device_id}:{port}: {e}");
                    return Err(e);
                }
            }
            Some(other) => {
                return Err(UsbmuxError::UnexpectedMessage {
                    expected: "Result",
                    got: other.message_type().to_string(),
                });
            }
            None => return Err(UsbmuxError::ConnectionClosed),
        }

        let (socket, leftover) = reader.into_parts();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let socket: SocketSlot = Arc::new(Mutex::new(Some(socket)));
        lock(&self.open).insert(
            id,
            OpenTunnel {
                token: token.clone(),
                socket: socket.clone(),
            },
        );
        info!("Opened tunnel {id} to device {device_id} port {port}");

        Ok(DeviceTunnel {
            id,
            device_id,
            port,
            socket,
            leftover,
            cancelled: Box::pin(token.cancelled_owned()),
            open: self.open.clone(),
        })
    }

    /// Tears down every open tunnel
    ///
    /// The sockets are released right away, whether or not their tunnels are
    /// ever polled again. Pending reads and writes fail with `ConnectionAborted`.
    pub fn close_all(&self) {
        let tunnels = lock(&self.open)
            .drain()
            .map(|(_, tunnel)| tunnel)
            .collect::<Vec<OpenTunnel>>();
        if !tunnels.is_empty() {
            info!("Closing {} tunnels", tunnels.len());
        }
        for tunnel in tunnels {
            drop(lock(&tunnel.socket).take());
            tunnel.token.cancel();
        }
    }

    /// Number of tunnels that have not been closed yet
    ///
    /// A tunnel whose peer hung up still counts until it is read to the end
    /// or dropped.
    pub fn open_count(&self) -> usize {
        lock(&self.open).len()
    }
}

impl fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelManager")
            .field("addr", &self.options.addr)
            .field("open", &self.open_count())
            .finish()
    }
}

/// A byte stream to a port on a device
///
/// Leaves the manager's open set when a read sees end of stream, on an I/O
/// error, on `close_all`, or when dropped. A peer hangup is only noticed by
/// reading.
pub struct DeviceTunnel {
    id: u64,
    device_id: u32,
    port: u16,
    socket: SocketSlot,
    /// Device bytes that arrived together with the Connect result
    leftover: BytesMut,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    open: OpenTunnels,
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel was closed")
}

impl DeviceTunnel {
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn deregister(&self) {
        if lock(&self.open).remove(&self.id).is_some() {
            debug!("Tunnel {} closed", self.id);
        }
    }

    /// Releases the socket if `close_all` ran
    fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> bool {
        if self.cancelled.poll_unpin(cx).is_ready() {
            drop(lock(&self.socket).take());
            self.deregister();
            return true;
        }
        false
    }

    /// Polls the socket unless the tunnel was closed, deregistering on errors
    fn poll_socket<T>(
        &mut self,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut UsbmuxSocket>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        if self.poll_cancelled(cx) {
            return Poll::Ready(Err(aborted()));
        }
        let res = match lock(&self.socket).as_mut() {
            Some(socket) => op(Pin::new(socket), cx),
            None => Poll::Ready(Err(aborted())),
        };
        if let Poll::Ready(Err(_)) = &res {
            self.deregister();
        }
        res
    }
}

impl AsyncRead for DeviceTunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.leftover.is_empty() {
            if this.poll_cancelled(cx) {
                return Poll::Ready(Err(aborted()));
            }
            let len = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover.split_to(len));
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        let res = this.poll_socket(cx, |socket, cx| socket.poll_read(cx, buf));
        if let Poll::Ready(Ok(())) = &res
            && buf.filled().len() == before
            && buf.remaining() > 0
        {
            this.deregister();
        }
        res
    }
}

impl AsyncWrite for DeviceTunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_socket(cx, |socket, cx| socket.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .poll_socket(cx, |socket, cx| socket.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match lock(&self.socket).as_mut() {
            Some(socket) => Pin::new(socket).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for DeviceTunnel {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl fmt::Debug for DeviceTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTunnel")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("port", &self.port)
            .field("open", &lock(&self.socket).is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::mock::MockMuxd;

    #[tokio::test]
    async fn tunnel_carries_device_bytes() {
        let muxd = MockMuxd::bind().await;
        let tunnels = TunnelManager::new(Arc::new(muxd.options()));

        let server = async {
            let (mut peer, request) = muxd.accept_tunnel(0).await;
            assert_eq!(
                request.get("DeviceID").and_then(|x| x.as_unsigned_integer()),
                Some(1)
            );
            assert_eq!(
                request
                    .get("PortNumber")
                    .and_then(|x| x.as_unsigned_integer()),
                Some(0x7EF2)
            );
            assert_eq!(peer.read_raw(4).await.unwrap(), b"ping");
            peer.write_raw(b"pong").await;
            peer
        };
        let client = async {
            let mut tunnel = tunnels.create_tunnel(1, 62078).await.unwrap();
            assert_eq!(tunnels.open_count(), 1);
            tunnel.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            tunnel.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
            tunnel
        };
        let (_peer, tunnel) = tokio::join!(server, client);

        drop(tunnel);
        assert_eq!(tunnels.open_count(), 0);
    }

    #[tokio::test]
    async fn refused_tunnel_is_classified() {
        let muxd = MockMuxd::bind().await;
        let tunnels = TunnelManager::new(Arc::new(muxd.options()));

        let (_peer, res) = tokio::join!(muxd.accept_tunnel(3), tunnels.create_tunnel(1, 8080));
        assert!(matches!(res, Err(UsbmuxError::UsbConnectionRefused)));
        assert_eq!(tunnels.open_count(), 0);
    }

    #[tokio::test]
    async fn peer_close_leaves_the_open_set() {
        let muxd = MockMuxd::bind().await;
        let tunnels = TunnelManager::new(Arc::new(muxd.options()));

        let (peer, tunnel) = tokio::join!(muxd.accept_tunnel(0), tunnels.create_tunnel(2, 22));
        let mut tunnel = tunnel.unwrap();
        drop(peer);
        // Nothing has read the hangup yet
        assert_eq!(tunnels.open_count(), 1);

        let mut buf = Vec::new();
        tunnel.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert_eq!(tunnels.open_count(), 0);
    }

    #[tokio::test]
    async fn close_all_resolves_pending_reads() {
        let muxd = MockMuxd::bind().await;
        let tunnels = TunnelManager::new(Arc::new(muxd.options()));

        let (_peer, tunnel) = tokio::join!(muxd.accept_tunnel(0), tunnels.create_tunnel(2, 22));
        let mut tunnel = tunnel.unwrap();

        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            tunnel.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tunnels.close_all();

        let res = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("read did not resolve")
            .unwrap();
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(tunnels.open_count(), 0);
    }

    #[tokio::test]
    async fn close_all_releases_idle_tunnels() {
        let muxd = MockMuxd::bind().await;
        let tunnels = TunnelManager::new(Arc::new(muxd.options()));

        let (peer, tunnel) = tokio::join!(muxd.accept_tunnel(0), tunnels.create_tunnel(2, 22));
        let (mut peer, _) = peer;
        let mut tunnel = tunnel.unwrap();

        tunnels.close_all();
        assert_eq!(tunnels.open_count(), 0);

        // The tunnel is still held but never polled
        let hangup = tokio::time::timeout(Duration::from_secs(2), peer.read_raw(1))
            .await
            .expect("usbmuxd connection stayed open");
        assert!(hangup.is_none());

        let err = tunnel.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn bytes_sent_with_the_result_are_read_first() {
        let muxd = MockMuxd::bind().await;
        let tunnels = TunnelManager::new(Arc::new(muxd.options()));

        let server = async {
            let mut peer = muxd.accept().await;
            peer.read_request().await;
            let mut chunk = encode_mux_frame(
                &MuxMessage::Result { number: 0 }.to_dictionary(),
                0,
                MuxPacketType::Plist,
                1,
            )
            .unwrap();
            chunk.extend_from_slice(b"early");
            peer.write_raw(&chunk).await;
            peer
        };
        let (mut peer, tunnel) = tokio::join!(server, tunnels.create_tunnel(3, 5000));
        let mut tunnel = tunnel.unwrap();

        peer.write_raw(b"late").await;
        let mut buf = [0u8; 9];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"earlylate");
    }
}
