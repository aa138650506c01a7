//! An in-process stand-in for usbmuxd used by the tests
// Jackson Coxson

use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};

use crate::{
    ClientOptions, DeviceRecord, UsbmuxAddr,
    codec::{
        MuxHeader, MuxMessage, MuxPacketType, encode_lockdown_frame, encode_mux_frame,
        read_lockdown_dictionary, read_mux_dictionary,
    },
    reader::ExactReader,
};

pub(crate) struct MockMuxd {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockMuxd {
    pub(crate) async fn bind() -> Self {
        Self::bind_to("127.0.0.1:0".parse().unwrap()).await
    }

    pub(crate) async fn bind_to(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    pub(crate) fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn options(&self) -> ClientOptions {
        options_for(self.addr)
    }

    pub(crate) async fn accept(&self) -> MockPeer {
        let (socket, _) = self.listener.accept().await.unwrap();
        MockPeer {
            reader: ExactReader::new(socket),
        }
    }

    /// Accepts a connection and answers its Listen request with success
    pub(crate) async fn accept_listener(&self) -> MockPeer {
        let mut peer = self.accept().await;
        let (_, request) = peer.read_request().await;
        assert_eq!(
            request.get("MessageType").and_then(|x| x.as_string()),
            Some("Listen")
        );
        peer.send_result(0).await;
        peer
    }

    /// Accepts a connection and answers its Connect request with `number`
    pub(crate) async fn accept_tunnel(&self, number: u64) -> (MockPeer, plist::Dictionary) {
        let mut peer = self.accept().await;
        let (_, request) = peer.read_request().await;
        assert_eq!(
            request.get("MessageType").and_then(|x| x.as_string()),
            Some("Connect")
        );
        peer.send_result(number).await;
        (peer, request)
    }
}

pub(crate) fn options_for(addr: SocketAddr) -> ClientOptions {
    ClientOptions::default()
        .with_addr(UsbmuxAddr::TcpSocket(addr))
        .with_settle_delay(Duration::from_millis(5))
}

pub(crate) struct MockPeer {
    reader: ExactReader<TcpStream>,
}

impl MockPeer {
    pub(crate) async fn read_request(&mut self) -> (MuxHeader, plist::Dictionary) {
        read_mux_dictionary(&mut self.reader, 1 << 20)
            .await
            .unwrap()
            .expect("client hung up")
    }

    pub(crate) async fn send(&mut self, message: &MuxMessage) {
        let frame = encode_mux_frame(&message.to_dictionary(), 0, MuxPacketType::Plist, 1).unwrap();
        self.write_raw(&frame).await;
    }

    pub(crate) async fn send_result(&mut self, number: u64) {
        self.send(&MuxMessage::Result { number }).await;
    }

    pub(crate) async fn read_lockdown(&mut self) -> plist::Dictionary {
        read_lockdown_dictionary(&mut self.reader, 1 << 20)
            .await
            .unwrap()
            .expect("client hung up")
    }

    pub(crate) async fn send_lockdown(&mut self, dict: &plist::Dictionary) {
        let frame = encode_lockdown_frame(dict).unwrap();
        self.write_raw(&frame).await;
    }

    pub(crate) async fn read_raw(&mut self, len: usize) -> Option<Vec<u8>> {
        self.reader
            .read_exact(len)
            .await
            .ok()
            .flatten()
            .map(|b| b.to_vec())
    }

    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) {
        let socket = self.reader.get_mut();
        socket.write_all(bytes).await.unwrap();
        socket.flush().await.unwrap();
    }
}

pub(crate) fn usb_device(device_id: u32) -> DeviceRecord {
    let mut properties = plist::Dictionary::new();
    properties.insert("ConnectionType".into(), "USB".into());
    properties.insert("DeviceID".into(), device_id.into());
    properties.insert("LocationID".into(), 0u32.into());
    properties.insert("ProductID".into(), 4776u32.into());
    properties.insert(
        "SerialNumber".into(),
        format!("{device_id:040x}").into(),
    );
    DeviceRecord::new(device_id, properties)
}
