//! In-process mock broker for integration tests.
//!
//! Speaks just enough of the server side of the protocol: reads commands
//! (with their bodies), answers with response, error and message frames.

#![allow(dead_code)]

use bytes::{Buf, Bytes};
use nsq_client::protocol::{build_frame, frame_type, Message, MessageId};
use nsq_client::Endpoint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Listening mock broker.
pub struct MockBroker {
    listener: TcpListener,
    endpoint: Endpoint,
}

impl MockBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self {
            listener,
            endpoint: Endpoint::new("127.0.0.1", port),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Accept a client and answer its IDENTIFY with `identify_reply`.
    pub async fn accept(&self, identify_reply: &[u8]) -> BrokerSide {
        let (socket, _) = self.listener.accept().await.unwrap();
        let mut side = BrokerSide { socket };
        let mut magic = [0u8; 4];
        side.socket.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, b"  V2");
        let identify = side.read_command().await;
        assert_eq!(identify.line, "IDENTIFY");
        side.respond(identify_reply).await;
        side
    }

    /// Accept a subscriber: IDENTIFY then `SUB topic channel`.
    pub async fn accept_subscriber(&self, topic: &str, channel: &str) -> BrokerSide {
        let mut side = self.accept(br#"{"max_rdy_count":2500,"msg_timeout":60000}"#).await;
        let sub = side.read_command().await;
        assert_eq!(sub.line, format!("SUB {} {}", topic, channel));
        side.respond(b"OK").await;
        side
    }
}

/// A command received from the client.
#[derive(Debug)]
pub struct Received {
    pub line: String,
    pub bodies: Vec<Bytes>,
}

impl Received {
    pub fn name(&self) -> &str {
        self.line.split(' ').next().unwrap_or_default()
    }
}

/// Server end of one client connection.
pub struct BrokerSide {
    socket: TcpStream,
}

impl BrokerSide {
    async fn read_line(&mut self) -> String {
        let mut line = Vec::new();
        loop {
            let byte = self.socket.read_u8().await.unwrap();
            if byte == b'\n' {
                return String::from_utf8(line).unwrap();
            }
            line.push(byte);
        }
    }

    async fn read_sized(&mut self) -> Bytes {
        let len = self.socket.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        self.socket.read_exact(&mut body).await.unwrap();
        Bytes::from(body)
    }

    /// Read one command including any body.
    pub async fn read_command(&mut self) -> Received {
        let line = self.read_line().await;
        let name = line.split(' ').next().unwrap_or_default().to_string();
        let bodies = match name.as_str() {
            "IDENTIFY" | "AUTH" | "PUB" => vec![self.read_sized().await],
            "MPUB" => {
                let mut body = self.read_sized().await;
                let count = body.get_u32();
                (0..count)
                    .map(|_| {
                        let len = body.get_u32() as usize;
                        body.split_to(len)
                    })
                    .collect()
            }
            _ => Vec::new(),
        };
        Received { line, bodies }
    }

    /// Read commands until one named `name`, skipping readiness updates.
    pub async fn expect(&mut self, name: &str) -> Received {
        loop {
            let command = self.read_command().await;
            if command.name() == name {
                return command;
            }
            assert_eq!(command.name(), "RDY", "unexpected {:?} while waiting for {}", command, name);
        }
    }

    pub async fn respond(&mut self, text: &[u8]) {
        self.write(&build_frame(frame_type::RESPONSE, text)).await;
    }

    pub async fn error(&mut self, text: &[u8]) {
        self.write(&build_frame(frame_type::ERROR, text)).await;
    }

    pub async fn heartbeat(&mut self) {
        self.respond(b"_heartbeat_").await;
    }

    pub async fn deliver(&mut self, id: &[u8; 16], attempts: u16, body: &'static [u8]) {
        let message = Message {
            timestamp: 1_700_000_000_000_000_000,
            attempts,
            id: MessageId::new(*id),
            body: Bytes::from_static(body),
        };
        self.write(&build_frame(frame_type::MESSAGE, &message.encode())).await;
    }

    async fn write(&mut self, bytes: &[u8]) {
        self.socket.write_all(bytes).await.unwrap();
        self.socket.flush().await.unwrap();
    }
}

/// Message ids `msg-000000000000` style, 16 bytes.
pub fn message_id(n: u32) -> [u8; 16] {
    let text = format!("msg-{:012}", n);
    let mut id = [0u8; 16];
    id.copy_from_slice(text.as_bytes());
    id
}
