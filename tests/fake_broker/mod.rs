//! Minimal in-process MQTT 3.1.1 broker for session tests
//!
//! Accepts any CONNECT, answers PINGREQ, and acknowledges QoS 1 publishes
//! according to its [`AckMode`]. Held PUBACKs are sent on
//! [`FakeBroker::release_acks`].

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// PUBACK as soon as the publish arrives
    Immediate,
    /// Keep PUBACKs until `release_acks`
    Hold,
    /// Never acknowledge
    Never,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Release,
    Drop,
}

#[derive(Debug)]
struct Packet {
    header: u8,
    body: Vec<u8>,
}

#[derive(Clone)]
struct Shared {
    mode: Arc<Mutex<AckMode>>,
    published: Arc<Mutex<Vec<Vec<u8>>>>,
    connections: Arc<Mutex<usize>>,
}

pub struct FakeBroker {
    port: u16,
    shared: Shared,
    commands: broadcast::Sender<Command>,
}

impl FakeBroker {
    pub async fn start(mode: AckMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Shared {
            mode: Arc::new(Mutex::new(mode)),
            published: Arc::default(),
            connections: Arc::default(),
        };
        let (commands, _) = broadcast::channel(16);

        let accept_shared = shared.clone();
        let accept_commands = commands.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                *accept_shared.connections.lock().unwrap() += 1;
                tokio::spawn(serve(
                    stream,
                    accept_shared.clone(),
                    accept_commands.subscribe(),
                ));
            }
        });

        Self {
            port,
            shared,
            commands,
        }
    }

    pub fn url(&self) -> String {
        format!("mqtt://127.0.0.1:{}", self.port)
    }

    /// Acknowledge everything held so far and every later publish
    pub fn release_acks(&self) {
        *self.shared.mode.lock().unwrap() = AckMode::Immediate;
        let _ = self.commands.send(Command::Release);
    }

    /// Close every open client socket without a DISCONNECT
    pub fn drop_connections(&self) {
        let _ = self.commands.send(Command::Drop);
    }

    pub fn published(&self) -> Vec<Vec<u8>> {
        self.shared.published.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        *self.shared.connections.lock().unwrap()
    }

    /// Wait until the broker has received `count` publishes
    pub async fn wait_for_publishes(&self, count: usize, limit: Duration) {
        tokio::time::timeout(limit, async {
            while self.published().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "broker saw {} publishes, expected {count}",
                self.published().len()
            )
        });
    }
}

async fn read_packet(reader: &mut OwnedReadHalf) -> std::io::Result<Packet> {
    let header = reader.read_u8().await?;

    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await?;
        remaining |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0; remaining];
    reader.read_exact(&mut body).await?;
    Ok(Packet { header, body })
}

async fn puback(writer: &mut OwnedWriteHalf, pkid: u16) -> std::io::Result<()> {
    let [hi, lo] = pkid.to_be_bytes();
    writer.write_all(&[0x40, 0x02, hi, lo]).await
}

async fn serve(stream: TcpStream, shared: Shared, mut commands: broadcast::Receiver<Command>) {
    let (mut reader, mut writer) = stream.into_split();

    // Reading in its own task keeps partially read packets out of `select!`
    let (packet_tx, mut packets) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(async move {
        while let Ok(packet) = read_packet(&mut reader).await {
            if packet_tx.send(packet).is_err() {
                break;
            }
        }
    });

    let mut held = Vec::new();
    loop {
        tokio::select! {
            packet = packets.recv() => {
                let Some(packet) = packet else { break };
                let written = match packet.header >> 4 {
                    CONNECT => writer.write_all(&[0x20, 0x02, 0x00, 0x00]).await,
                    PUBLISH => {
                        let qos = (packet.header >> 1) & 0x03;
                        let body = &packet.body;
                        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                        let mut offset = 2 + topic_len;
                        let pkid = if qos > 0 {
                            offset += 2;
                            u16::from_be_bytes([body[offset - 2], body[offset - 1]])
                        } else {
                            0
                        };
                        shared.published.lock().unwrap().push(body[offset..].to_vec());

                        let mode = *shared.mode.lock().unwrap();
                        match (qos, mode) {
                            (1, AckMode::Immediate) => puback(&mut writer, pkid).await,
                            (1, AckMode::Hold) => {
                                held.push(pkid);
                                Ok(())
                            }
                            _ => Ok(()),
                        }
                    }
                    PINGREQ => writer.write_all(&[0xD0, 0x00]).await,
                    DISCONNECT => break,
                    _ => Ok(()),
                };
                if written.is_err() {
                    break;
                }
            }
            command = commands.recv() => match command {
                Ok(Command::Release) => {
                    for pkid in std::mem::take(&mut held) {
                        if puback(&mut writer, pkid).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Command::Drop) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }

    reader_task.abort();
}
