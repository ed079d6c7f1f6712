//! Network loop
//!
//! Opens connections, performs the CONNECT/CONNACK exchange, reads and
//! acknowledges inbound packets, keeps the connection alive and reconnects
//! with exponential backoff after transport loss.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    BrokerAddress, ConnectionState, Connector, InboundMessage, SessionConfig, SessionError,
    SessionEvent, SessionManager, Stream,
};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{Ack, Connect, DecodeError, Disconnect, Packet, QoS};
use crate::relay::MessageRelay;

/// QoS 2 messages received (PUBREC sent) but not yet released by the broker
type HeldMessages = HashMap<u16, InboundMessage>;

/// How a connection ended without a transport error
enum ConnectionEnd {
    /// Stop requested
    Stopped,
    /// Broker refused the CONNECT
    Refused,
}

/// Resolves once the stop flag is set. The `watch::Ref` from `wait_for` is
/// dropped here so it never lives inside a `select!`.
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// What the reader took off the wire
enum Inbound {
    Packet(Packet),
    /// A packet over the size limit was skipped
    Dropped {
        size: usize,
        /// Acknowledgement still owed for a QoS 1 or 2 PUBLISH
        ack: Option<Packet>,
    },
}

struct PacketReader {
    reader: ReadHalf<Box<dyn Stream>>,
    decoder: Decoder,
    buf: BytesMut,
    /// Bytes of an oversized packet still to be thrown away
    discard: usize,
}

impl PacketReader {
    /// Read the next complete packet. Cancel safe: buffered bytes and the
    /// discard count survive a dropped future.
    async fn next_packet(&mut self) -> Result<Inbound, SessionError> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(self.buf.len());
                self.buf.advance(n);
                self.discard -= n;
            }

            if self.discard == 0 {
                match self.decoder.decode(&self.buf) {
                    Ok(Some((packet, consumed))) => {
                        self.buf.advance(consumed);
                        return Ok(Inbound::Packet(packet));
                    }
                    Ok(None) => {}
                    Err(DecodeError::PacketTooLarge(size)) => {
                        let ack = self.decoder.oversized_publish_ack(&self.buf);
                        // QoS 1/2 PUBLISH: wait for the packet id before skipping
                        let owes_ack = self.buf[0] >> 4 == 3 && self.buf[0] & 0x06 != 0;
                        if ack.is_none() && owes_ack && self.buf.len() < size {
                            self.fill().await?;
                            continue;
                        }

                        warn!(
                            "Dropping {} byte packet (type {}) from broker: over the size limit",
                            size,
                            self.buf[0] >> 4
                        );
                        self.discard = size;
                        return Ok(Inbound::Dropped { size, ack });
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<(), SessionError> {
        self.buf.reserve(4096);
        if self.reader.read_buf(&mut self.buf).await? == 0 {
            return Err(SessionError::ConnectionLost(
                "connection closed by broker".to_string(),
            ));
        }
        Ok(())
    }
}

struct PacketWriter {
    writer: WriteHalf<Box<dyn Stream>>,
    encoder: Encoder,
    buf: BytesMut,
}

impl PacketWriter {
    async fn send(&mut self, packet: &Packet) -> Result<(), SessionError> {
        self.buf.clear();
        self.encoder.encode(packet, &mut self.buf)?;
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send DISCONNECT and close the write side
    async fn close(&mut self) {
        if let Err(e) = self.send(&Packet::Disconnect(Disconnect::default())).await {
            debug!("Failed to send DISCONNECT: {}", e);
            return;
        }
        info!("DISCONNECT sent to MQTT broker");
        let _ = self.writer.shutdown().await;
    }
}

impl SessionManager {
    /// Drive all broker I/O until [`disconnect`](Self::disconnect) is called.
    ///
    /// Inbound messages are handed to `relay` one at a time, in delivery
    /// order, on the calling task. A stop request is only observed between
    /// packets, so a relay call in progress always completes.
    pub async fn run_network_loop(&self, relay: &MessageRelay) -> Result<(), SessionError> {
        let (config, connector, address) = match (&self.config, &self.connector, &self.address) {
            (Some(config), Some(connector), Some(address)) => (config, connector.clone(), address),
            (None, _, _) | (_, None, _) => {
                return Err(SessionError::Configuration(
                    "configure must be called before run_network_loop".to_string(),
                ))
            }
            (_, _, None) => {
                return Err(SessionError::InvalidState(
                    "connect must be called before run_network_loop",
                ))
            }
        };

        let mut stop_rx = self.stop_tx.subscribe();
        let mut retry_interval = config.reconnect_interval;
        let mut held = HeldMessages::new();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            self.metrics.connection_attempt();
            let result = self
                .run_connection(
                    config,
                    connector.as_ref(),
                    address,
                    relay,
                    &mut held,
                    &mut stop_rx,
                )
                .await;

            match result {
                Ok(ConnectionEnd::Stopped) => break,
                Ok(ConnectionEnd::Refused) => {
                    // Not retried: stay disconnected until told to stop
                    stopped(&mut stop_rx).await;
                    break;
                }
                Err(e) => {
                    if self.state() == ConnectionState::Connected {
                        retry_interval = config.reconnect_interval;
                    }
                    self.handle_event(SessionEvent::ConnectionLost(e.to_string()), relay)
                        .await;

                    info!("Reconnecting in {:?}", retry_interval);
                    tokio::select! {
                        _ = tokio::time::sleep(retry_interval) => {}
                        _ = stopped(&mut stop_rx) => break,
                    }
                    retry_interval =
                        std::cmp::min(retry_interval.saturating_mul(2), config.max_reconnect_interval);
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("MQTT network loop stopped");
        Ok(())
    }

    /// Run one connection from TCP connect to stop or failure
    async fn run_connection(
        &self,
        config: &SessionConfig,
        connector: &dyn Connector,
        address: &BrokerAddress,
        relay: &MessageRelay,
        held: &mut HeldMessages,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionEnd, SessionError> {
        self.set_state(ConnectionState::Connecting);
        debug!("Opening connection to {}:{}", address.host, address.port);

        let stream = tokio::select! {
            result = timeout(config.connect_timeout, connector.connect(&address.host, address.port)) => {
                result.map_err(|_| SessionError::Timeout)??
            }
            _ = stopped(stop_rx) => return Ok(ConnectionEnd::Stopped),
        };

        let (reader, writer) = tokio::io::split(stream);
        let mut reader = PacketReader {
            reader,
            decoder: Decoder::new(config.protocol_version)
                .with_max_packet_size(config.max_packet_size),
            buf: BytesMut::with_capacity(4096),
            discard: 0,
        };
        let mut writer = PacketWriter {
            writer,
            encoder: Encoder::new(config.protocol_version),
            buf: BytesMut::with_capacity(256),
        };

        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: config.protocol_version,
            client_id: config.client_id.clone(),
            clean_start: config.clean_start,
            keep_alive: address.keepalive,
            username: config.username.clone(),
            password: config.password.as_ref().map(|p| Bytes::from(p.clone())),
            maximum_packet_size: u32::try_from(config.max_packet_size).ok(),
        }));
        writer.send(&connect).await?;
        debug!("CONNECT sent");

        let packet = tokio::select! {
            result = timeout(config.connect_timeout, reader.next_packet()) => {
                result.map_err(|_| SessionError::Timeout)??
            }
            _ = stopped(stop_rx) => {
                writer.close().await;
                return Ok(ConnectionEnd::Stopped);
            }
        };

        let connack = match packet {
            Inbound::Packet(Packet::ConnAck(connack)) => connack,
            Inbound::Packet(other) => {
                return Err(SessionError::Protocol(format!(
                    "expected CONNACK, got packet type {}",
                    other.packet_type()
                )))
            }
            Inbound::Dropped { .. } => {
                return Err(SessionError::Protocol(
                    "expected CONNACK, got an oversized packet".to_string(),
                ))
            }
        };

        if !connack.session_present && !held.is_empty() {
            debug!(
                "Broker kept no session, discarding {} unreleased QoS 2 messages",
                held.len()
            );
            held.clear();
        }

        let refused = !connack.reason_code.is_success();
        let subscribe = self
            .handle_event(SessionEvent::ConnectResult(connack.reason_code), relay)
            .await;
        if refused {
            return Ok(ConnectionEnd::Refused);
        }
        if let Some(subscribe) = subscribe {
            writer.send(&subscribe).await?;
        }

        let keep_alive = match connack.server_keep_alive {
            Some(granted) if granted != address.keepalive => {
                info!(
                    "Broker set keepalive to {}s (requested {}s)",
                    granted, address.keepalive
                );
                granted
            }
            _ => address.keepalive,
        };
        let keepalive_enabled = keep_alive > 0;
        let keepalive = Duration::from_secs(u64::from(keep_alive.max(1)));
        let idle_limit = keepalive + keepalive / 2;
        let mut ping_timer = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_received = Instant::now();

        loop {
            tokio::select! {
                result = reader.next_packet() => {
                    last_received = Instant::now();
                    let reply = match result? {
                        Inbound::Packet(packet) => self.on_packet(packet, relay, held).await?,
                        Inbound::Dropped { size, ack } => {
                            self.metrics.message_received(size);
                            self.metrics.message_failed();
                            ack
                        }
                    };
                    if let Some(reply) = reply {
                        writer.send(&reply).await?;
                    }
                }
                _ = ping_timer.tick(), if keepalive_enabled => {
                    writer.send(&Packet::PingReq).await?;
                    debug!("PINGREQ sent");
                }
                _ = tokio::time::sleep_until(last_received + idle_limit), if keepalive_enabled => {
                    return Err(SessionError::ConnectionLost(format!(
                        "nothing received from broker in {:?}",
                        idle_limit
                    )));
                }
                _ = stopped(stop_rx) => {
                    writer.close().await;
                    return Ok(ConnectionEnd::Stopped);
                }
            }
        }
    }

    /// Handle a packet on an open session, returning the reply to send
    async fn on_packet(
        &self,
        packet: Packet,
        relay: &MessageRelay,
        held: &mut HeldMessages,
    ) -> Result<Option<Packet>, SessionError> {
        match packet {
            Packet::Publish(publish) => match (publish.qos, publish.packet_id) {
                (QoS::AtMostOnce, _) => {
                    self.handle_event(SessionEvent::Message(publish.into()), relay)
                        .await;
                    Ok(None)
                }
                (QoS::AtLeastOnce, Some(packet_id)) => {
                    self.handle_event(SessionEvent::Message(publish.into()), relay)
                        .await;
                    Ok(Some(Packet::PubAck(Ack::new(packet_id))))
                }
                (QoS::ExactlyOnce, Some(packet_id)) => {
                    if held.contains_key(&packet_id) {
                        debug!("Duplicate QoS 2 PUBLISH for packet {}", packet_id);
                    } else {
                        held.insert(packet_id, publish.into());
                    }
                    Ok(Some(Packet::PubRec(Ack::new(packet_id))))
                }
                (_, None) => Err(SessionError::Protocol(
                    "PUBLISH with QoS > 0 has no packet identifier".to_string(),
                )),
            },
            Packet::PubRel(ack) => {
                match held.remove(&ack.packet_id) {
                    Some(message) => {
                        self.handle_event(SessionEvent::Message(message), relay)
                            .await;
                    }
                    None => debug!("PUBREL for unknown packet {}", ack.packet_id),
                }
                Ok(Some(Packet::PubComp(Ack::new(ack.packet_id))))
            }
            Packet::SubAck(suback) => {
                self.handle_event(SessionEvent::SubscribeResult(suback.reason_codes), relay)
                    .await;
                Ok(None)
            }
            Packet::PingResp => {
                debug!("PINGRESP received");
                Ok(None)
            }
            Packet::Disconnect(disconnect) => Err(SessionError::ConnectionLost(format!(
                "broker sent DISCONNECT: {}",
                disconnect.reason_code
            ))),
            Packet::ConnAck(_) => Err(SessionError::Protocol(
                "unexpected CONNACK on an open session".to_string(),
            )),
            other => {
                debug!("Ignoring packet type {}", other.packet_type());
                Ok(None)
            }
        }
    }
}
