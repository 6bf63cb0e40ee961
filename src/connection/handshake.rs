//! Connection handshake: version marker, IDENTIFY, transport upgrades,
//! AUTH and SUB.
//!
//! The handshake runs on the unsplit transport and reads frames one at a
//! time with [`read_frame`], so nothing after a reply is consumed before the
//! next layer is installed.

use tokio::io::AsyncWriteExt;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::ConnectionId;
use crate::codec::{DeflateCodec, SnappyCodec};
use crate::config::{ConnectionConfig, Endpoint};
use crate::control::{build_identify_body, plan_upgrades, AuthReply, EndpointSettings, Upgrade};
use crate::error::{NsqError, Result};
use crate::protocol::{read_frame, Command, Frame, MAGIC_V2};
use crate::transport::{build_tls_connector, Transport};

/// Run the handshake over a freshly connected transport.
///
/// Returns the transport with every negotiated layer installed, plus the
/// settings the server granted.
pub(super) async fn negotiate(
    mut transport: Transport,
    id: &ConnectionId,
    config: &ConnectionConfig,
    subscribe: bool,
) -> Result<(Transport, EndpointSettings)> {
    let stream = transport.stream_mut();
    stream.write_all(MAGIC_V2).await?;

    let identify = Command::Identify(build_identify_body(&config.identify, &config.features)?);
    let reply = request(&mut transport, &identify, config).await?;
    let settings = EndpointSettings::from_response(&reply)?;
    debug!(
        version = ?settings.version,
        max_rdy_count = ?settings.max_rdy_count,
        msg_timeout = ?settings.msg_timeout,
        "identify accepted"
    );

    for upgrade in plan_upgrades(&config.features, &settings)? {
        transport = install(transport, upgrade, id.endpoint(), config).await?;
        let reply = read_reply(&mut transport, upgrade_name(upgrade), config).await?;
        if !reply.is_ok() {
            return Err(NsqError::FeatureFailure(format!(
                "{} upgrade answered with {:?}",
                upgrade_name(upgrade),
                reply.text().unwrap_or_default()
            )));
        }
        debug!(upgrade = upgrade_name(upgrade), "transport upgraded");
    }

    if settings.auth_required {
        let secret = config.auth_secret.as_ref().ok_or_else(|| {
            NsqError::FeatureFailure("server requires AUTH but no secret is configured".to_string())
        })?;
        let auth = Command::Auth(secret.clone().into_bytes().into());
        let reply = request(&mut transport, &auth, config).await?;
        let identity = AuthReply::from_response(reply.payload().map(|p| &p[..]).unwrap_or_default())?;
        info!(
            identity = ?identity.identity,
            permissions = ?identity.permission_count,
            "authenticated"
        );
    }

    if subscribe {
        let sub = Command::Sub {
            topic: id.topic().to_string(),
            channel: id.channel().to_string(),
        };
        request(&mut transport, &sub, config).await?;
        debug!(topic = id.topic(), channel = id.channel(), "subscribed");
    }

    Ok((transport, settings))
}

async fn install(
    transport: Transport,
    upgrade: Upgrade,
    endpoint: &Endpoint,
    config: &ConnectionConfig,
) -> Result<Transport> {
    match upgrade {
        Upgrade::Tls => {
            let options = config.features.tls.as_ref().ok_or_else(|| {
                NsqError::Configuration("TLS granted without TLS options".to_string())
            })?;
            let connector = build_tls_connector(options)?;
            let server_name = options.server_name.as_deref().unwrap_or(&endpoint.host);
            let deadline = Instant::now() + config.connect_timeout;
            timeout_at(deadline, transport.upgrade_tls(&connector, server_name))
                .await
                .map_err(|_| {
                    warn!(server_name, timeout = ?config.connect_timeout, "tls handshake timed out");
                    NsqError::NoResponse("tls")
                })?
        }
        Upgrade::Deflate { level } => transport.install_codec(DeflateCodec::new(level)),
        Upgrade::Snappy => transport.install_codec(SnappyCodec::new()),
    }
}

fn upgrade_name(upgrade: Upgrade) -> &'static str {
    match upgrade {
        Upgrade::Tls => "tls",
        Upgrade::Deflate { .. } => "deflate",
        Upgrade::Snappy => "snappy",
    }
}

/// Write `command` and read its reply, checking it against the command's
/// declared responses.
async fn request(
    transport: &mut Transport,
    command: &Command,
    config: &ConnectionConfig,
) -> Result<Frame> {
    let stream = transport.stream_mut();
    stream
        .write_all(&command.encode())
        .await
        .map_err(NsqError::from_transport)?;
    stream.flush().await.map_err(NsqError::from_transport)?;

    let reply = read_reply(transport, command.name(), config).await?;
    command.check_response(&reply)?;
    Ok(reply)
}

/// Read the next reply frame, answering heartbeats on the way.
async fn read_reply(
    transport: &mut Transport,
    awaiting: &'static str,
    config: &ConnectionConfig,
) -> Result<Frame> {
    let deadline = Instant::now() + config.response_wait;
    loop {
        let frame = timeout_at(
            deadline,
            read_frame(transport.stream_mut(), config.max_frame_size),
        )
        .await
        .map_err(|_| NsqError::NoResponse(awaiting))??;

        if frame.is_heartbeat() {
            let stream = transport.stream_mut();
            stream
                .write_all(&Command::Nop.encode())
                .await
                .map_err(NsqError::from_transport)?;
            stream.flush().await.map_err(NsqError::from_transport)?;
            continue;
        }
        if let Frame::Message(message) = &frame {
            warn!(id = %message.id, awaiting, "message frame during handshake, dropping");
            continue;
        }
        return Ok(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionMode, FeatureOptions, TlsOptions};
    use crate::protocol::{build_frame, frame_type, HEARTBEAT};
    use crate::transport::Layer;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn id() -> ConnectionId {
        ConnectionId::new(Endpoint::new("127.0.0.1", 4150), "events", "archive")
    }

    async fn expect_bytes(server: &mut DuplexStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    async fn read_identify(server: &mut DuplexStream) -> serde_json::Value {
        expect_bytes(server, b"  V2IDENTIFY\n").await;
        let len = server.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        server.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn respond(server: &mut DuplexStream, text: &[u8]) {
        server
            .write_all(&build_frame(frame_type::RESPONSE, text))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_plain_handshake_with_subscribe() {
        let (client, mut server) = duplex(64 * 1024);
        let broker = tokio::spawn(async move {
            let identify = read_identify(&mut server).await;
            assert_eq!(identify["feature_negotiation"], true);
            respond(&mut server, br#"{"max_rdy_count":2500,"msg_timeout":60000}"#).await;
            respond(&mut server, HEARTBEAT).await;
            expect_bytes(&mut server, b"SUB events archive\n").await;
            expect_bytes(&mut server, b"NOP\n").await;
            respond(&mut server, b"OK").await;
            server
        });

        let (_transport, settings) =
            negotiate(Transport::new(client), &id(), &ConnectionConfig::default(), true)
                .await
                .unwrap();
        assert_eq!(settings.max_rdy_count, Some(2500));
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_snappy_upgrade_reads_ok_through_layer() {
        let (client, mut server) = duplex(64 * 1024);
        let broker = tokio::spawn(async move {
            let identify = read_identify(&mut server).await;
            assert_eq!(identify["snappy"], true);
            respond(&mut server, br#"{"snappy":true}"#).await;

            let mut server = Transport::new(server).install_codec(SnappyCodec::new()).unwrap();
            let ok = build_frame(frame_type::RESPONSE, b"OK");
            let stream = server.stream_mut();
            stream.write_all(&ok).await.unwrap();
            stream.flush().await.unwrap();

            let mut line = [0u8; 19];
            stream.read_exact(&mut line).await.unwrap();
            assert_eq!(&line, b"SUB events archive\n");
            stream.write_all(&ok).await.unwrap();
            stream.flush().await.unwrap();
            server
        });

        let config = ConnectionConfig {
            features: FeatureOptions {
                compression: Some(CompressionMode::Snappy),
                enforce: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (transport, settings) = negotiate(Transport::new(client), &id(), &config, true)
            .await
            .unwrap();
        assert!(settings.snappy);
        assert!(transport.is_compressed());
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_deflate_upgrade_reads_ok_through_layer() {
        let (client, mut server) = duplex(64 * 1024);
        let broker = tokio::spawn(async move {
            let identify = read_identify(&mut server).await;
            assert_eq!(identify["deflate"], true);
            assert_eq!(identify["deflate_level"], 3);
            respond(&mut server, br#"{"deflate":true,"deflate_level":3}"#).await;

            let mut server = Transport::new(server).install_codec(DeflateCodec::new(3)).unwrap();
            let ok = build_frame(frame_type::RESPONSE, b"OK");
            let stream = server.stream_mut();
            stream.write_all(&ok).await.unwrap();
            stream.flush().await.unwrap();

            let mut line = [0u8; 19];
            stream.read_exact(&mut line).await.unwrap();
            assert_eq!(&line, b"SUB events archive\n");
            stream.write_all(&ok).await.unwrap();
            stream.flush().await.unwrap();
            server
        });

        let config = ConnectionConfig {
            features: FeatureOptions {
                compression: Some(CompressionMode::Deflate { level: 3 }),
                enforce: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (transport, settings) = negotiate(Transport::new(client), &id(), &config, true)
            .await
            .unwrap();
        assert!(settings.deflate);
        assert_eq!(transport.layers(), &[Layer::Compression("deflate")]);
        broker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_tls_upgrade_times_out() {
        let (client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            read_identify(&mut server).await;
            respond(&mut server, br#"{"tls_v1":true}"#).await;
            // Hold the socket open without answering the ClientHello.
            std::future::pending::<()>().await;
            drop(server);
        });

        let config = ConnectionConfig {
            features: FeatureOptions {
                tls: Some(TlsOptions::default()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = negotiate(Transport::new(client), &id(), &config, false)
            .await
            .unwrap_err();
        assert!(matches!(err, NsqError::NoResponse("tls")), "{err:?}");
    }

    #[tokio::test]
    async fn test_auth_required_without_secret() {
        let (client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            read_identify(&mut server).await;
            respond(&mut server, br#"{"auth_required":true}"#).await;
            server
        });

        let err = negotiate(Transport::new(client), &id(), &ConnectionConfig::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, NsqError::FeatureFailure(_)));
    }

    #[tokio::test]
    async fn test_sub_error_is_bad_response() {
        let (client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            read_identify(&mut server).await;
            respond(&mut server, b"OK").await;
            expect_bytes(&mut server, b"SUB events archive\n").await;
            server
                .write_all(&build_frame(frame_type::ERROR, b"E_BAD_TOPIC invalid"))
                .await
                .unwrap();
            server
        });

        let err = negotiate(Transport::new(client), &id(), &ConnectionConfig::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, NsqError::BadResponse { command: "SUB", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (client, _server) = duplex(64 * 1024);
        let err = negotiate(Transport::new(client), &id(), &ConnectionConfig::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, NsqError::NoResponse("IDENTIFY")));
    }
}
