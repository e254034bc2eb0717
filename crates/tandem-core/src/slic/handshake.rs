//! Slic version and parameter negotiation.

use std::time::Duration;

use bytes::Bytes;
use tandem_transport::Transport;
use tracing::{debug, warn};

use crate::config::SlicOptions;
use crate::error::{ConnectionError, FrameError, Result};
use crate::slic::frame::{FrameType, encode_header};
use crate::slic::params::{
    InitializeBody, Parameters, decode_initialize_ack, decode_versions, encode_initialize_ack,
    encode_versions,
};
use crate::slic::reader::FrameReader;

/// Local values offered during the handshake
#[derive(Debug, Clone, Copy)]
pub struct LocalParameters {
    /// Incoming bidirectional stream limit
    pub max_bidirectional_streams: u64,
    /// Incoming unidirectional stream limit
    pub max_unidirectional_streams: u64,
    /// Configured idle timeout
    pub idle_timeout: Duration,
    /// Largest stream frame payload we want
    pub packet_max_size: u64,
}

/// Outcome of a successful handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Slic version in use
    pub version: u64,
    /// Outgoing bidirectional streams we may keep open at once
    pub peer_max_bidirectional_streams: u64,
    /// Outgoing unidirectional streams we may keep open at once
    pub peer_max_unidirectional_streams: u64,
    /// Largest stream frame payload we may send
    pub peer_packet_max_size: u64,
    /// Idle timeout both sides apply
    pub idle_timeout: Duration,
}

async fn send_frame(transport: &dyn Transport, frame_type: FrameType, payload: &[u8]) -> Result<()> {
    let header = encode_header(frame_type, None, payload.len())?;
    transport.send(&[&header[..], payload]).await?;
    Ok(())
}

async fn read_frame(reader: &mut FrameReader) -> Result<(FrameType, Bytes)> {
    let header = reader
        .read_header()
        .await?
        .ok_or_else(|| ConnectionError::Handshake("peer closed the connection".into()))?;
    let payload = reader.read_payload(header.payload_len).await?;
    Ok((header.frame_type, payload))
}

fn local_parameters(local: &LocalParameters, idle_timeout: Option<Duration>) -> Parameters {
    Parameters {
        max_bidirectional_streams: Some(local.max_bidirectional_streams),
        max_unidirectional_streams: Some(local.max_unidirectional_streams),
        idle_timeout,
        packet_max_size: Some(local.packet_max_size),
    }
}

fn required(value: Option<u64>, name: &'static str) -> Result<u64> {
    match value {
        Some(0) => Err(ConnectionError::Handshake(format!("peer sent zero {name}").into()).into()),
        Some(v) => Ok(v),
        None => Err(ConnectionError::Handshake(format!("peer did not send {name}").into()).into()),
    }
}

fn negotiate(
    version: u64,
    peer: &Parameters,
    local: &LocalParameters,
    idle_timeout: Duration,
) -> Result<Negotiated> {
    Ok(Negotiated {
        version,
        peer_max_bidirectional_streams: required(
            peer.max_bidirectional_streams,
            "MaxBidirectionalStreams",
        )?,
        peer_max_unidirectional_streams: required(
            peer.max_unidirectional_streams,
            "MaxUnidirectionalStreams",
        )?,
        peer_packet_max_size: match peer.packet_max_size {
            Some(0) => {
                return Err(ConnectionError::Handshake("peer sent zero PacketMaxSize".into()).into());
            }
            Some(size) => size,
            None => local.packet_max_size,
        },
        idle_timeout,
    })
}

/// Run the connector side of the handshake.
///
/// # Errors
/// Returns `ConnectionError::Handshake` when no common version exists or the
/// peer's parameters are incomplete, and frame or transport errors as they
/// occur
pub async fn connect(
    transport: &dyn Transport,
    reader: &mut FrameReader,
    options: &SlicOptions,
    local: &LocalParameters,
) -> Result<Negotiated> {
    let mut version = *options
        .versions
        .first()
        .ok_or_else(|| ConnectionError::Handshake("no Slic version configured".into()))?;
    let mut body = InitializeBody {
        version,
        application_protocol: options.application_protocol.clone(),
        parameters: local_parameters(local, Some(local.idle_timeout)),
    };
    send_frame(transport, FrameType::Initialize, &body.encode()?).await?;

    let mut retried = false;
    loop {
        let (frame_type, payload) = read_frame(reader).await?;
        match frame_type {
            FrameType::InitializeAck => {
                let peer = decode_initialize_ack(&payload)?;
                // an acceptor omits the idle timeout when ours is already the lower one
                let idle_timeout = peer
                    .idle_timeout
                    .map_or(local.idle_timeout, |t| t.min(local.idle_timeout));
                if idle_timeout.is_zero() {
                    return Err(ConnectionError::Handshake("peer sent zero IdleTimeout".into()).into());
                }
                let negotiated = negotiate(version, &peer, local, idle_timeout)?;
                debug!(?negotiated, "slic handshake complete (connector)");
                return Ok(negotiated);
            }
            FrameType::Version if !retried => {
                let supported = decode_versions(&payload)?;
                let Some(common) = options
                    .versions
                    .iter()
                    .copied()
                    .find(|v| *v != version && supported.contains(v))
                else {
                    return Err(ConnectionError::Handshake(
                        format!("no common Slic version, peer supports {supported:?}").into(),
                    )
                    .into());
                };
                debug!(rejected = version, retry = common, "peer rejected slic version");
                version = common;
                body.version = version;
                send_frame(transport, FrameType::Initialize, &body.encode()?).await?;
                retried = true;
            }
            FrameType::Version => {
                return Err(ConnectionError::Handshake(
                    format!("peer rejected Slic version {version}").into(),
                )
                .into());
            }
            other => return Err(FrameError::UnexpectedFrame(other.name()).into()),
        }
    }
}

/// Run the acceptor side of the handshake.
///
/// # Errors
/// Returns `ConnectionError::Handshake` when the connector keeps using an
/// unsupported version or omits required parameters,
/// `ConnectionError::UnsupportedProtocol` for another application protocol,
/// and frame or transport errors as they occur
pub async fn accept(
    transport: &dyn Transport,
    reader: &mut FrameReader,
    options: &SlicOptions,
    local: &LocalParameters,
) -> Result<Negotiated> {
    let (frame_type, mut payload) = read_frame(reader).await?;
    if frame_type != FrameType::Initialize {
        return Err(FrameError::UnexpectedFrame(frame_type.name()).into());
    }

    let version = InitializeBody::peek_version(&payload)?;
    if !options.versions.contains(&version) {
        debug!(version, supported = ?options.versions, "unsupported slic version");
        send_frame(transport, FrameType::Version, &encode_versions(&options.versions)?).await?;
        let (frame_type, retry) = read_frame(reader).await?;
        if frame_type != FrameType::Initialize {
            return Err(FrameError::UnexpectedFrame(frame_type.name()).into());
        }
        let version = InitializeBody::peek_version(&retry)?;
        if !options.versions.contains(&version) {
            warn!(version, "connector retried with an unsupported slic version");
            return Err(ConnectionError::Handshake(
                format!("unsupported Slic version {version}").into(),
            )
            .into());
        }
        payload = retry;
    }

    let body = InitializeBody::decode(&payload)?;
    if body.application_protocol != options.application_protocol {
        return Err(ConnectionError::UnsupportedProtocol(body.application_protocol).into());
    }
    let peer_idle = body
        .parameters
        .idle_timeout
        .ok_or_else(|| ConnectionError::Handshake("peer did not send IdleTimeout".into()))?;
    if peer_idle.is_zero() {
        return Err(ConnectionError::Handshake("peer sent zero IdleTimeout".into()).into());
    }
    let idle_timeout = peer_idle.min(local.idle_timeout);
    let negotiated = negotiate(body.version, &body.parameters, local, idle_timeout)?;

    let advertised = (local.idle_timeout < peer_idle).then_some(local.idle_timeout);
    let ack = encode_initialize_ack(&local_parameters(local, advertised))?;
    send_frame(transport, FrameType::InitializeAck, &ack).await?;
    debug!(?negotiated, "slic handshake complete (acceptor)");
    Ok(negotiated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Arc;
    use tandem_transport::{DEFAULT_MEMORY_BUFFER, memory_pair};

    fn params(idle_secs: u64, max_bidi: u64) -> LocalParameters {
        LocalParameters {
            max_bidirectional_streams: max_bidi,
            max_unidirectional_streams: 10,
            idle_timeout: Duration::from_secs(idle_secs),
            packet_max_size: 4096,
        }
    }

    async fn run(
        client: SlicOptions,
        client_params: LocalParameters,
        server: SlicOptions,
        server_params: LocalParameters,
    ) -> (Result<Negotiated>, Result<Negotiated>) {
        let (a, b) = memory_pair(DEFAULT_MEMORY_BUFFER);
        let a: Arc<dyn Transport> = Arc::new(a);
        let b: Arc<dyn Transport> = Arc::new(b);
        let mut reader_a = FrameReader::new(a.clone(), 1 << 20);
        let mut reader_b = FrameReader::new(b.clone(), 1 << 20);
        let server_task = async {
            let result = accept(&*b, &mut reader_b, &server, &server_params).await;
            if result.is_err() {
                b.shutdown().await.unwrap();
            }
            result
        };
        let client_task = async {
            let result = connect(&*a, &mut reader_a, &client, &client_params).await;
            if result.is_err() {
                a.shutdown().await.unwrap();
            }
            result
        };
        tokio::join!(client_task, server_task)
    }

    #[tokio::test]
    async fn test_handshake_negotiates_minimum_idle_timeout() {
        let (client, server) = run(
            SlicOptions::default(),
            params(30, 5),
            SlicOptions::default(),
            params(10, 7),
        )
        .await;
        let client = client.unwrap();
        let server = server.unwrap();

        assert_eq!(client.idle_timeout, Duration::from_secs(10));
        assert_eq!(server.idle_timeout, Duration::from_secs(10));
        assert_eq!(client.peer_max_bidirectional_streams, 7);
        assert_eq!(server.peer_max_bidirectional_streams, 5);
        assert_eq!(client.version, 1);
    }

    #[tokio::test]
    async fn test_acceptor_omits_higher_idle_timeout() {
        // acceptor's 60s is above the connector's 10s: not advertised, connector keeps 10s
        let (client, server) = run(
            SlicOptions::default(),
            params(10, 5),
            SlicOptions::default(),
            params(60, 5),
        )
        .await;
        assert_eq!(client.unwrap().idle_timeout, Duration::from_secs(10));
        assert_eq!(server.unwrap().idle_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_version_mismatch_retries_with_common_version() {
        let client = SlicOptions {
            versions: vec![2, 1],
            ..Default::default()
        };
        let (client, server) =
            run(client, params(30, 5), SlicOptions::default(), params(30, 5)).await;
        assert_eq!(client.unwrap().version, 1);
        assert_eq!(server.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_no_common_version_fails() {
        let client = SlicOptions {
            versions: vec![2],
            ..Default::default()
        };
        let (client, server) =
            run(client, params(30, 5), SlicOptions::default(), params(30, 5)).await;
        assert!(matches!(
            client,
            Err(Error::Connection(ConnectionError::Handshake(_)))
        ));
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_application_protocol_mismatch() {
        let client = SlicOptions {
            application_protocol: "other".to_string(),
            ..Default::default()
        };
        let (client, server) =
            run(client, params(30, 5), SlicOptions::default(), params(30, 5)).await;
        assert!(matches!(
            server,
            Err(Error::Connection(ConnectionError::UnsupportedProtocol(ref name))) if name == "other"
        ));
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn test_missing_required_parameter() {
        let (a, b) = memory_pair(DEFAULT_MEMORY_BUFFER);
        let b: Arc<dyn Transport> = Arc::new(b);
        let mut reader = FrameReader::new(b.clone(), 1 << 20);

        let body = InitializeBody {
            version: 1,
            application_protocol: "ice2".to_string(),
            parameters: Parameters {
                max_unidirectional_streams: Some(1),
                idle_timeout: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        };
        send_frame(&a, FrameType::Initialize, &body.encode().unwrap())
            .await
            .unwrap();

        let err = accept(&*b, &mut reader, &SlicOptions::default(), &params(30, 5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("MaxBidirectionalStreams"));
    }

    #[tokio::test]
    async fn test_missing_idle_timeout_from_connector() {
        let (a, b) = memory_pair(DEFAULT_MEMORY_BUFFER);
        let b: Arc<dyn Transport> = Arc::new(b);
        let mut reader = FrameReader::new(b.clone(), 1 << 20);

        let body = InitializeBody {
            version: 1,
            application_protocol: "ice2".to_string(),
            parameters: Parameters {
                max_bidirectional_streams: Some(1),
                max_unidirectional_streams: Some(1),
                ..Default::default()
            },
        };
        send_frame(&a, FrameType::Initialize, &body.encode().unwrap())
            .await
            .unwrap();

        let err = accept(&*b, &mut reader, &SlicOptions::default(), &params(30, 5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("IdleTimeout"));
    }
}
