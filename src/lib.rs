use anyhow::Context;
use bytes::BufMut;
use kafka_protocol::{
    error::ResponseError,
    messages::{self, ApiKey},
    protocol::{Decodable, Encodable},
};
use tracing::instrument;

mod topology;

mod error_stack;

mod cluster;
pub use cluster::{ControlError, MockCluster, MockClusterConfig};

mod session;
pub use session::Session;

pub mod logging;

/// The protocol handler table: every supported ApiKey with the version
/// range this cluster advertises and accepts. Requests for decodable
/// versions outside the advertised range are answered with
/// `UNSUPPORTED_VERSION` on every logical unit of the response.
pub const SUPPORTED_APIS: &[(ApiKey, i16, i16)] = &[
    (ApiKey::ProduceKey, 3, 9),
    (ApiKey::FetchKey, 4, 12),
    (ApiKey::ListOffsetsKey, 1, 7),
    (ApiKey::MetadataKey, 0, 9),
    (ApiKey::OffsetCommitKey, 2, 8),
    (ApiKey::OffsetFetchKey, 1, 7),
    (ApiKey::FindCoordinatorKey, 0, 4),
    (ApiKey::ApiVersionsKey, 0, 3),
];

fn version_range(api_key: ApiKey) -> Option<(i16, i16)> {
    SUPPORTED_APIS
        .iter()
        .find(|(key, ..)| *key == api_key)
        .map(|&(_, min, max)| (min, max))
}

/// Dispatch one request `frame` of the current session, writing the framed
/// response into `out`. An error return closes the connection (malformed
/// header or body). A decodable request for an ApiKey with no handler is
/// answered with `unsupported_version`.
#[tracing::instrument(level = "trace", err(level = "debug"), skip_all)]
pub async fn dispatch_request_frame(
    session: &mut Session,
    frame: bytes::BytesMut,
    out: &mut bytes::BytesMut,
) -> anyhow::Result<()> {
    anyhow::ensure!(frame.len() >= 4, "truncated request header");

    let api_key = i16::from_be_bytes(frame[0..2].try_into().context("parsing api key")?);
    let api_key = ApiKey::try_from(api_key)
        .map_err(|_| anyhow::anyhow!("invalid request API key: {api_key}"))?;
    let version = i16::from_be_bytes(frame[2..4].try_into().context("parsing request version")?);

    handle_api(api_key, version, session, frame, out).await
}

#[instrument(level = "debug", skip_all, fields(?api_key, v = version))]
async fn handle_api(
    api_key: ApiKey,
    version: i16,
    session: &mut Session,
    frame: bytes::BytesMut,
    out: &mut bytes::BytesMut,
) -> anyhow::Result<()> {
    let Some((min_version, max_version)) = version_range(api_key) else {
        return enc_unsupported(out, api_key, version, frame);
    };

    // Version gating happens before the error stack is consulted, so an
    // out-of-range probe does not consume an injected error. Injected
    // errors take precedence over whatever the handler would really do.
    let fault = if version < min_version || version > max_version {
        Some(ResponseError::UnsupportedVersion.code())
    } else {
        session.next_request_error(api_key as i16)
    };

    metrics::counter!("kafka_mock_requests", "api_key" => format!("{api_key:?}")).increment(1);

    match api_key {
        ApiKey::ApiVersionsKey => {
            let (header, request) = dec_request(frame, version)?;
            Ok(enc_resp(
                out,
                &header,
                session.api_versions(request, fault).await?,
            ))
        }
        ApiKey::MetadataKey => {
            let (header, request) = dec_request(frame, version)?;
            Ok(enc_resp(out, &header, session.metadata(request, fault).await?))
        }
        ApiKey::ProduceKey => {
            let (header, request) = dec_request::<messages::ProduceRequest>(frame, version)?;
            let acks = request.acks;
            let response = session.produce(request, fault).await?;
            // acks=0 means the client expects no response at all.
            if acks != 0 {
                enc_resp(out, &header, response);
            }
            Ok(())
        }
        ApiKey::FetchKey => {
            let (header, request) = dec_request(frame, version)?;
            Ok(enc_resp(
                out,
                &header,
                session.fetch(request, version, fault).await?,
            ))
        }
        ApiKey::ListOffsetsKey => {
            let (header, request) = dec_request(frame, version)?;
            Ok(enc_resp(
                out,
                &header,
                session.list_offsets(request, fault).await?,
            ))
        }
        ApiKey::OffsetCommitKey => {
            let (header, request) = dec_request(frame, version)?;
            Ok(enc_resp(
                out,
                &header,
                session.offset_commit(request, fault).await?,
            ))
        }
        ApiKey::OffsetFetchKey => {
            let (header, request) = dec_request(frame, version)?;
            Ok(enc_resp(
                out,
                &header,
                session.offset_fetch(request, fault).await?,
            ))
        }
        ApiKey::FindCoordinatorKey => {
            let (header, request) = dec_request(frame, version)?;
            Ok(enc_resp(
                out,
                &header,
                session.find_coordinator(request, version, fault).await?,
            ))
        }
        _ => enc_unsupported(out, api_key, version, frame),
    }
}

// A decodable request for an ApiKey with no handler still gets a correlated
// answer: the response header followed by a bare `unsupported_version`
// error code. Only a header that fails to decode closes the connection.
fn enc_unsupported(
    b: &mut bytes::BytesMut,
    api_key: ApiKey,
    version: i16,
    mut frame: bytes::BytesMut,
) -> anyhow::Result<()> {
    let header =
        messages::RequestHeader::decode(&mut frame, api_key.request_header_version(version))
            .context("parsing request header")?;
    tracing::debug!(
        correlation_id = header.correlation_id,
        "answering request type {api_key:?} with unsupported_version"
    );

    b.put_i32(0); // Length header placeholder.
    let offset = b.len();

    let mut wh = messages::ResponseHeader::default();
    wh.correlation_id = header.correlation_id;
    wh.encode(b, api_key.response_header_version(version))
        .expect("encoding ResponseHeader does not fail");
    b.put_i16(ResponseError::UnsupportedVersion.code());

    let len = (b.len() - offset) as u32;
    b[(offset - 4)..offset].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

// Easier dispatch to type-specific decoder by using result-type inference.
fn dec_request<T: kafka_protocol::protocol::Request + std::fmt::Debug>(
    mut frame: bytes::BytesMut,
    req_version: i16,
) -> anyhow::Result<(messages::RequestHeader, T)> {
    let header_version = T::header_version(req_version);
    let header = messages::RequestHeader::decode(&mut frame, header_version)?;

    let request = T::decode(&mut frame, header.request_api_version).with_context(|| {
        format!(
            "failed to decode {} with header version {header_version}: {header:?}",
            std::any::type_name::<T>()
        )
    })?;

    if !frame.is_empty() {
        anyhow::bail!(
            "frame has {} bytes remaining after decoding {}",
            frame.len(),
            std::any::type_name::<T>()
        );
    }
    tracing::trace!(?request, ?header, "decoded request");

    Ok((header, request))
}

// Encodes a complete frame for the given request header and response payload.
fn enc_resp<
    T: kafka_protocol::protocol::Encodable + kafka_protocol::protocol::HeaderVersion + std::fmt::Debug,
>(
    b: &mut bytes::BytesMut,
    rh: &messages::RequestHeader,
    response: T,
) {
    b.put_i32(0); // Length header placeholder.
    let offset = b.len();

    let mut wh = messages::ResponseHeader::default();
    wh.correlation_id = rh.correlation_id;
    wh.encode(b, T::header_version(rh.request_api_version))
        .expect("encoding ResponseHeader does not fail");
    response
        .encode(b, rh.request_api_version)
        .expect("encoding response payload does not fail");

    // Go back and write the length header.
    let len = (b.len() - offset) as u32;
    b[(offset - 4)..offset].copy_from_slice(&len.to_be_bytes());
}
