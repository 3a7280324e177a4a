use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use tracing::{debug, error};

use crate::config::OriginConfig;
use crate::error::{GatewayError, Result as GatewayResult};

/// Header carrying the SHA-256 digest of the forwarded payload, required by
/// origins that validate payload signatures.
pub const CONTENT_SHA256_HEADER: &str = "x-content-sha256";

/// Sidecar header for the relocated authorization value. The wrapping
/// runtime at some origins overwrites `authorization` with its own value;
/// moving the original aside is a header-collision workaround, not a
/// security boundary.
pub const RELOCATED_AUTHORIZATION_HEADER: &str = "x-original-authorization";

/// Marker set by an edge transport that base64-encodes request bodies.
/// Consumed here; decoding happens exactly once.
pub const EDGE_BODY_ENCODING_HEADER: &str = "x-edge-body-encoding";

/// Translates a gateway-side request into a backend-specific call.
pub struct OriginAdapter {
    client: reqwest::Client,
}

/// Hex SHA-256 over the exact bytes that will be forwarded.
pub fn payload_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Undo the edge transport's body encoding, at most once.
///
/// Returns the raw payload bytes; signature validation at the origin fails
/// unless the digest is computed over exactly these bytes.
pub fn decode_edge_body(headers: &HeaderMap, body: Bytes) -> GatewayResult<Bytes> {
    let encoded = headers
        .get(EDGE_BODY_ENCODING_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("base64"));
    if !encoded {
        return Ok(body);
    }
    let decoded = BASE64
        .decode(body.as_ref())
        .map_err(|e| GatewayError::BadRequest(format!("Invalid base64 request body: {}", e)))?;
    Ok(Bytes::from(decoded))
}

/// Build the header set forwarded upstream.
///
/// Hop-by-hop headers are dropped, tracing headers added, and for origins
/// that need them the payload digest and the relocated authorization value
/// are injected. The edge encoding marker is consumed here.
pub fn prepare_upstream_headers(
    incoming: &HeaderMap,
    origin: &OriginConfig,
    body: &[u8],
    client_ip: IpAddr,
    request_id: &str,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming.iter() {
        if is_hop_by_hop_header(name) || name.as_str() == EDGE_BODY_ENCODING_HEADER {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    if let OriginConfig::Serverless {
        sign_payloads,
        relocate_authorization,
        ..
    } = origin
    {
        if *sign_payloads {
            let digest = payload_digest(body);
            if let Ok(value) = HeaderValue::from_str(&digest) {
                headers.insert(HeaderName::from_static(CONTENT_SHA256_HEADER), value);
            }
        }
        if *relocate_authorization {
            if let Some(original) = headers.remove("authorization") {
                headers.insert(
                    HeaderName::from_static(RELOCATED_AUTHORIZATION_HEADER),
                    original,
                );
            }
        }
    }

    if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }

    headers
}

impl OriginAdapter {
    pub fn new() -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(10))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .user_agent("edge-gateway/1.0")
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Normalize a selected member into a callable base endpoint.
    pub fn endpoint(origin: &OriginConfig, member_url: &str) -> String {
        match origin {
            OriginConfig::Container { port, .. } => {
                if member_url.contains("://") {
                    member_url.trim_end_matches('/').to_string()
                } else {
                    format!("http://{}:{}", member_url, port)
                }
            }
            OriginConfig::Serverless { url, .. } => url.trim_end_matches('/').to_string(),
            OriginConfig::Static { url } => url.trim_end_matches('/').to_string(),
        }
    }

    /// Forward the request, preserving method, headers, and body, and return
    /// the backend's response unmodified apart from the adapter rewrites.
    #[allow(clippy::too_many_arguments)]
    pub async fn forward(
        &self,
        origin: &OriginConfig,
        member_url: &str,
        method: &Method,
        incoming_headers: &HeaderMap,
        forward_path: &str,
        query: Option<&str>,
        body: Bytes,
        client_ip: IpAddr,
        request_id: &str,
    ) -> GatewayResult<Response> {
        let base = Self::endpoint(origin, member_url);
        let target_url = match query {
            Some(q) => format!("{}{}?{}", base, forward_path, q),
            None => format!("{}{}", base, forward_path),
        };

        // Decode before hashing; both operate on the same raw bytes.
        let payload = decode_edge_body(incoming_headers, body)?;
        let headers =
            prepare_upstream_headers(incoming_headers, origin, &payload, client_ip, request_id);

        // Read-only: log sizes and targets, never a reconstructed payload.
        debug!(
            "Forwarding request {} ({} {} -> {}, {} bytes)",
            request_id,
            method,
            forward_path,
            target_url,
            payload.len()
        );

        let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| GatewayError::BadRequest(format!("Invalid method: {}", e)))?;
        let mut request_builder = self.client.request(reqwest_method, &target_url);
        for (name, value) in headers.iter() {
            request_builder = request_builder.header(name.as_str(), value.as_bytes());
        }
        if !payload.is_empty() {
            request_builder = request_builder.body(payload);
        }

        let response = request_builder.send().await.map_err(|e| {
            error!("Upstream request {} failed: {}", request_id, e);
            GatewayError::Upstream(format!("Request failed: {}", e))
        })?;

        let status = response.status().as_u16();
        let response_headers = response.headers().clone();
        let response_body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Upstream(format!("Failed to read response body: {}", e)))?;

        let mut builder = Response::builder().status(
            StatusCode::from_u16(status)
                .map_err(|e| GatewayError::Upstream(format!("Invalid upstream status: {}", e)))?,
        );
        for (name, value) in response_headers.iter() {
            if let (Ok(header_name), Ok(header_value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                if !is_hop_by_hop_header(&header_name) {
                    builder = builder.header(header_name, header_value);
                }
            }
        }

        builder.body(Body::from(response_body)).map_err(|e| {
            error!("Failed to build response for {}: {}", request_id, e);
            GatewayError::Internal("Failed to build response".to_string())
        })
    }
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}
