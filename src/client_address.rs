use std::net::{IpAddr, SocketAddr};

use axum::{async_trait, extract::{ConnectInfo, FromRef, FromRequestParts}};
use http::{HeaderMap, StatusCode, request::Parts};


/// Extractor which resolves the network address of the requesting client.
///
/// If forwarded headers are trusted, reads the 'CF-Connecting-IP' header,
/// then the first entry of 'X-Forwarded-For'. Otherwise, or if neither is
/// present, uses the peer address of the connection (only known if the
/// server was started with connect info).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientAddress(pub IpAddr);

/// Whether the forwarding headers set by a proxy in front of the service
/// are believed. Only enable this if the proxy overwrites them, otherwise
/// any client can claim any address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrustForwardedHeaders(pub bool);

fn header_address(headers: &HeaderMap) -> Option<IpAddr> {
    let connecting_ip = headers
    .get("CF-Connecting-IP")
    .and_then(|v|v.to_str().ok())
    .and_then(|v|v.trim().parse().ok());
    if connecting_ip.is_some() {
        return connecting_ip;
    }

    headers
    .get("X-Forwarded-For")
    .and_then(|v|v.to_str().ok())
    .and_then(|v|v.split(',').next())
    .and_then(|v|v.trim().parse().ok())
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientAddress
where
    S: Send + Sync,
    TrustForwardedHeaders: FromRef<S>,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TrustForwardedHeaders(trusted) = TrustForwardedHeaders::from_ref(state);
        trusted
        .then(||header_address(&parts.headers))
        .flatten()
        .or_else(||parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|ci|ci.0.ip()))
        .map(ClientAddress)
        .ok_or((StatusCode::BAD_REQUEST, "unable to determine client address"))
    }
}

#[test]
fn test_header_address_precedence() {
    let mut headers = HeaderMap::new();
    assert_eq!(header_address(&headers), None);

    headers.insert("X-Forwarded-For", "203.0.113.7, 10.0.0.1".parse().unwrap());
    assert_eq!(header_address(&headers), Some("203.0.113.7".parse().unwrap()));

    headers.insert("CF-Connecting-IP", "2001:db8::1".parse().unwrap());
    assert_eq!(header_address(&headers), Some("2001:db8::1".parse().unwrap()));

    // unparsable values are skipped
    headers.insert("CF-Connecting-IP", "unknown".parse().unwrap());
    assert_eq!(header_address(&headers), Some("203.0.113.7".parse().unwrap()));
}

#[tokio::test]
async fn test_untrusted_headers_are_ignored() {
    let peer: SocketAddr = "192.0.2.10:40000".parse().unwrap();
    let request = || {
        let mut req = http::Request::builder()
        .header("CF-Connecting-IP", "1.2.3.4")
        .body(())
        .unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));
        req.into_parts().0
    };

    let ClientAddress(address) = ClientAddress::from_request_parts(&mut request(), &TrustForwardedHeaders(false)).await.unwrap();
    assert_eq!(address, peer.ip());

    let ClientAddress(address) = ClientAddress::from_request_parts(&mut request(), &TrustForwardedHeaders(true)).await.unwrap();
    assert_eq!(address, "1.2.3.4".parse::<IpAddr>().unwrap());
}
