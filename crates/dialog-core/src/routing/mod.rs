//! Next-hop selection for outbound in-dialog requests.

use std::net::SocketAddr;

use async_trait::async_trait;

use sipline_sip_core::{Request, Uri};

use crate::errors::{DialogError, DialogResult};

/// Where a request should be transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop {
    pub address: SocketAddr,
}

/// Resolves the next hop for a request built by the dialog layer.
///
/// The default [`UriResolver`] handles literal IP targets, which covers
/// in-dialog traffic where Contact carries an address. Deployments that
/// need RFC 3263 DNS resolution plug in their own implementation.
#[async_trait]
pub trait NextHopResolver: Send + Sync {
    async fn resolve(&self, request: &Request) -> DialogResult<Hop>;
}

/// Default resolver: first Route entry if present, else the request URI,
/// accepted only when the host is a numeric IP.
#[derive(Debug, Default, Clone, Copy)]
pub struct UriResolver;

impl UriResolver {
    fn hop_for(uri: &Uri) -> DialogResult<Hop> {
        uri.socket_addr().map(|address| Hop { address }).ok_or_else(|| {
            DialogError::routing_error(format!("cannot resolve non-literal host {}", uri.host))
        })
    }
}

#[async_trait]
impl NextHopResolver for UriResolver {
    async fn resolve(&self, request: &Request) -> DialogResult<Hop> {
        // A loose-routed request travels via its first Route hop; the
        // request URI is only the final destination.
        match request.route.first() {
            Some(route) => Self::hop_for(route),
            None => Self::hop_for(&request.uri),
        }
    }
}
