//! Two transaction managers wired back to back over in-memory
//! transports: a client sends OPTIONS, the server answers 200, both
//! machines run their full RFC 3261 lifecycles.
//!
//! ```text
//! RUST_LOG=sipline=debug cargo run --example options_flow
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use sipline_sip_core::{Address, Method, Request, Response, StatusCode, Via};
use sipline_sip_transport::{mock::MockTransport, Transport};
use sipline_transaction_core::{
    TransactionEvent, TransactionManager, TransactionManagerConfig,
};

/// Pump everything one side sends into the other side's ingress.
async fn bridge(from: &MockTransport, to: TransactionManager, from_addr: SocketAddr) {
    let mut sends = from.subscribe_sends().await;
    tokio::spawn(async move {
        while let Some((message, _dest)) = sends.recv().await {
            let _ = to.handle_message(message, from_addr).await;
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let client_transport = MockTransport::udp();
    let server_transport = MockTransport::udp();
    let client_addr: SocketAddr = "127.0.0.1:5061".parse()?;
    let server_addr: SocketAddr = "127.0.0.1:5060".parse()?;

    let (client, mut client_events) = TransactionManager::new(
        client_transport.clone() as Arc<dyn Transport>,
        TransactionManagerConfig::default(),
    );
    let (server, mut server_events) = TransactionManager::new(
        server_transport.clone() as Arc<dyn Transport>,
        TransactionManagerConfig::default(),
    );

    bridge(&client_transport, server.clone(), client_addr).await;
    bridge(&server_transport, client.clone(), server_addr).await;

    // Server side: answer every new request with 200 OK.
    let server_for_events = server.clone();
    tokio::spawn(async move {
        while let Some(event) = server_events.recv().await {
            if let TransactionEvent::NewRequest {
                transaction_id,
                request,
                source,
            } = event
            {
                info!(%source, method = %request.method, "server got request");
                let ok = Response::for_request(StatusCode::OK, &request).with_to_tag("srv");
                if let Err(e) = server_for_events.send_response(&transaction_id, ok).await {
                    tracing::error!(error = %e, "response send failed");
                }
            }
        }
    });

    let options = Request::new(Method::Options, "sip:server@127.0.0.1:5060".parse()?)
        .with_via(Via::new("UDP", client_addr.to_string()))
        .with_from(Address::new("sip:client@127.0.0.1".parse()?).with_tag("cli"))
        .with_to(Address::new("sip:server@127.0.0.1".parse()?))
        .with_call_id("options-flow-1")
        .with_cseq(1);

    let key = client.create_client_transaction(options, server_addr).await?;
    client.send_request(&key).await?;
    info!(id = %key, "OPTIONS sent");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, client_events.recv())
            .await?
            .ok_or("event channel closed")?;
        match event {
            TransactionEvent::SuccessResponse { response, .. } => {
                info!(status = %response.status, "final response received");
            }
            TransactionEvent::TransactionTerminated { transaction_id } => {
                info!(id = %transaction_id, "client transaction finished");
                break;
            }
            TransactionEvent::StateChanged {
                previous_state,
                new_state,
                ..
            } => {
                info!(?previous_state, ?new_state, "client state");
            }
            _ => {}
        }
    }

    Ok(())
}
