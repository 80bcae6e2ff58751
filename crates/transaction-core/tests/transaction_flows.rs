//! End-to-end transaction scenarios over the in-memory transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio::sync::mpsc;
use tokio::time::timeout;

use sipline_sip_core::{Address, Message, Method, Request, Response, StatusCode, Via};
use sipline_sip_transport::MockTransport;
use sipline_transaction_core::manager::{TransactionManager, TransactionManagerConfig};
use sipline_transaction_core::{TransactionEvent, TransactionState};

fn peer() -> SocketAddr {
    "192.0.2.10:5060".parse().unwrap()
}

fn request(method: Method, branch: &str, call_id: &str) -> Request {
    Request::new(method, "sip:bob@example.net".parse().unwrap())
        .with_via(Via::new("UDP", "alice.example.com:5060").with_branch(branch))
        .with_from(Address::new("sip:alice@example.com".parse().unwrap()).with_tag("alice-tag"))
        .with_to(Address::new("sip:bob@example.net".parse().unwrap()))
        .with_call_id(call_id)
        .with_cseq(1)
}

fn setup(
    transport: Arc<MockTransport>,
) -> (TransactionManager, mpsc::Receiver<TransactionEvent>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
    TransactionManager::new(transport, TransactionManagerConfig::fast_for_tests())
}

/// Wait up to two seconds for an event satisfying `pred`, discarding
/// everything else (state changes, informational events).
async fn wait_for_event<F>(
    events: &mut mpsc::Receiver<TransactionEvent>,
    mut pred: F,
) -> TransactionEvent
where
    F: FnMut(&TransactionEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
#[serial]
async fn non_invite_client_times_out_exactly_once() {
    let transport = MockTransport::udp();
    let (manager, mut events) = setup(transport.clone());

    let key = manager
        .create_client_transaction(request(Method::Options, "z9hG4bKtmo", "call-tmo"), peer())
        .await
        .unwrap();
    manager.send_request(&key).await.unwrap();

    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::TransactionTimeout { transaction_id, .. }
            if *transaction_id == key)
    })
    .await;
    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::TransactionTerminated { transaction_id }
            if *transaction_id == key)
    })
    .await;

    // Timer E retransmitted while waiting for Timer F.
    assert!(transport.sent_count().await > 1);

    // No second timeout arrives.
    let extra = timeout(Duration::from_millis(200), async {
        loop {
            match events.recv().await {
                Some(TransactionEvent::TransactionTimeout { .. }) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await;
    assert!(extra.is_err() || !extra.unwrap());
}

#[tokio::test]
async fn invite_client_success_terminates_transaction() {
    let transport = MockTransport::udp();
    let (manager, mut events) = setup(transport.clone());

    let invite = request(Method::Invite, "z9hG4bKok", "call-ok");
    let key = manager.create_client_transaction(invite.clone(), peer()).await.unwrap();
    manager.send_request(&key).await.unwrap();

    let ringing = Response::for_request(StatusCode::RINGING, &invite).with_to_tag("bob-tag");
    manager
        .handle_message(Message::Response(ringing), peer())
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::ProvisionalResponse { transaction_id, .. }
            if *transaction_id == key)
    })
    .await;
    assert_eq!(
        manager.transaction_state(&key).await.unwrap(),
        TransactionState::Proceeding
    );

    let ok = Response::for_request(StatusCode::OK, &invite).with_to_tag("bob-tag");
    manager.handle_message(Message::Response(ok), peer()).await.unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::SuccessResponse { transaction_id, .. }
            if *transaction_id == key)
    })
    .await;
    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::TransactionTerminated { transaction_id }
            if *transaction_id == key)
    })
    .await;
}

#[tokio::test]
async fn invite_client_acks_failure_responses_itself() {
    let transport = MockTransport::udp();
    let (manager, mut events) = setup(transport.clone());

    let invite = request(Method::Invite, "z9hG4bKbusy", "call-busy");
    let key = manager.create_client_transaction(invite.clone(), peer()).await.unwrap();
    manager.send_request(&key).await.unwrap();

    let busy = Response::for_request(StatusCode::BUSY_HERE, &invite).with_to_tag("bob-tag");
    manager
        .handle_message(Message::Response(busy.clone()), peer())
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::FailureResponse { transaction_id, .. }
            if *transaction_id == key)
    })
    .await;

    let ack_count = |sent: &[(Message, SocketAddr)]| {
        sent.iter()
            .filter(|(m, _)| m.as_request().map(|r| r.method == Method::Ack).unwrap_or(false))
            .count()
    };
    let sent = transport.sent_messages().await;
    assert_eq!(ack_count(&sent), 1, "engine must ACK the 486");

    // A retransmitted 486 is re-ACKed without a second TU event.
    manager
        .handle_message(Message::Response(busy), peer())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = transport.sent_messages().await;
    assert_eq!(ack_count(&sent), 2);
}

#[tokio::test]
async fn invite_server_non_2xx_waits_for_ack() {
    let transport = MockTransport::udp();
    let (manager, mut events) = setup(transport.clone());

    let invite = request(Method::Invite, "z9hG4bKsrv", "call-srv");
    manager
        .handle_message(Message::Request(invite.clone()), peer())
        .await
        .unwrap();

    let key = match wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::NewRequest { .. })
    })
    .await
    {
        TransactionEvent::NewRequest { transaction_id, .. } => transaction_id,
        _ => unreachable!(),
    };

    let busy = Response::for_request(StatusCode::BUSY_HERE, &invite).with_to_tag("uas-tag");
    manager.send_response(&key, busy).await.unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::StateChanged { new_state, .. }
            if *new_state == TransactionState::Completed)
    })
    .await;

    // ACK for the non-2xx shares the INVITE's branch.
    let ack = request(Method::Ack, "z9hG4bKsrv", "call-srv");
    manager
        .handle_message(Message::Request(ack.clone()), peer())
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::AckReceived { transaction_id, .. }
            if *transaction_id == key)
    })
    .await;

    // A retransmitted ACK is absorbed without a second event.
    manager
        .handle_message(Message::Request(ack), peer())
        .await
        .unwrap();
    let dup = timeout(Duration::from_millis(150), async {
        loop {
            match events.recv().await {
                Some(TransactionEvent::AckReceived { .. }) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await;
    assert!(dup.is_err() || !dup.unwrap(), "duplicate ACK must be a no-op");
}

#[tokio::test]
#[serial]
async fn server_retransmits_final_until_acked() {
    let transport = MockTransport::udp();
    let (manager, mut events) = setup(transport.clone());

    let invite = request(Method::Invite, "z9hG4bKrtx", "call-rtx");
    manager
        .handle_message(Message::Request(invite.clone()), peer())
        .await
        .unwrap();
    let key = match wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::NewRequest { .. })
    })
    .await
    {
        TransactionEvent::NewRequest { transaction_id, .. } => transaction_id,
        _ => unreachable!(),
    };

    let busy = Response::for_request(StatusCode::BUSY_HERE, &invite).with_to_tag("uas-tag");
    manager.send_response(&key, busy).await.unwrap();

    // With no ACK, Timer G fires several times before Timer H gives up.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let finals = transport
        .sent_messages()
        .await
        .iter()
        .filter(|(m, _)| {
            m.as_response()
                .map(|r| r.status == StatusCode::BUSY_HERE)
                .unwrap_or(false)
        })
        .count();
    assert!(finals >= 2, "expected retransmitted finals, saw {}", finals);
}

#[tokio::test]
async fn cancel_creates_sibling_transaction_and_notifies_tu() {
    let transport = MockTransport::udp();
    let (manager, mut events) = setup(transport.clone());

    // Server side: an INVITE is in progress.
    let invite = request(Method::Invite, "z9hG4bKcan", "call-can");
    manager
        .handle_message(Message::Request(invite), peer())
        .await
        .unwrap();
    let invite_key = match wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::NewRequest { .. })
    })
    .await
    {
        TransactionEvent::NewRequest { transaction_id, .. } => transaction_id,
        _ => unreachable!(),
    };

    // CANCEL arrives with the INVITE's branch but its own method.
    let cancel = request(Method::Cancel, "z9hG4bKcan", "call-can");
    manager
        .handle_message(Message::Request(cancel), peer())
        .await
        .unwrap();

    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::CancelReceived { transaction_id, .. }
            if *transaction_id == invite_key)
    })
    .await;
    // The CANCEL also shows up as its own server transaction.
    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::NewRequest { request, .. }
            if request.method == Method::Cancel)
    })
    .await;
}

#[tokio::test]
#[serial]
async fn timed_out_cancel_reaps_its_early_invite() {
    let transport = MockTransport::udp();
    let (manager, mut events) = setup(transport.clone());

    let invite = request(Method::Invite, "z9hG4bKctmo", "call-ctmo");
    let invite_key = manager
        .create_client_transaction(invite.clone(), peer())
        .await
        .unwrap();
    manager.send_request(&invite_key).await.unwrap();

    // The CANCEL goes out and is never answered.
    let cancel = request(Method::Cancel, "z9hG4bKctmo", "call-ctmo");
    let cancel_key = manager
        .create_client_transaction(cancel, peer())
        .await
        .unwrap();
    manager.send_request(&cancel_key).await.unwrap();

    // A provisional arriving after the CANCEL re-arms the INVITE's
    // timeout, so the CANCEL's Timer F fires well before it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ringing = Response::for_request(StatusCode::RINGING, &invite);
    manager
        .handle_message(Message::Response(ringing), peer())
        .await
        .unwrap();

    // The CANCEL timeout must take the still-Proceeding INVITE with it;
    // the INVITE must not time out on its own.
    let mut invite_timed_out = false;
    loop {
        let event = wait_for_event(&mut events, |_| true).await;
        match event {
            TransactionEvent::TransactionTimeout { transaction_id, .. }
                if transaction_id == invite_key =>
            {
                invite_timed_out = true;
            }
            TransactionEvent::TransactionTerminated { transaction_id }
                if transaction_id == invite_key =>
            {
                break;
            }
            _ => {}
        }
    }
    assert!(!invite_timed_out, "INVITE timed out instead of being reaped");
}

#[tokio::test]
async fn stray_ack_and_response_are_surfaced() {
    let transport = MockTransport::udp();
    let (manager, mut events) = setup(transport.clone());

    // ACK to a 2xx carries a branch no transaction knows.
    let ack = request(Method::Ack, "z9hG4bKnowhere", "call-stray");
    manager
        .handle_message(Message::Request(ack), peer())
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, TransactionEvent::StrayAck { .. })).await;

    // A forked 2xx arriving after its transaction died is surfaced too.
    let orig = request(Method::Invite, "z9hG4bKgone", "call-stray");
    let late_ok = Response::for_request(StatusCode::OK, &orig).with_to_tag("fork-2");
    manager
        .handle_message(Message::Response(late_ok), peer())
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::StrayResponse { .. })
    })
    .await;
}

#[tokio::test]
async fn reliable_provisional_waits_for_prack() {
    let transport = MockTransport::udp();
    let (manager, mut events) = setup(transport.clone());

    let invite = request(Method::Invite, "z9hG4bKrel", "call-rel");
    manager
        .handle_message(Message::Request(invite.clone()), peer())
        .await
        .unwrap();
    let key = match wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::NewRequest { .. })
    })
    .await
    {
        TransactionEvent::NewRequest { transaction_id, .. } => transaction_id,
        _ => unreachable!(),
    };

    let ringing = Response::for_request(StatusCode::RINGING, &invite).with_to_tag("uas-tag");
    manager.send_reliable_provisional(&key, ringing).await.unwrap();

    // The provisional goes out with RSeq 1 and retransmits until PRACKed.
    tokio::time::sleep(Duration::from_millis(40)).await;
    let rseq = transport
        .sent_messages()
        .await
        .iter()
        .find_map(|(m, _)| m.as_response().and_then(|r| r.rseq));
    assert_eq!(rseq, Some(1));

    let mut prack = request(Method::Prack, "z9hG4bKprack", "call-rel");
    prack.cseq = Some(sipline_sip_core::CSeq::new(2, Method::Prack));
    prack = prack.with_rack(sipline_sip_core::RAck::new(1, 1, Method::Invite));
    manager
        .handle_message(Message::Request(prack), peer())
        .await
        .unwrap();

    wait_for_event(&mut events, |e| {
        matches!(e, TransactionEvent::PrackReceived { transaction_id, .. }
            if *transaction_id == key)
    })
    .await;
}

#[tokio::test]
#[serial]
async fn concurrent_response_bursts_deliver_in_order() {
    let transport = MockTransport::udp();
    let (manager, mut events) = setup(transport.clone());

    let options = request(Method::Options, "z9hG4bKburst", "call-burst");
    let key = manager
        .create_client_transaction(options.clone(), peer())
        .await
        .unwrap();
    manager.send_request(&key).await.unwrap();

    // Several tasks hammer the ingress with provisionals while another
    // delivers the final. The gate must hand the TU one event at a time,
    // and nothing provisional may surface after the final.
    let mut injectors = Vec::new();
    for _ in 0..3 {
        let manager = manager.clone();
        let provisional = Response::for_request(StatusCode::TRYING, &options);
        injectors.push(tokio::spawn(async move {
            for _ in 0..5 {
                let _ = manager
                    .handle_message(Message::Response(provisional.clone()), peer())
                    .await;
            }
        }));
    }
    {
        let manager = manager.clone();
        let ok = Response::for_request(StatusCode::OK, &options);
        injectors.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            manager
                .handle_message(Message::Response(ok), peer())
                .await
                .unwrap();
        }));
    }

    let mut finals = 0;
    let mut provisional_after_final = false;
    loop {
        let event = wait_for_event(&mut events, |_| true).await;
        match event {
            TransactionEvent::ProvisionalResponse { .. } => {
                if finals > 0 {
                    provisional_after_final = true;
                }
            }
            TransactionEvent::SuccessResponse { .. } => finals += 1,
            TransactionEvent::TransactionTerminated { transaction_id }
                if transaction_id == key =>
            {
                break;
            }
            _ => {}
        }
    }
    for handle in injectors {
        handle.await.unwrap();
    }
    assert_eq!(finals, 1, "exactly one final must reach the TU");
    assert!(!provisional_after_final, "provisional delivered after the final");
}
