//! End-to-end dialog flows over the in-memory transport: the dialog
//! manager stacked on a real transaction manager, with messages injected
//! at the transaction ingress.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio::sync::mpsc;

use sipline_dialog_core::{DialogConfig, DialogError, DialogEvent, DialogManager, DialogState};
use sipline_sip_core::{
    Address, CSeq, Message, Method, Request, Response, StatusCode, Via,
};
use sipline_sip_transport::{mock::MockTransport, Transport};
use sipline_transaction_core::{TransactionManager, TransactionManagerConfig};

fn peer() -> SocketAddr {
    "10.0.0.2:5060".parse().unwrap()
}

fn invite(branch: &str, call_id: &str) -> Request {
    Request::new(Method::Invite, "sip:bob@192.168.1.20:5060".parse().unwrap())
        .with_via(Via::new("UDP", "10.0.0.2:5060").with_branch(branch))
        .with_from(Address::new("sip:alice@10.0.0.2".parse().unwrap()).with_tag("alice-tag"))
        .with_to(Address::new("sip:bob@192.168.1.20".parse().unwrap()))
        .with_call_id(call_id)
        .with_cseq(1)
        .with_contact(Address::new("sip:alice@10.0.0.2:5060".parse().unwrap()))
}

/// An INVITE this side originates; the transaction layer stamps the Via.
fn outbound_invite(call_id: &str) -> Request {
    let mut request = invite("ignored", call_id);
    request.via.clear();
    request.uri = "sip:bob@10.0.0.2:5060".parse().unwrap();
    request
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn setup() -> (
    TransactionManager,
    DialogManager,
    mpsc::Receiver<DialogEvent>,
    Arc<MockTransport>,
) {
    setup_with(DialogConfig::fast_for_tests())
}

fn setup_with(
    config: DialogConfig,
) -> (
    TransactionManager,
    DialogManager,
    mpsc::Receiver<DialogEvent>,
    Arc<MockTransport>,
) {
    init_logging();
    let transport = MockTransport::udp();
    let (transactions, transaction_events) = TransactionManager::new(
        transport.clone() as Arc<dyn Transport>,
        TransactionManagerConfig::fast_for_tests(),
    );
    let (dialogs, events) = DialogManager::new(
        transactions.clone(),
        transaction_events,
        transport.clone() as Arc<dyn Transport>,
        config,
    );
    (transactions, dialogs, events, transport)
}

async fn wait_for_event(
    events: &mut mpsc::Receiver<DialogEvent>,
    predicate: impl Fn(&DialogEvent) -> bool,
) -> DialogEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected dialog event did not arrive")
}

async fn wait_for_sent(
    transport: &MockTransport,
    predicate: impl Fn(&Message) -> bool,
) -> Message {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            for (message, _) in transport.sent_messages().await {
                if predicate(&message) {
                    return message;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("expected message was not sent")
}

/// Drive a UAC dialog to Confirmed; returns (dialog id, wire INVITE).
async fn confirm_uac_dialog(
    transactions: &TransactionManager,
    dialogs: &DialogManager,
    events: &mut mpsc::Receiver<DialogEvent>,
    transport: &MockTransport,
    call_id: &str,
) -> (sipline_dialog_core::DialogId, Request) {
    dialogs
        .send_invite(outbound_invite(call_id), peer())
        .await
        .unwrap();
    let wire_invite = wait_for_sent(transport, |m| {
        m.as_request().map(|r| r.method == Method::Invite).unwrap_or(false)
            && m.call_id_str() == Some(call_id)
    })
    .await;
    let wire_invite = wire_invite.as_request().unwrap().clone();

    let ok = Response::for_request(StatusCode::OK, &wire_invite)
        .with_to_tag("bob-tag")
        .with_contact(Address::new("sip:bob@10.0.0.2:5060".parse().unwrap()));
    transactions
        .handle_message(Message::Response(ok), peer())
        .await
        .unwrap();

    let created = wait_for_event(events, |e| matches!(e, DialogEvent::Created { .. })).await;
    let DialogEvent::Created { dialog_id } = created else { unreachable!() };
    assert_eq!(
        dialogs.dialog_state(&dialog_id).await.unwrap(),
        DialogState::Confirmed
    );
    (dialog_id, wire_invite)
}

#[tokio::test]
async fn uac_dialog_early_then_confirmed_then_acked() {
    let (transactions, dialogs, mut events, transport) = setup();

    dialogs
        .send_invite(outbound_invite("call-uac-1"), peer())
        .await
        .unwrap();
    let wire_invite = wait_for_sent(&transport, |m| m.is_request()).await;
    let wire_invite = wire_invite.as_request().unwrap().clone();
    let branch = wire_invite.branch().unwrap().to_string();

    // Tagged 180 establishes an early dialog.
    let ringing = Response::for_request(StatusCode::RINGING, &wire_invite).with_to_tag("bob-tag");
    transactions
        .handle_message(Message::Response(ringing), peer())
        .await
        .unwrap();
    let created = wait_for_event(&mut events, |e| matches!(e, DialogEvent::Created { .. })).await;
    let DialogEvent::Created { dialog_id } = created else { unreachable!() };
    assert_eq!(dialog_id.remote_tag, "bob-tag");
    assert_eq!(
        dialogs.dialog_state(&dialog_id).await.unwrap(),
        DialogState::Early
    );

    // 200 confirms it.
    let ok = Response::for_request(StatusCode::OK, &wire_invite)
        .with_to_tag("bob-tag")
        .with_contact(Address::new("sip:bob@10.0.0.2:5060".parse().unwrap()));
    transactions
        .handle_message(Message::Response(ok), peer())
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(
            e,
            DialogEvent::StateChanged {
                current: DialogState::Confirmed,
                ..
            }
        )
    })
    .await;

    // The ACK goes out as its own transaction-less message with a fresh
    // branch and the INVITE's CSeq number.
    dialogs.send_ack(&dialog_id).await.unwrap();
    let ack = wait_for_sent(&transport, |m| {
        m.as_request().map(|r| r.method == Method::Ack).unwrap_or(false)
    })
    .await;
    let ack = ack.as_request().unwrap();
    assert_eq!(ack.cseq.as_ref().unwrap().seq, 1);
    assert_ne!(ack.branch().unwrap(), branch);
    assert_eq!(ack.to_tag(), Some("bob-tag"));
}

#[tokio::test]
async fn uas_rejecting_invite_terminates_the_dialog() {
    let (transactions, dialogs, mut events, transport) = setup();

    transactions
        .handle_message(Message::Request(invite("z9hG4bK-uas-1", "call-uas-1")), peer())
        .await
        .unwrap();
    let request_event = wait_for_event(&mut events, |e| {
        matches!(e, DialogEvent::RequestReceived { .. })
    })
    .await;
    let DialogEvent::RequestReceived {
        dialog_id: Some(dialog_id),
        transaction_key,
        request,
    } = request_event
    else {
        panic!("expected in-dialog request event");
    };

    dialogs
        .send_response(&transaction_key, Response::for_request(StatusCode::BUSY_HERE, &request))
        .await
        .unwrap();

    let terminated = wait_for_event(&mut events, |e| {
        matches!(e, DialogEvent::Terminated { .. })
    })
    .await;
    let DialogEvent::Terminated { reason, .. } = terminated else { unreachable!() };
    assert_eq!(reason, "rejected");

    // The wire 486 carries the dialog's locally chosen To tag.
    let busy = wait_for_sent(&transport, |m| {
        m.as_response().map(|r| r.status == StatusCode::BUSY_HERE).unwrap_or(false)
    })
    .await;
    assert_eq!(busy.as_response().unwrap().to_tag(), Some(dialog_id.local_tag.as_str()));
}

#[tokio::test]
#[serial]
async fn uas_2xx_retransmits_until_acked() {
    let (transactions, dialogs, mut events, transport) = setup();

    transactions
        .handle_message(Message::Request(invite("z9hG4bK-uas-2", "call-uas-2")), peer())
        .await
        .unwrap();
    let request_event = wait_for_event(&mut events, |e| {
        matches!(e, DialogEvent::RequestReceived { .. })
    })
    .await;
    let DialogEvent::RequestReceived {
        dialog_id: Some(dialog_id),
        transaction_key,
        request,
    } = request_event
    else {
        panic!("expected in-dialog request event");
    };

    dialogs
        .send_response(&transaction_key, Response::for_request(StatusCode::OK, &request))
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(
            e,
            DialogEvent::StateChanged {
                current: DialogState::Confirmed,
                ..
            }
        )
    })
    .await;

    // The dialog layer retransmits the 2xx until the ACK arrives.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let count = transport
                .sent_messages()
                .await
                .iter()
                .filter(|(m, _)| {
                    m.as_response().map(|r| r.status.is_success()).unwrap_or(false)
                })
                .count();
            if count >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("2xx was not retransmitted");

    // ACK to a 2xx: new branch, To tag of the dialog.
    let mut ack = Request::new(Method::Ack, "sip:bob@192.168.1.20:5060".parse().unwrap())
        .with_via(Via::new("UDP", "10.0.0.2:5060").with_branch("z9hG4bK-ack-2"))
        .with_from(Address::new("sip:alice@10.0.0.2".parse().unwrap()).with_tag("alice-tag"))
        .with_to(
            Address::new("sip:bob@192.168.1.20".parse().unwrap())
                .with_tag(dialog_id.local_tag.clone()),
        )
        .with_call_id("call-uas-2");
    ack.cseq = Some(CSeq::new(1, Method::Ack));
    transactions
        .handle_message(Message::Request(ack), peer())
        .await
        .unwrap();

    wait_for_event(&mut events, |e| matches!(e, DialogEvent::AckReceived { .. })).await;

    // Acked: the dialog stays Confirmed past the ACK deadline.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(
        dialogs.dialog_state(&dialog_id).await.unwrap(),
        DialogState::Confirmed
    );
}

#[tokio::test]
#[serial]
async fn uas_2xx_without_ack_tears_the_dialog_down() {
    let (transactions, dialogs, mut events, _transport) = setup();

    transactions
        .handle_message(Message::Request(invite("z9hG4bK-uas-3", "call-uas-3")), peer())
        .await
        .unwrap();
    let request_event = wait_for_event(&mut events, |e| {
        matches!(e, DialogEvent::RequestReceived { .. })
    })
    .await;
    let DialogEvent::RequestReceived {
        dialog_id: Some(dialog_id),
        transaction_key,
        request,
    } = request_event
    else {
        panic!("expected in-dialog request event");
    };

    dialogs
        .send_response(&transaction_key, Response::for_request(StatusCode::OK, &request))
        .await
        .unwrap();

    wait_for_event(&mut events, |e| {
        matches!(e, DialogEvent::AckNotReceived { .. })
    })
    .await;
    let terminated =
        wait_for_event(&mut events, |e| matches!(e, DialogEvent::Terminated { .. })).await;
    let DialogEvent::Terminated { dialog_id: gone, .. } = terminated else { unreachable!() };
    assert_eq!(gone, dialog_id);
}

#[tokio::test]
async fn forked_2xx_creates_linked_dialog() {
    let mut config = DialogConfig::fast_for_tests();
    // Keep pending-INVITE bookkeeping alive long enough for the late fork.
    config.linger_duration = Duration::from_millis(500);
    let (transactions, dialogs, mut events, transport) = setup_with(config);

    let (first_id, wire_invite) = confirm_uac_dialog(
        &transactions,
        &dialogs,
        &mut events,
        &transport,
        "call-fork-1",
    )
    .await;

    // Let the INVITE client transaction finish and get reaped, then
    // deliver the second branch's 2xx: it arrives as a stray.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let forked_ok = Response::for_request(StatusCode::OK, &wire_invite)
        .with_to_tag("fork-b")
        .with_contact(Address::new("sip:bob2@10.0.0.2:5062".parse().unwrap()));
    transactions
        .handle_message(Message::Response(forked_ok), peer())
        .await
        .unwrap();

    let forked = wait_for_event(&mut events, |e| {
        matches!(e, DialogEvent::ForkedDialogCreated { .. })
    })
    .await;
    let DialogEvent::ForkedDialogCreated { dialog_id, original } = forked else { unreachable!() };
    assert_eq!(original, first_id);
    assert_eq!(dialog_id.remote_tag, "fork-b");
    assert_eq!(
        dialogs.dialog_state(&dialog_id).await.unwrap(),
        DialogState::Confirmed
    );

    // Both dialogs can be ACKed independently.
    dialogs.send_ack(&first_id).await.unwrap();
    dialogs.send_ack(&dialog_id).await.unwrap();
}

#[tokio::test]
async fn stray_2xx_confirms_a_still_ringing_fork() {
    let mut config = DialogConfig::fast_for_tests();
    // Keep pending-INVITE bookkeeping alive long enough for the late fork,
    // and the ringing branch alive past the transaction reap.
    config.linger_duration = Duration::from_millis(500);
    config.early_dialog_timeout = Duration::from_secs(2);
    let (transactions, dialogs, mut events, transport) = setup_with(config);

    dialogs
        .send_invite(outbound_invite("call-fork-2"), peer())
        .await
        .unwrap();
    let wire_invite = wait_for_sent(&transport, |m| m.is_request()).await;
    let wire_invite = wire_invite.as_request().unwrap().clone();

    // First branch rings: an early dialog.
    let ringing = Response::for_request(StatusCode::RINGING, &wire_invite).with_to_tag("fork-a");
    transactions
        .handle_message(Message::Response(ringing), peer())
        .await
        .unwrap();
    let created = wait_for_event(&mut events, |e| matches!(e, DialogEvent::Created { .. })).await;
    let DialogEvent::Created { dialog_id: early_id } = created else { unreachable!() };
    assert_eq!(
        dialogs.dialog_state(&early_id).await.unwrap(),
        DialogState::Early
    );

    // Second branch answers; the INVITE transaction terminates on its 2xx.
    let other_ok = Response::for_request(StatusCode::OK, &wire_invite)
        .with_to_tag("fork-b")
        .with_contact(Address::new("sip:bob2@10.0.0.2:5062".parse().unwrap()));
    transactions
        .handle_message(Message::Response(other_ok), peer())
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, DialogEvent::ForkedDialogCreated { .. })
    })
    .await;

    // After the transaction is reaped, the first branch's late 2xx arrives
    // as a stray and must still confirm the dialog it rang on.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let late_ok = Response::for_request(StatusCode::OK, &wire_invite)
        .with_to_tag("fork-a")
        .with_contact(Address::new("sip:bob@10.0.0.2:5060".parse().unwrap()));
    transactions
        .handle_message(Message::Response(late_ok), peer())
        .await
        .unwrap();

    wait_for_event(&mut events, |e| {
        matches!(e, DialogEvent::StateChanged { dialog_id, current: DialogState::Confirmed, .. }
            if *dialog_id == early_id)
    })
    .await;
    assert_eq!(
        dialogs.dialog_state(&early_id).await.unwrap(),
        DialogState::Confirmed
    );
    dialogs.send_ack(&early_id).await.unwrap();
}

#[tokio::test]
async fn second_re_invite_blocks_until_first_is_acked() {
    let (transactions, dialogs, mut events, transport) = setup();

    let (dialog_id, _wire_invite) = confirm_uac_dialog(
        &transactions,
        &dialogs,
        &mut events,
        &transport,
        "call-b2b-1",
    )
    .await;
    dialogs.send_ack(&dialog_id).await.unwrap();
    transport.clear_sent().await;

    // First re-INVITE takes the gate.
    dialogs
        .send_request(&dialog_id, Method::Invite, b"v=0".to_vec())
        .await
        .unwrap();
    let reinvite = wait_for_sent(&transport, |m| {
        m.as_request().map(|r| r.method == Method::Invite).unwrap_or(false)
    })
    .await;
    let reinvite = reinvite.as_request().unwrap().clone();
    assert_eq!(reinvite.cseq.as_ref().unwrap().seq, 2);

    // A second one is refused while the first's ACK is outstanding.
    let err = dialogs
        .send_request(&dialog_id, Method::Invite, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DialogError::AckPending));

    // 200 to the re-INVITE, then the ACK releases the gate.
    let ok = Response::for_request(StatusCode::OK, &reinvite)
        .with_contact(Address::new("sip:bob@10.0.0.2:5060".parse().unwrap()));
    transactions
        .handle_message(Message::Response(ok), peer())
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, DialogEvent::ResponseReceived { response, .. }
            if response.status.is_success() && response.cseq.as_ref().map(|c| c.seq) == Some(2))
    })
    .await;
    dialogs.send_ack(&dialog_id).await.unwrap();

    let third = dialogs
        .send_request(&dialog_id, Method::Invite, Vec::new())
        .await
        .unwrap();
    assert_eq!(third.method, Method::Invite);
}

#[tokio::test]
async fn stale_cseq_is_rejected_in_dialog() {
    let (transactions, dialogs, mut events, transport) = setup();

    // Establish a UAS dialog and confirm it with an ACK.
    transactions
        .handle_message(Message::Request(invite("z9hG4bK-cseq-1", "call-cseq-1")), peer())
        .await
        .unwrap();
    let request_event = wait_for_event(&mut events, |e| {
        matches!(e, DialogEvent::RequestReceived { .. })
    })
    .await;
    let DialogEvent::RequestReceived {
        dialog_id: Some(dialog_id),
        transaction_key,
        request,
    } = request_event
    else {
        panic!("expected in-dialog request event");
    };
    dialogs
        .send_response(&transaction_key, Response::for_request(StatusCode::OK, &request))
        .await
        .unwrap();

    // Settle the INVITE with its ACK so the 2xx schedule stops.
    let mut ack = Request::new(Method::Ack, "sip:bob@192.168.1.20:5060".parse().unwrap())
        .with_via(Via::new("UDP", "10.0.0.2:5060").with_branch("z9hG4bK-ack-cseq"))
        .with_from(Address::new("sip:alice@10.0.0.2".parse().unwrap()).with_tag("alice-tag"))
        .with_to(
            Address::new("sip:bob@192.168.1.20".parse().unwrap())
                .with_tag(dialog_id.local_tag.clone()),
        )
        .with_call_id("call-cseq-1");
    ack.cseq = Some(CSeq::new(1, Method::Ack));
    transactions
        .handle_message(Message::Request(ack), peer())
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, DialogEvent::AckReceived { .. })).await;

    // BYE with the INVITE's CSeq: stale, answered 500 without reaching
    // the application.
    let mut stale_bye = Request::new(Method::Bye, "sip:bob@192.168.1.20:5060".parse().unwrap())
        .with_via(Via::new("UDP", "10.0.0.2:5060").with_branch("z9hG4bK-bye-stale"))
        .with_from(Address::new("sip:alice@10.0.0.2".parse().unwrap()).with_tag("alice-tag"))
        .with_to(
            Address::new("sip:bob@192.168.1.20".parse().unwrap())
                .with_tag(dialog_id.local_tag.clone()),
        )
        .with_call_id("call-cseq-1");
    stale_bye.cseq = Some(CSeq::new(1, Method::Bye));
    transactions
        .handle_message(Message::Request(stale_bye.clone()), peer())
        .await
        .unwrap();
    wait_for_sent(&transport, |m| {
        m.as_response()
            .map(|r| r.status == StatusCode::SERVER_INTERNAL_ERROR)
            .unwrap_or(false)
    })
    .await;

    // The same BYE with the next CSeq goes through, and answering it
    // completes the termination.
    let mut bye = stale_bye;
    bye.via[0].branch = Some("z9hG4bK-bye-ok".to_string());
    bye.cseq = Some(CSeq::new(2, Method::Bye));
    transactions
        .handle_message(Message::Request(bye), peer())
        .await
        .unwrap();
    let bye_event = wait_for_event(&mut events, |e| {
        matches!(e, DialogEvent::RequestReceived { request, .. } if request.method == Method::Bye)
    })
    .await;
    let DialogEvent::RequestReceived {
        transaction_key: bye_key,
        request: bye_request,
        ..
    } = bye_event
    else {
        unreachable!()
    };
    dialogs
        .send_response(&bye_key, Response::for_request(StatusCode::OK, &bye_request))
        .await
        .unwrap();

    let terminated =
        wait_for_event(&mut events, |e| matches!(e, DialogEvent::Terminated { .. })).await;
    let DialogEvent::Terminated { reason, .. } = terminated else { unreachable!() };
    assert_eq!(reason, "BYE");
}

#[tokio::test]
async fn uac_bye_terminates_on_2xx() {
    let (transactions, dialogs, mut events, transport) = setup();

    let (dialog_id, _) = confirm_uac_dialog(
        &transactions,
        &dialogs,
        &mut events,
        &transport,
        "call-bye-1",
    )
    .await;
    dialogs.send_ack(&dialog_id).await.unwrap();

    dialogs
        .send_request(&dialog_id, Method::Bye, Vec::new())
        .await
        .unwrap();
    let bye = wait_for_sent(&transport, |m| {
        m.as_request().map(|r| r.method == Method::Bye).unwrap_or(false)
    })
    .await;
    let bye = bye.as_request().unwrap().clone();
    assert_eq!(bye.cseq.as_ref().unwrap().seq, 2);

    let ok = Response::for_request(StatusCode::OK, &bye);
    transactions
        .handle_message(Message::Response(ok), peer())
        .await
        .unwrap();

    let terminated =
        wait_for_event(&mut events, |e| matches!(e, DialogEvent::Terminated { .. })).await;
    let DialogEvent::Terminated { dialog_id: gone, reason } = terminated else { unreachable!() };
    assert_eq!(gone, dialog_id);
    assert_eq!(reason, "BYE");
}
