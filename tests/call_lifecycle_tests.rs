mod common;

use bytes::Bytes;
use common::{ConnectorMode, MediaMode, MockMedia, Provider, RecordingGateway, StaticIssuer, provider};
use reunion_relay::call::CLOSING_MESSAGE;
use reunion_relay::interpreter::tools::DIAGRAM_FALLBACK_TEXT;
use reunion_relay::{
    CallCommand, CallConfig, CallManager, CallUpdate, ConnectionStatus, EndReason, Error, ErrorKind, Frame,
    RelayEvent, Session,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Call {
    manager: CallManager,
    session: Session,
    commands_tx: mpsc::Sender<CallCommand>,
    commands: mpsc::Receiver<CallCommand>,
    updates: mpsc::UnboundedReceiver<CallUpdate>,
    provider: Provider,
    gateway: Arc<RecordingGateway>,
    issuer: Arc<StaticIssuer>,
    media: MockMedia,
}

fn setup(config: CallConfig, connector: ConnectorMode, issuer: Arc<StaticIssuer>, media: MediaMode) -> Call {
    let (connector, provider) = provider(connector);
    let gateway = Arc::new(RecordingGateway::default());
    let manager = CallManager::new(config, issuer.clone(), connector, gateway.clone());
    let (updates_tx, updates) = mpsc::unbounded_channel();
    let session = manager.open_session(updates_tx);
    let (commands_tx, commands) = mpsc::channel(16);
    Call {
        manager,
        session,
        commands_tx,
        commands,
        updates,
        provider,
        gateway,
        issuer,
        media: MockMedia::new(media),
    }
}

fn default_call() -> Call {
    setup(CallConfig::default(), ConnectorMode::Accept, StaticIssuer::ok(), MediaMode::Grant)
}

async fn start(call: &mut Call) {
    call.manager
        .start(&mut call.session, &mut call.media, &mut call.commands)
        .await
        .unwrap();
}

/// Move the session onto its own task and run it to completion.
fn spawn_run(call: &mut Call) -> JoinHandle<(Session, EndReason)> {
    let manager = call.manager.clone();
    let (detached, _) = mpsc::unbounded_channel();
    let mut session = std::mem::replace(&mut call.session, manager.open_session(detached));
    let (_, closed) = mpsc::channel(1);
    let mut commands = std::mem::replace(&mut call.commands, closed);
    tokio::spawn(async move {
        let reason = manager.run(&mut session, &mut commands).await;
        (session, reason)
    })
}

fn drain(updates: &mut mpsc::UnboundedReceiver<CallUpdate>) -> Vec<CallUpdate> {
    let mut drained = Vec::new();
    while let Ok(update) = updates.try_recv() {
        drained.push(update);
    }
    drained
}

fn statuses(updates: &[CallUpdate]) -> Vec<ConnectionStatus> {
    updates
        .iter()
        .filter_map(|update| match update {
            CallUpdate::Relay(RelayEvent::Status { status }) => Some(*status),
            _ => None,
        })
        .collect()
}

fn message_texts(updates: &[CallUpdate]) -> Vec<String> {
    updates
        .iter()
        .filter_map(|update| match update {
            CallUpdate::Relay(RelayEvent::Message { message }) => Some(message.text.clone()),
            _ => None,
        })
        .collect()
}

async fn wait_for(
    updates: &mut mpsc::UnboundedReceiver<CallUpdate>,
    seen: &mut Vec<CallUpdate>,
    pred: impl Fn(&CallUpdate) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let update = updates.recv().await.expect("updates closed");
            let done = pred(&update);
            seen.push(update);
            if done {
                return;
            }
        }
    })
    .await
    .expect("expected update never arrived");
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_ends_the_call_with_one_closing_message() {
    let config = CallConfig { ceiling: Duration::from_secs(5), ..CallConfig::default() };
    let mut call = setup(config, ConnectorMode::Accept, StaticIssuer::ok(), MediaMode::Grant);
    start(&mut call).await;

    let reason = call.manager.run(&mut call.session, &mut call.commands).await;
    assert_eq!(reason, EndReason::Timeout);

    let updates = drain(&mut call.updates);
    assert_eq!(
        statuses(&updates),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnecting,
            ConnectionStatus::Idle,
        ]
    );

    let closing: Vec<usize> = updates
        .iter()
        .enumerate()
        .filter(|(_, u)| matches!(u, CallUpdate::Relay(RelayEvent::Message { message }) if message.text == CLOSING_MESSAGE))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(closing.len(), 1);
    let disconnecting = updates
        .iter()
        .position(|u| *u == CallUpdate::Relay(RelayEvent::Status { status: ConnectionStatus::Disconnecting }))
        .unwrap();
    assert!(closing[0] < disconnecting);

    let ticks: Vec<u64> = updates
        .iter()
        .filter_map(|u| match u {
            CallUpdate::Relay(RelayEvent::Tick { remaining_seconds }) => Some(*remaining_seconds),
            _ => None,
        })
        .collect();
    assert_eq!(ticks.first(), Some(&5));
    assert!(ticks.windows(2).all(|pair| pair[0] > pair[1]));

    call.session.wait_persisted().await;
    let saved = call.gateway.transcripts();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].messages.last().unwrap().text, CLOSING_MESSAGE);
    assert_eq!(saved[0].metadata.end_reason, EndReason::Timeout);
    assert_eq!(saved[0].duration, Duration::from_secs(5));
    assert!(call.gateway.audio().is_empty());
}

#[tokio::test]
async fn test_stopping_twice_releases_and_persists_once() {
    let mut call = default_call();
    start(&mut call).await;
    let run = spawn_run(&mut call);

    call.provider.send_json(&json!({
        "type": "response.audio_transcript.done",
        "response_id": "resp_1",
        "transcript": "Hello! Tell me about your family."
    }));
    let mut seen = Vec::new();
    wait_for(&mut call.updates, &mut seen, |u| matches!(u, CallUpdate::Relay(RelayEvent::Message { .. }))).await;

    call.commands_tx.send(CallCommand::Stop).await.unwrap();
    let (mut session, reason) = run.await.unwrap();
    assert_eq!(reason, EndReason::UserEnded);

    call.manager.stop(&mut session, EndReason::Timeout).await;
    session.wait_persisted().await;

    assert_eq!(session.end_reason(), Some(EndReason::UserEnded));
    assert_eq!(session.status(), ConnectionStatus::Idle);
    assert_eq!(call.media.releases.load(Ordering::SeqCst), 1);
    assert_eq!(call.provider.closes.load(Ordering::SeqCst), 1);
    let saved = call.gateway.transcripts();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].messages.len(), 1);
    assert_eq!(saved[0].metadata.end_reason, EndReason::UserEnded);
}

#[tokio::test]
async fn test_stop_while_connecting_goes_idle_without_connecting() {
    let mut call = setup(CallConfig::default(), ConnectorMode::Hang, StaticIssuer::ok(), MediaMode::Grant);
    call.commands_tx.send(CallCommand::Stop).await.unwrap();

    let err = call
        .manager
        .start(&mut call.session, &mut call.media, &mut call.commands)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    let updates = drain(&mut call.updates);
    assert_eq!(statuses(&updates), vec![ConnectionStatus::Connecting, ConnectionStatus::Idle]);
    assert_eq!(call.session.status(), ConnectionStatus::Idle);
    assert_eq!(call.session.bridge_status(), ConnectionStatus::Idle);
    assert!(call.session.is_stopped());
    assert_eq!(call.session.end_reason(), Some(EndReason::UserEnded));
    assert!(call.media.releases.load(Ordering::SeqCst) <= 1);

    call.manager.stop(&mut call.session, EndReason::UserEnded).await;
    assert!(drain(&mut call.updates).is_empty());
    assert!(call.gateway.transcripts().is_empty());
}

#[tokio::test]
async fn test_client_gone_while_connecting_is_a_disconnect() {
    let mut call = setup(CallConfig::default(), ConnectorMode::Hang, StaticIssuer::ok(), MediaMode::Grant);
    drop(call.commands_tx);

    let err = call
        .manager
        .start(&mut call.session, &mut call.media, &mut call.commands)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(call.session.end_reason(), Some(EndReason::ClientDisconnected));
    assert_eq!(call.session.status(), ConnectionStatus::Idle);
    assert!(call.gateway.transcripts().is_empty());
}

#[tokio::test]
async fn test_stop_while_waiting_for_media_cancels_the_call() {
    let mut call = setup(CallConfig::default(), ConnectorMode::Accept, StaticIssuer::ok(), MediaMode::Hang);
    call.commands_tx.send(CallCommand::Stop).await.unwrap();

    let err = call
        .manager
        .start(&mut call.session, &mut call.media, &mut call.commands)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(call.issuer.issued.load(Ordering::SeqCst), 0);
    assert_eq!(call.provider.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_tool_arguments_fall_back_and_keep_the_call_connected() {
    let mut call = default_call();
    start(&mut call).await;
    drain(&mut call.updates);
    let run = spawn_run(&mut call);

    call.provider.send_json(&json!({
        "type": "response.output_item.added",
        "response_id": "resp_1",
        "output_index": 0,
        "item": { "type": "function_call", "name": "render_family_tree", "call_id": "call_1", "arguments": "" }
    }));
    call.provider.send_json(&json!({
        "type": "response.function_call_arguments.delta",
        "response_id": "resp_1",
        "call_id": "call_1",
        "delta": "{\"mermaid\": "
    }));
    call.provider.send_json(&json!({
        "type": "response.function_call_arguments.done",
        "response_id": "resp_1",
        "call_id": "call_1",
        "arguments": "{\"mermaid\": "
    }));

    let output = call.provider.next_sent().await;
    assert_eq!(output["type"], "conversation.item.create");
    assert_eq!(output["item"]["type"], "function_call_output");
    assert_eq!(output["item"]["call_id"], "call_1");
    let payload: serde_json::Value = serde_json::from_str(output["item"]["output"].as_str().unwrap()).unwrap();
    assert_eq!(payload["error"]["type"], "tool_argument_error");
    let follow_up = call.provider.next_sent().await;
    assert_eq!(follow_up["type"], "response.create");

    let mut seen = Vec::new();
    wait_for(&mut call.updates, &mut seen, |u| matches!(u, CallUpdate::Relay(RelayEvent::Message { .. }))).await;
    seen.extend(drain(&mut call.updates));
    assert_eq!(message_texts(&seen), vec![DIAGRAM_FALLBACK_TEXT.to_string()]);
    assert!(statuses(&seen).is_empty());

    call.commands_tx.send(CallCommand::Stop).await.unwrap();
    let (session, _) = run.await.unwrap();
    assert_eq!(session.messages().len(), 1);
    assert!(session.messages()[0].diagram.is_none());
}

#[tokio::test]
async fn test_provider_frames_reach_the_client_verbatim() {
    let mut call = default_call();
    start(&mut call).await;
    drain(&mut call.updates);
    let run = spawn_run(&mut call);

    let raw = r#"{"type":"session.created","event_id":"evt_1","session":{"id":"sess_1"}}"#;
    call.provider.inbound.as_ref().unwrap().send(Frame::text(raw)).unwrap();

    let mut seen = Vec::new();
    wait_for(&mut call.updates, &mut seen, |u| matches!(u, CallUpdate::Provider(_))).await;
    assert_eq!(seen.last(), Some(&CallUpdate::Provider(Frame::text(raw))));

    let greeting = call.provider.next_sent().await;
    assert_eq!(greeting["type"], "response.create");
    assert_eq!(greeting["response"]["modalities"], json!(["audio", "text"]));

    call.commands_tx
        .send(CallCommand::Forward(Frame::text(r#"{"type":"input_audio_buffer.commit"}"#)))
        .await
        .unwrap();
    let forwarded = call.provider.next_sent().await;
    assert_eq!(forwarded, json!({ "type": "input_audio_buffer.commit" }));

    call.commands_tx.send(CallCommand::Stop).await.unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn test_microphone_and_assistant_audio_are_recorded() {
    use base64::Engine as _;
    let b64 = base64::engine::general_purpose::STANDARD;

    let mut call = default_call();
    start(&mut call).await;
    let run = spawn_run(&mut call);

    let pcm: Vec<u8> = (0..4800u16).flat_map(|i| (i % 100).to_le_bytes()).collect();
    call.commands_tx.send(CallCommand::Audio(Bytes::from(pcm.clone()))).await.unwrap();
    let append = call.provider.next_sent().await;
    assert_eq!(append["type"], "input_audio_buffer.append");
    assert_eq!(b64.decode(append["audio"].as_str().unwrap()).unwrap(), pcm);

    call.provider.send_json(&json!({
        "type": "response.audio.delta",
        "response_id": "resp_1",
        "delta": b64.encode([1u8, 0, 2, 0])
    }));
    let mut seen = Vec::new();
    wait_for(&mut call.updates, &mut seen, |u| matches!(u, CallUpdate::Provider(_))).await;

    call.commands_tx.send(CallCommand::Stop).await.unwrap();
    let (mut session, _) = run.await.unwrap();
    session.wait_persisted().await;

    let audio = call.gateway.audio();
    assert_eq!(audio.len(), 1);
    assert_eq!(audio[0].content_type, "audio/wav");
    assert_eq!(audio[0].duration, Duration::from_millis(200));
    assert!(call.gateway.transcripts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_provider_error_ends_the_call_after_the_grace_period() {
    let mut call = default_call();
    start(&mut call).await;
    drain(&mut call.updates);
    let run = spawn_run(&mut call);

    call.provider.send_json(&json!({
        "type": "error",
        "event_id": "evt_9",
        "error": { "type": "server_error", "message": "upstream exploded" }
    }));

    let (_, reason) = run.await.unwrap();
    assert_eq!(reason, EndReason::ProviderError);

    let updates = drain(&mut call.updates);
    assert_eq!(
        statuses(&updates),
        vec![ConnectionStatus::Error, ConnectionStatus::Disconnecting, ConnectionStatus::Idle]
    );
    assert!(updates.iter().any(|u| matches!(
        u,
        CallUpdate::Relay(RelayEvent::Failure { kind: ErrorKind::Connection, .. })
    )));
}

#[tokio::test]
async fn test_invalid_request_errors_are_only_noticed() {
    let mut call = default_call();
    start(&mut call).await;
    drain(&mut call.updates);
    let run = spawn_run(&mut call);

    call.provider.send_json(&json!({
        "type": "error",
        "error": { "type": "invalid_request_error", "message": "Unknown parameter" }
    }));
    let mut seen = Vec::new();
    wait_for(&mut call.updates, &mut seen, |u| matches!(u, CallUpdate::Relay(RelayEvent::Notice { .. }))).await;
    assert!(statuses(&seen).is_empty());

    call.commands_tx.send(CallCommand::Stop).await.unwrap();
    let (_, reason) = run.await.unwrap();
    assert_eq!(reason, EndReason::UserEnded);
}

#[tokio::test]
async fn test_credential_failure_is_a_retryable_connection_error() {
    let mut call = setup(CallConfig::default(), ConnectorMode::Accept, StaticIssuer::failing(), MediaMode::Grant);
    let err = call
        .manager
        .start(&mut call.session, &mut call.media, &mut call.commands)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(call.provider.connects.load(Ordering::SeqCst), 0);
    assert_eq!(call.media.releases.load(Ordering::SeqCst), 1);

    let updates = drain(&mut call.updates);
    assert_eq!(statuses(&updates), vec![ConnectionStatus::Connecting, ConnectionStatus::Error]);
    assert!(updates.iter().any(|u| matches!(
        u,
        CallUpdate::Relay(RelayEvent::Failure { retryable: true, .. })
    )));
}

#[tokio::test]
async fn test_denied_media_never_requests_a_credential() {
    let mut call = setup(CallConfig::default(), ConnectorMode::Accept, StaticIssuer::ok(), MediaMode::Deny);
    let err = call
        .manager
        .start(&mut call.session, &mut call.media, &mut call.commands)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MediaAccess);
    assert_eq!(call.issuer.issued.load(Ordering::SeqCst), 0);
    assert_eq!(call.provider.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_refused_handshake_surfaces_a_connection_error() {
    let mut call = setup(CallConfig::default(), ConnectorMode::Refuse, StaticIssuer::ok(), MediaMode::Grant);
    let err = call
        .manager
        .start(&mut call.session, &mut call.media, &mut call.commands)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(call.session.status(), ConnectionStatus::Error);
}

#[tokio::test]
async fn test_provider_hang_up_ends_the_call() {
    let mut call = default_call();
    start(&mut call).await;
    let run = spawn_run(&mut call);

    call.provider.hang_up();
    let (session, reason) = run.await.unwrap();
    assert_eq!(reason, EndReason::RemoteClosed);
    assert_eq!(session.status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn test_client_disconnect_ends_the_call() {
    let mut call = default_call();
    start(&mut call).await;
    let run = spawn_run(&mut call);

    drop(call.commands_tx);
    let (_, reason) = run.await.unwrap();
    assert_eq!(reason, EndReason::ClientDisconnected);
}

#[tokio::test]
async fn test_sessions_are_single_use() {
    let mut call = default_call();
    start(&mut call).await;
    call.manager.stop(&mut call.session, EndReason::UserEnded).await;
    let err = call
        .manager
        .start(&mut call.session, &mut call.media, &mut call.commands)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}
