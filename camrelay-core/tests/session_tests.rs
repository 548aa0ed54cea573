//! Integration tests for the streaming session

mod mocks;

use std::sync::Arc;
use std::time::Duration;

use camrelay_core::capture::DeliveryKind;
use camrelay_core::config::DeliveryPreference;
use camrelay_core::output::ControlMessage;
use camrelay_core::{
    CamrelayError, Endpoint, FacingMode, Session, SessionConfig, SessionState, SourceDescriptor,
};
use mocks::{
    payload_id, wait_until, EncoderEvent, FakeSourceProvider, RecordingConnector,
    ScriptedEncoderProvider, Sent,
};
use tokio_test::{assert_err, assert_ok};

const TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> SessionConfig {
    SessionConfig::new(Endpoint::new("localhost:8080", false))
}

fn session(
    config: SessionConfig,
    sources: &FakeSourceProvider,
    encoders: &ScriptedEncoderProvider,
    connector: &RecordingConnector,
) -> Session {
    Session::new(
        config,
        Arc::new(sources.clone()),
        Arc::new(encoders.clone()),
        Arc::new(connector.clone()),
    )
}

/// Encoder that rejects the top rung of the default ladder
fn without_level_40() -> ScriptedEncoderProvider {
    ScriptedEncoderProvider::new(|c| Ok(c.codec != "avc1.420028"))
}

#[tokio::test]
async fn test_start_negotiates_and_streams() {
    let sources = FakeSourceProvider::new();
    let encoders = without_level_40();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    assert_ok!(session.start(SourceDescriptor::front(1280, 720)).await);
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.delivery(), Some(DeliveryKind::Pull));

    let candidate = session.active_candidate().unwrap();
    assert_eq!(candidate.codec, "avc1.42001f");
    assert_eq!((candidate.width, candidate.height), (1280, 720));

    assert_eq!(sources.feeder().push(10).await, 10);
    wait_until(TIMEOUT, || connector.packets().len() == 10).await;

    let sent = connector.sent();
    assert_eq!(
        sent[0],
        Sent::Control(ControlMessage::Metadata {
            width: 1280,
            height: 720
        })
    );
    match &sent[1] {
        Sent::Control(ControlMessage::VideoConfig {
            codec,
            width,
            height,
            description,
        }) => {
            assert_eq!(codec, "avc1.42001f");
            assert_eq!((*width, *height), (1280, 720));
            assert_eq!(description.as_slice(), &encoders.description()[..]);
        }
        other => panic!("expected VideoConfig, got {:?}", other),
    }
    assert!(sent[2..].iter().all(|s| matches!(s, Sent::Packet(_))));

    assert_eq!(session.frames_fed(), 10);
    assert_eq!(session.chunks_produced(), 10);
    assert_eq!(connector.connects(), 1);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconfigure_reuses_channel() {
    let sources = FakeSourceProvider::new();
    let encoders = without_level_40();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();
    let first_feeder = sources.feeder();
    first_feeder.push(5).await;
    wait_until(TIMEOUT, || connector.packets().len() == 5).await;
    let probes_before = encoders.probes().len();

    session
        .reconfigure(SourceDescriptor::rear(640, 360))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.descriptor(), Some(SourceDescriptor::rear(640, 360)));
    assert!(first_feeder.is_closed());
    assert_eq!(sources.stopped(), 1);

    // Old encoder drained before the new one starts
    let events = encoders.events();
    assert!(events.contains(&EncoderEvent::Flushed { instance: 0 }));
    assert!(events.contains(&EncoderEvent::Closed { instance: 0 }));
    assert_eq!(encoders.open_instances(), 1);

    // Ladder renegotiated from the top, at the new size
    let probes = &encoders.probes()[probes_before..];
    assert_eq!((probes[0].width, probes[0].height), (640, 360));
    assert_eq!(probes[0].codec, "avc1.420028");

    sources.feeder().push(5).await;
    wait_until(TIMEOUT, || connector.packets().len() == 10).await;

    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.metadata(), vec![(1280, 720), (640, 360)]);
    assert_eq!(connector.video_configs().len(), 2);

    // Everything from the old encoder precedes the new description
    let sent = connector.sent();
    let second_config = sent
        .iter()
        .rposition(|s| matches!(s, Sent::Control(ControlMessage::VideoConfig { .. })))
        .unwrap();
    for (i, s) in sent.iter().enumerate() {
        if let Sent::Packet(p) = s {
            let (instance, _) = payload_id(p);
            assert_eq!(instance == 0, i < second_config);
        }
    }

    // Counters keep counting across reconfiguration
    assert_eq!(session.frames_fed(), 10);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_closed_channel_drops_output_but_keeps_feeding() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();
    sources.feeder().push(3).await;
    wait_until(TIMEOUT, || connector.packets().len() == 3).await;

    connector.close_remote();
    assert!(!session.channel_open());

    let frames_before = session.frames_fed();
    sources.feeder().push(100).await;
    wait_until(TIMEOUT, || session.frames_fed() == frames_before + 100).await;
    wait_until(TIMEOUT, || session.chunks_produced() == 103).await;

    assert_eq!(connector.packets().len(), 3);
    assert!(!session.feed_finished());
    assert_eq!(session.state(), SessionState::Streaming);
    assert!(session.stats().packets_dropped > 0);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconfigure_reconnects_closed_channel() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();
    connector.close_remote();
    assert!(!session.channel_open());

    session
        .reconfigure(SourceDescriptor::rear(640, 360))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Streaming);
    assert!(session.channel_open());
    assert_eq!(connector.connects(), 2);

    sources.feeder().push(5).await;
    wait_until(TIMEOUT, || connector.packets().len() == 5).await;
    assert_eq!(connector.metadata().last(), Some(&(640, 360)));
    assert_eq!(connector.video_configs().len(), 1);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconfigure_fails_when_reconnect_is_refused() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();
    connector.close_remote();
    connector.set_refusing(true);

    let err = assert_err!(session.reconfigure(SourceDescriptor::rear(640, 360)).await);
    assert!(matches!(err, CamrelayError::ChannelError(_)));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(connector.connects(), 2);
    // Old and new camera both released, no encoder left open
    assert_eq!(sources.stopped(), 2);
    assert_eq!(encoders.open_instances(), 0);

    session.stop().await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_stop_releases_everything_and_is_idempotent() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();
    sources.feeder().push(20).await;
    wait_until(TIMEOUT, || session.frames_fed() == 20).await;

    assert_ok!(session.stop().await);
    assert_ok!(session.stop().await);

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.descriptor(), None);
    assert!(!session.channel_open());
    assert!(!connector.is_open());
    assert_eq!(sources.stopped(), 1);
    assert_eq!(sources.outstanding_frames(), 0);
    assert_eq!(encoders.open_instances(), 0);
    assert!(encoders
        .events()
        .contains(&EncoderEvent::Flushed { instance: 0 }));
}

#[tokio::test]
async fn test_stop_when_idle_is_noop() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    assert_ok!(session.stop().await);
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_keyframes_follow_cumulative_frame_count() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();
    sources.feeder().push(130).await;
    wait_until(TIMEOUT, || encoders.keyframe_flags().len() == 130).await;

    let forced: Vec<usize> = encoders
        .keyframe_flags()
        .iter()
        .enumerate()
        .filter_map(|(i, k)| k.then_some(i))
        .collect();
    assert_eq!(forced, vec![0, 60, 120]);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_custom_keyframe_interval() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(
        config().with_keyframe_interval(10),
        &sources,
        &encoders,
        &connector,
    );

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();
    sources.feeder().push(25).await;
    wait_until(TIMEOUT, || encoders.keyframe_flags().len() == 25).await;

    let forced: Vec<usize> = encoders
        .keyframe_flags()
        .iter()
        .enumerate()
        .filter_map(|(i, k)| k.then_some(i))
        .collect();
    assert_eq!(forced, vec![0, 10, 20]);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_encode_failure_skips_frame() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();

    encoders.set_fail_encode(true);
    sources.feeder().push(10).await;
    wait_until(TIMEOUT, || session.frames_fed() == 10).await;
    assert!(connector.packets().is_empty());
    assert_eq!(sources.outstanding_frames(), 0);

    encoders.set_fail_encode(false);
    sources.feeder().push(5).await;
    wait_until(TIMEOUT, || connector.packets().len() == 5).await;
    assert_eq!(session.state(), SessionState::Streaming);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_camera_fails_start() {
    let sources = FakeSourceProvider::new().with_facings(vec![FacingMode::User]);
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    let err = assert_err!(session.start(SourceDescriptor::rear(1280, 720)).await);
    assert!(matches!(err, CamrelayError::SourceUnavailable(_)));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(connector.connects(), 0);

    // Only stop leaves the failed state
    let err = assert_err!(session.start(SourceDescriptor::front(1280, 720)).await);
    assert!(matches!(err, CamrelayError::InvalidState(_)));

    session.stop().await.unwrap();
    assert_ok!(session.start(SourceDescriptor::front(1280, 720)).await);
    assert_eq!(session.state(), SessionState::Streaming);
    session.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_fails_start() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::hanging();
    let mut session = session(
        config().with_handshake_timeout(Duration::from_secs(3)),
        &sources,
        &encoders,
        &connector,
    );

    let err = assert_err!(session.start(SourceDescriptor::front(1280, 720)).await);
    assert!(matches!(err, CamrelayError::HandshakeTimeout(_)));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(sources.stopped(), 1);
    assert!(encoders.probes().is_empty());
}

#[tokio::test]
async fn test_refused_connection_fails_start() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::refusing();
    let mut session = session(config(), &sources, &encoders, &connector);

    let err = assert_err!(session.start(SourceDescriptor::front(1280, 720)).await);
    assert!(matches!(err, CamrelayError::ChannelError(_)));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(sources.stopped(), 1);
}

#[tokio::test]
async fn test_no_usable_encoder_fails_start() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::new(|_| Ok(false));
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    let err = assert_err!(session.start(SourceDescriptor::front(1280, 720)).await);
    assert!(matches!(err, CamrelayError::EncoderUnavailable { tried: 4 }));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(sources.stopped(), 1);
    assert!(!connector.is_open());
    assert_eq!(encoders.open_instances(), 0);
}

#[tokio::test]
async fn test_reconfigure_requires_streaming() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    let err = assert_err!(session.reconfigure(SourceDescriptor::rear(640, 360)).await);
    assert!(matches!(err, CamrelayError::InvalidState(_)));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_failed_reconfigure_keeps_channel_until_stop() {
    let sources = FakeSourceProvider::new().with_facings(vec![FacingMode::User]);
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();

    let err = assert_err!(session.reconfigure(SourceDescriptor::rear(640, 360)).await);
    assert!(matches!(err, CamrelayError::SourceUnavailable(_)));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.channel_open());
    assert_eq!(encoders.open_instances(), 0);

    session.stop().await.unwrap();
    assert!(!connector.is_open());
}

#[tokio::test]
async fn test_start_while_streaming_restarts_on_same_channel() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();
    sources.feeder().push(4).await;
    wait_until(TIMEOUT, || session.frames_fed() == 4).await;

    session
        .start(SourceDescriptor::rear(1280, 720))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.frames_fed(), 0);
    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.metadata().len(), 2);
    assert_eq!(encoders.open_instances(), 1);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_poll_delivery_without_frame_events() {
    let sources = FakeSourceProvider::new().without_frame_events();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();
    assert_eq!(session.delivery(), Some(DeliveryKind::Poll));

    wait_until(TIMEOUT, || connector.packets().len() >= 5).await;
    assert_eq!(session.stats().delivery, Some(DeliveryKind::Poll));

    session.stop().await.unwrap();
    assert_eq!(sources.outstanding_frames(), 0);
}

#[tokio::test]
async fn test_poll_preference_overrides_frame_events() {
    let sources = FakeSourceProvider::new();
    let encoders = ScriptedEncoderProvider::accept_all();
    let connector = RecordingConnector::new();
    let mut session = session(
        config().with_delivery(DeliveryPreference::Poll),
        &sources,
        &encoders,
        &connector,
    );

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();
    assert_eq!(session.delivery(), Some(DeliveryKind::Poll));

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_stats_report_active_encoder() {
    let sources = FakeSourceProvider::new();
    let encoders = without_level_40();
    let connector = RecordingConnector::new();
    let mut session = session(config(), &sources, &encoders, &connector);

    session
        .start(SourceDescriptor::front(1280, 720))
        .await
        .unwrap();
    sources.feeder().push(6).await;
    wait_until(TIMEOUT, || connector.packets().len() == 6).await;

    let stats = session.stats();
    assert_eq!(stats.state, SessionState::Streaming);
    assert_eq!(stats.codec.as_deref(), Some("avc1.42001f"));
    assert_eq!(stats.frames, 6);
    assert_eq!(stats.chunks, 6);
    // Metadata, VideoConfig and six packets
    wait_until(TIMEOUT, || session.stats().packets_sent == 8).await;
    assert!(stats.to_string().starts_with("FPS: "));

    session.stop().await.unwrap();
}
