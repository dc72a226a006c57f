mod common;

use std::time::Duration;

use serde_json::json;

use common::{header, next_matching, session, session_with, test_session_config, wait_until, AuthMode, TestRelay};
use relay_voice::audio::format::i16_to_bytes;
use relay_voice::audio::PcmFormat;
use relay_voice::codec::OpusEncoder;
use relay_voice::config::{OpusConfig, SessionConfig};
use relay_voice::constants::OPUS_FRAME_SAMPLES;
use relay_voice::error::{ConfigError, Error};
use relay_voice::network::{ConnectParams, LinkSignal, SessionEvent};
use relay_voice::protocol::{AudioPacket, RxAction};

fn voice_frame(freq_id: i32, sequence: u32) -> Vec<u8> {
    let mut encoder = OpusEncoder::voice(&OpusConfig::voice()).unwrap();
    let payload = encoder.encode(&[1_000i16; OPUS_FRAME_SAMPLES]).unwrap();
    AudioPacket::new(freq_id, sequence, payload).encode().to_vec()
}

#[tokio::test]
async fn test_connect_sends_auth_and_keeps_token() {
    let relay = TestRelay::start().await;
    let session = session();

    assert!(session.connect(relay.params()).await.unwrap());
    assert!(session.is_connected());
    assert_eq!(session.session_token().as_deref(), Some("token-1"));

    let auth = &relay.texts_of_type("auth")[0];
    assert_eq!(auth["discordUserId"], "user-1");
    assert_eq!(auth["guildId"], "guild-1");
    assert_eq!(auth["authToken"], "secret");
    assert!(auth.get("freqId").is_none());

    session.disconnect().await;
    assert!(!session.is_connected());
    assert!(session.session_token().is_none());
}

#[tokio::test]
async fn test_invalid_params_fail_before_io() {
    let relay = TestRelay::start().await;
    let session = session();

    let bad_port = ConnectParams {
        port: 0,
        ..relay.params()
    };
    assert!(matches!(
        session.connect(bad_port).await,
        Err(Error::Config(ConfigError::InvalidPort(0)))
    ));

    let no_host = ConnectParams {
        host: String::new(),
        ..relay.params()
    };
    assert!(matches!(
        session.connect(no_host).await,
        Err(Error::Config(ConfigError::EmptyHost))
    ));

    assert_eq!(relay.connections(), 0);
}

#[tokio::test]
async fn test_unreachable_relay_is_not_an_error() {
    let params = ConnectParams {
        host: "127.0.0.1".to_string(),
        port: 1,
        ..ConnectParams::default()
    };

    let session = session();
    assert!(!session.connect(params).await.unwrap());
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_auth_rejected() {
    let relay = TestRelay::start().await;
    relay.set_auth_mode(AuthMode::Reject("banned".to_string()));
    let session = session();
    let mut events = session.subscribe();

    assert!(!session.connect(relay.params()).await.unwrap());
    assert!(!session.is_connected());
    next_matching(&mut events, "auth failure status", |e| {
        *e == SessionEvent::Status("Auth failed: banned".to_string())
    })
    .await;
}

#[tokio::test]
async fn test_auth_timeout_tears_down_link() {
    let relay = TestRelay::start().await;
    relay.set_auth_mode(AuthMode::Ignore);
    let session = session();
    let mut events = session.subscribe();

    assert!(!session.connect(relay.params()).await.unwrap());
    next_matching(&mut events, "auth timeout status", |e| {
        matches!(e, SessionEvent::Status(text) if text.starts_with("Auth timeout"))
    })
    .await;
    wait_until("relay to see the socket close", || relay.open_connections() == 0).await;
}

#[tokio::test]
async fn test_join_and_mute_confirmations() {
    let relay = TestRelay::start().await;
    let session = session();
    let mut events = session.subscribe();
    session.connect(relay.params()).await.unwrap();

    assert!(session.join_frequency(42).await);
    assert_eq!(session.current_frequency(), Some(42));
    next_matching(&mut events, "join_ok", |e| {
        *e == SessionEvent::FrequencyJoined {
            freq_id: 42,
            listener_count: 2,
        }
    })
    .await;

    assert!(session.mute_frequency(42).await);
    next_matching(&mut events, "mute_ok", |e| {
        *e == SessionEvent::MuteConfirmed {
            freq_id: 42,
            muted: true,
        }
    })
    .await;

    let joined = session.joined_frequencies();
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].0, 42);
    assert_eq!(joined[0].1.listener_count, 2);
    assert!(joined[0].1.server_muted);
    // server mute does not touch local playback settings
    assert!(!session.frequency_settings().is_muted(42));

    assert!(session.leave_frequency(42).await);
    assert!(session.joined_frequencies().is_empty());
    wait_until("leave to reach the relay", || relay.texts_of_type("leave").len() == 1).await;
}

#[tokio::test]
async fn test_control_sends_fail_when_disconnected() {
    let session = session();
    assert!(!session.join_frequency(1).await);
    assert!(!session.mute_frequency(1).await);
    assert_eq!(session.current_frequency(), None);
}

#[tokio::test]
async fn test_rx_and_listener_events() {
    let relay = TestRelay::start().await;
    let session = session();
    let mut events = session.subscribe();
    session.connect(relay.params()).await.unwrap();

    relay.push_text(json!({
        "type": "rx", "discordUserId": "u-9", "username": "Nine", "freqId": 3, "action": "start"
    }));
    relay.push_text(json!({ "type": "rx", "discordUserId": "u-9", "freqId": 3, "action": "stop" }));
    relay.push_text(json!({ "type": "listener_update", "freqId": 3, "listenerCount": 5 }));

    let start = next_matching(&mut events, "rx start", |e| matches!(e, SessionEvent::RxStateChanged { .. })).await;
    assert_eq!(
        start,
        SessionEvent::RxStateChanged {
            user_id: "u-9".to_string(),
            display_name: "Nine".to_string(),
            freq_id: 3,
            action: RxAction::Start,
        }
    );
    let stop = next_matching(&mut events, "rx stop", |e| matches!(e, SessionEvent::RxStateChanged { .. })).await;
    assert_eq!(
        stop,
        SessionEvent::RxStateChanged {
            user_id: "u-9".to_string(),
            display_name: "u-9".to_string(),
            freq_id: 3,
            action: RxAction::Stop,
        }
    );
    next_matching(&mut events, "listener update", |e| {
        *e == SessionEvent::ListenerCount {
            freq_id: 3,
            listener_count: 5,
        }
    })
    .await;
}

#[tokio::test]
async fn test_malformed_control_does_not_stop_the_loop() {
    let relay = TestRelay::start().await;
    let session = session();
    let mut events = session.subscribe();
    session.connect(relay.params()).await.unwrap();

    relay.push_raw_text("{not json");
    relay.push_text(json!({ "type": "something_new", "x": 1 }));
    relay.push_text(json!({ "type": "error", "message": "slow down" }));

    next_matching(&mut events, "parse error status", |e| {
        matches!(e, SessionEvent::Status(text) if text.starts_with("WS parse error"))
    })
    .await;
    next_matching(&mut events, "server error", |e| {
        *e == SessionEvent::Error("slow down".to_string())
    })
    .await;
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_upload_is_framed_and_numbered() {
    let relay = TestRelay::start().await;
    let session = session();
    session.connect(relay.params()).await.unwrap();
    session.join_frequency(7).await;

    session.start_transmit().unwrap();
    let pcm = i16_to_bytes(&vec![500i16; OPUS_FRAME_SAMPLES * 3]);
    session.send_audio(&pcm, PcmFormat::wire());

    wait_until("three frames", || relay.audio().len() == 3).await;
    let headers: Vec<_> = relay.audio().iter().map(|f| header(f)).collect();
    assert_eq!(headers, vec![(7, 0), (7, 1), (7, 2)]);

    // A new transmission starts again at 0
    session.stop_transmit();
    session.start_transmit().unwrap();
    session.send_audio(&i16_to_bytes(&[0i16; OPUS_FRAME_SAMPLES]), PcmFormat::wire());
    wait_until("fourth frame", || relay.audio().len() == 4).await;
    assert_eq!(header(&relay.audio()[3]), (7, 0));

    let stats = session.stats();
    assert_eq!(stats.packets_queued, 4);
    assert_eq!(stats.packets_dropped, 0);
}

#[tokio::test]
async fn test_partial_frame_waits_and_stop_discards_it() {
    let relay = TestRelay::start().await;
    let session = session();
    session.connect(relay.params()).await.unwrap();
    session.start_transmit().unwrap();

    session.send_audio(&i16_to_bytes(&[1i16; 500]), PcmFormat::wire());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.audio().is_empty());

    session.send_audio(&i16_to_bytes(&[1i16; 460]), PcmFormat::wire());
    wait_until("completed frame", || relay.audio().len() == 1).await;

    // Leftover from a stopped transmission never leaks into the next one
    session.send_audio(&i16_to_bytes(&[1i16; 700]), PcmFormat::wire());
    session.stop_transmit();
    session.start_transmit().unwrap();
    session.send_audio(&i16_to_bytes(&[1i16; 300]), PcmFormat::wire());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.audio().len(), 1);
}

#[tokio::test]
async fn test_send_audio_requires_transmit() {
    let relay = TestRelay::start().await;
    let session = session();
    session.connect(relay.params()).await.unwrap();

    session.send_audio(&i16_to_bytes(&[1i16; OPUS_FRAME_SAMPLES * 2]), PcmFormat::wire());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.audio().is_empty());
    assert_eq!(session.stats().packets_queued, 0);
}

#[tokio::test]
async fn test_muted_inbound_audio_never_plays() {
    let relay = TestRelay::start().await;
    let session = session();
    session.connect(relay.params()).await.unwrap();
    session.frequency_settings().set_muted(5, true);

    relay.push_binary(voice_frame(5, 0));
    relay.push_binary(voice_frame(6, 0));

    wait_until("both frames", || {
        let stats = session.stats();
        stats.frames_muted + stats.frames_played == 2
    })
    .await;
    let stats = session.stats();
    assert_eq!(stats.frames_received, 2);
    assert_eq!(stats.frames_muted, 1);
    assert_eq!(stats.frames_played, 1);
    assert_eq!(session.playback_buffered(), OPUS_FRAME_SAMPLES * 2);
}

#[tokio::test]
async fn test_bad_inbound_frames_are_skipped() {
    let relay = TestRelay::start().await;
    let session = session();
    session.connect(relay.params()).await.unwrap();

    relay.push_binary(vec![0u8; 8]);
    relay.push_binary(vec![0, 0, 0, 1, 0, 0, 0, 0, 0xFF, 0x00]);
    relay.push_binary(voice_frame(1, 0));

    // the valid frame goes last, so once it has played the others are done
    wait_until("valid frame", || session.stats().frames_played == 1).await;
    let stats = session.stats();
    assert_eq!(stats.frames_received, 3);
    assert_eq!(stats.malformed_frames, 1);
    assert_eq!(stats.decode_errors, 1);
    assert_eq!(stats.frames_played, 1);
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let relay = TestRelay::start().await;
    let session = session();
    let mut events = session.subscribe();

    session.disconnect().await;
    session.connect(relay.params()).await.unwrap();
    session.start_transmit().unwrap();
    session.disconnect().await;
    session.disconnect().await;

    assert!(!session.is_connected());
    assert!(!session.is_transmitting());
    assert_eq!(session.playback_buffered(), 0);
    wait_until("relay to see the close", || relay.close_reasons() == vec!["bye".to_string()]).await;
    next_matching(&mut events, "disconnected status", |e| {
        *e == SessionEvent::Status("Disconnected".to_string())
    })
    .await;
}

#[tokio::test]
async fn test_server_drop_reports_lost() {
    let relay = TestRelay::start().await;
    let session = session();
    let mut signals = session.link_signals();
    session.connect(relay.params()).await.unwrap();
    next_matching(&mut signals, "established", |s| *s == LinkSignal::Established).await;

    relay.drop_connections();
    next_matching(&mut signals, "lost", |s| matches!(s, LinkSignal::Lost { .. })).await;
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_server_close_reports_lost() {
    let relay = TestRelay::start().await;
    let session = session();
    let mut signals = session.link_signals();
    let mut events = session.subscribe();
    session.connect(relay.params()).await.unwrap();

    relay.close_connections();
    next_matching(&mut signals, "lost", |s| matches!(s, LinkSignal::Lost { .. })).await;
    next_matching(&mut events, "closed status", |e| {
        *e == SessionEvent::Status("Server closed connection".to_string())
    })
    .await;
}

#[tokio::test]
async fn test_user_disconnect_is_not_a_drop() {
    let relay = TestRelay::start().await;
    let session = session();
    let mut signals = session.link_signals();
    session.connect(relay.params()).await.unwrap();
    session.disconnect().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    loop {
        match signals.try_recv() {
            Ok(LinkSignal::Lost { reason }) => panic!("unexpected drop: {}", reason),
            Ok(LinkSignal::Established) => continue,
            Err(_) => break,
        }
    }
}

fn heartbeat_config(self_reconnect: bool) -> SessionConfig {
    SessionConfig {
        heartbeat_interval_ms: 40,
        heartbeat_timeout_ms: 150,
        self_reconnect_on_heartbeat: self_reconnect,
        ..test_session_config()
    }
}

#[tokio::test]
async fn test_pongs_keep_the_link_alive() {
    let relay = TestRelay::start().await;
    let session = session_with(heartbeat_config(false));
    session.connect(relay.params()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(session.is_connected());
    assert!(relay.texts_of_type("ping").len() >= 3);
}

#[tokio::test]
async fn test_missing_pongs_report_lost() {
    let relay = TestRelay::start().await;
    relay.set_answer_pings(false);
    let session = session_with(heartbeat_config(false));
    let mut signals = session.link_signals();
    session.connect(relay.params()).await.unwrap();

    let lost = next_matching(&mut signals, "heartbeat loss", |s| matches!(s, LinkSignal::Lost { .. })).await;
    assert_eq!(
        lost,
        LinkSignal::Lost {
            reason: "heartbeat timeout".to_string()
        }
    );
    assert!(!session.is_connected());
    // Without self-reconnect the session stays down
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relay.auths(), 1);
}

#[tokio::test]
async fn test_heartbeat_self_reconnect() {
    let relay = TestRelay::start().await;
    relay.set_answer_pings(false);
    let session = session_with(heartbeat_config(true));
    session.connect(relay.params()).await.unwrap();

    wait_until("a second auth", || relay.auths() >= 2).await;
    relay.set_answer_pings(true);
    wait_until("session to come back", || session.is_connected()).await;
    session.disconnect().await;
}
