//! Black-box scenario tests driving the public `Engine` API end to end:
//! real bytes over a `PairSplicer` pair standing in for the host and
//! controller endpoints, and a throwaway TCP listener standing in for the
//! loopback notification sink (§4.6), mirroring `spec.md` §8's S1-S6.
//!
//! Built the way `crates/ipico-core/tests/parser_compat.rs` and
//! `services/forwarder/tests/local_fanout.rs` drive their subjects: plain
//! `#[tokio::test]`s, no test framework beyond `tokio::time::timeout` to
//! keep a broken assertion from hanging the suite.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use zwave_interceptor::config::EngineConfig;
use zwave_interceptor::splice::PairSplicer;
use zwave_interceptor::Engine;

const T: Duration = Duration::from_secs(5);

/// A throwaway loopback sink that records every GET request line it
/// receives (minus headers) and immediately closes the connection, the
/// way a Lua control endpoint that only cares about the query string
/// would.
async fn spawn_fake_sink() -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { break };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match sock.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            });
        }
    });
    (port, rx)
}

async fn setup() -> (Engine<PairSplicer>, UnixStream, UnixStream, mpsc::UnboundedReceiver<String>) {
    let (port, rx) = spawn_fake_sink().await;
    let mut config = EngineConfig::default();
    config.http.port = port;

    let engine = Engine::new(PairSplicer::new(), config);
    engine.register("/dev/fake-zwave").await.expect("register");

    let host_std = engine.with_splicer(|s| s.take_host_test_stream()).await;
    let ctrl_std = engine.with_splicer(|s| s.take_controller_test_stream()).await;
    host_std.set_nonblocking(true).unwrap();
    ctrl_std.set_nonblocking(true).unwrap();
    let host = UnixStream::from_std(host_std).unwrap();
    let controller = UnixStream::from_std(ctrl_std).unwrap();

    (engine, host, controller, rx)
}

async fn read_some(stream: &mut UnixStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    let got = timeout(T, stream.read(&mut buf)).await.expect("timed out waiting for bytes").unwrap();
    buf.truncate(got);
    buf
}

async fn next_notification(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(T, rx.recv()).await.expect("timed out waiting for notification").expect("sink channel closed")
}

/// S1: no rules registered, bytes flow through byte-identical, zero
/// notifications.
#[tokio::test]
async fn s1_pure_passthrough() {
    let (engine, mut host, mut controller, mut rx) = setup().await;

    let frame = [0x01u8, 0x03, 0x00, 0x02, 0xFE];
    host.write_all(&frame).await.unwrap();
    let seen = read_some(&mut controller, frame.len()).await;
    assert_eq!(seen, frame);

    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "no notification expected for a ruleless stream"
    );

    engine.unregister(None).await.unwrap();
    engine.join_io_task().await;
}

/// S2: a receive-direction monitor rule passes the frame through
/// unmodified and reports exactly one `Monitor` notification with the
/// whole match as `C0`.
#[tokio::test]
async fn s2_simple_monitor() {
    let (engine, mut host, mut controller, mut rx) = setup().await;

    engine
        .monitor(5, "k1".into(), "^01 .. 00 04", false, 0, None, None, false)
        .await
        .unwrap();

    let frame = [0x01u8, 0x05, 0x00, 0x04, 0x00, 0x01, 0xFB];
    controller.write_all(&frame).await.unwrap();
    let seen = read_some(&mut host, frame.len()).await;
    assert_eq!(seen, frame);

    let get = next_notification(&mut rx).await;
    assert!(get.contains("action=Monitor"));
    assert!(get.contains("key=k1"));
    assert!(get.contains("DeviceNum=5"));
    assert!(get.contains("C0=01%2005%2000%2004%2000%2001%20FB"));

    engine.unregister(None).await.unwrap();
    engine.join_io_task().await;
}

/// S3: an intercept rule with a one-byte response swallows the host's
/// frame entirely, synthesizes an ACK back to the host, and is removed
/// after firing (`oneshot`).
#[tokio::test]
async fn s3_intercept_with_synthesized_ack() {
    let (engine, mut host, mut controller, mut rx) = setup().await;

    engine
        .intercept(1, "k".into(), ".. .. .. 13", true, 0, None, Some("06".into()), false)
        .await
        .unwrap();

    let frame = [0x01u8, 0x04, 0x00, 0x13, 0x05, 0xEB];
    host.write_all(&frame).await.unwrap();

    let seen = read_some(&mut host, 1).await;
    assert_eq!(seen, vec![0x06]);

    assert!(
        timeout(Duration::from_millis(300), controller.read(&mut [0u8; 16])).await.is_err(),
        "controller must not see the intercepted frame"
    );

    let get = next_notification(&mut rx).await;
    assert!(get.contains("action=Intercept"));
    assert!(get.contains("key=k"));

    engine.unregister(None).await.unwrap();
    engine.join_io_task().await;
}

/// S4: a multi-part response (ack then synthesized frame) is delivered in
/// lockstep with the host's own ACKs, the controller never sees any of it,
/// and the queued `Intercept` notification is released only once every
/// part has been acked (§8 universal property 7).
#[tokio::test]
async fn s4_multi_part_response_with_ack_swallow() {
    let (engine, mut host, mut controller, mut rx) = setup().await;

    engine
        .intercept(
            1,
            "k".into(),
            ".. .. .. 13",
            false,
            0,
            None,
            Some("06 XX 01 04 01 13 01 XX".into()),
            false,
        )
        .await
        .unwrap();

    let frame = [0x01u8, 0x04, 0x00, 0x13, 0x05, 0xEB];
    host.write_all(&frame).await.unwrap();

    // First part (the bare ACK) arrives immediately; the controller is
    // never woken.
    let first = read_some(&mut host, 1).await;
    assert_eq!(first, vec![0x06]);
    assert!(
        timeout(Duration::from_millis(300), controller.read(&mut [0u8; 16])).await.is_err(),
        "controller must not see any part of a swallowed-ack response"
    );
    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "notification must be held off until every part is acked"
    );

    // Host acks the first part; the second (synthesized frame) part is
    // released in response.
    host.write_all(&[0x06]).await.unwrap();
    let second = read_some(&mut host, 6).await;
    assert_eq!(second[0], 0x01);
    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "still one more ack outstanding"
    );

    // Host acks the second (last) part: holdoff releases and the queued
    // notification is finally delivered.
    host.write_all(&[0x06]).await.unwrap();
    let get = next_notification(&mut rx).await;
    assert!(get.contains("action=Intercept"));
    assert!(get.contains("key=k"));

    engine.unregister(None).await.unwrap();
    engine.join_io_task().await;
}

/// S5: the intercepting pattern never fires without a prior arm-pattern
/// match; once the controller sends the arm frame, the same host frame
/// fires and is reported.
#[tokio::test]
async fn s5_arm_then_fire() {
    let (engine, mut host, mut controller, mut rx) = setup().await;

    engine
        .intercept(1, "k".into(), "^01 .. 01 41", false, 0, Some("^01 .. 00 41"), None, false)
        .await
        .unwrap();

    let pattern_frame = [0x01u8, 0x03, 0x01, 0x41, 0xBE];
    host.write_all(&pattern_frame).await.unwrap();
    let seen = read_some(&mut controller, pattern_frame.len()).await;
    assert_eq!(seen, pattern_frame);
    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "pattern alone must not fire before the arm frame"
    );

    let arm_frame = [0x01u8, 0x03, 0x00, 0x41, 0xBF];
    controller.write_all(&arm_frame).await.unwrap();
    let echoed = read_some(&mut host, arm_frame.len()).await;
    assert_eq!(echoed, arm_frame);

    host.write_all(&pattern_frame).await.unwrap();
    let seen2 = read_some(&mut controller, pattern_frame.len()).await;
    assert_eq!(seen2, pattern_frame);

    let get = next_notification(&mut rx).await;
    assert!(get.contains("action=Intercept"));

    engine.unregister(None).await.unwrap();
    engine.join_io_task().await;
}

/// S6: a monitor rule with `forward=true` replaces the controller→host
/// byte stream with its response template, suppressing the original
/// frame.
#[tokio::test]
async fn s6_forward_rewrite() {
    let (engine, mut host, mut controller, _rx) = setup().await;

    engine
        .monitor(1, "k".into(), "^01", false, 0, None, Some("01 03 00 02 FE".into()), true)
        .await
        .unwrap();

    let original = [0x01u8, 0x05, 0x00, 0x04, 0x00, 0x01, 0xFB];
    controller.write_all(&original).await.unwrap();

    let seen = read_some(&mut host, 5).await;
    assert_eq!(seen, vec![0x01, 0x03, 0x00, 0x02, 0xFE]);

    engine.unregister(None).await.unwrap();
    engine.join_io_task().await;
}

/// S9: a silent rule (`*`-prefixed key) fires and injects bytes normally
/// but never reaches the notification sink.
#[tokio::test]
async fn s9_silent_rule_never_notifies() {
    let (engine, _host, mut controller, mut rx) = setup().await;

    engine
        .monitor(1, "*hidden".into(), "^01 .. 00 04", false, 0, None, None, false)
        .await
        .unwrap();

    let frame = [0x01u8, 0x05, 0x00, 0x04, 0x00, 0x01, 0xFB];
    controller.write_all(&frame).await.unwrap();

    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "silent rules must never enqueue a notification"
    );

    engine.unregister(None).await.unwrap();
    engine.join_io_task().await;
}

/// §8 universal property 8 / S-timeout: a rule that never matches is
/// removed on its own and reports exactly one `Timeout` notification.
#[tokio::test]
async fn timeout_rule_expires_and_notifies_once() {
    let (engine, _host, _controller, mut rx) = setup().await;

    engine
        .monitor(9, "k".into(), "^FF FF", false, 50, None, None, false)
        .await
        .unwrap();

    let get = next_notification(&mut rx).await;
    assert!(get.contains("action=Timeout"));
    assert!(get.contains("DeviceNum=9"));

    engine.unregister(None).await.unwrap();
    engine.join_io_task().await;
}

/// `register` with a mismatched `device_path` while already registered is
/// rejected; the matching path just bumps the refcount and requires a
/// matching number of `unregister` calls to fully tear down.
#[tokio::test]
async fn register_refcounts_and_rejects_mismatched_path() {
    let (port, _rx) = spawn_fake_sink().await;
    let mut config = EngineConfig::default();
    config.http.port = port;
    let engine = Engine::new(PairSplicer::new(), config);

    engine.register("/dev/fake-zwave").await.unwrap();
    engine.register("/dev/fake-zwave").await.unwrap();
    assert!(engine.register("/dev/other").await.is_err());

    engine.unregister(None).await.unwrap();
    // First unregister only drops the refcount from 2 to 1; rules/fd stay live.
    engine.unregister(None).await.unwrap();
    engine.join_io_task().await;
}
