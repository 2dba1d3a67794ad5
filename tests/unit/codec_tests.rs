//! NDJSON session codec and the stream reader built on it.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, FramedWrite};
use tokio_util::sync::CancellationToken;

use flowstate::models::message::{Payload, SessionMessage, SessionPayload};
use flowstate::models::session::Party;
use flowstate::transport::codec::{SessionCodec, MAX_FRAME_BYTES};
use flowstate::transport::stream::run_reader;
use flowstate::AppError;

fn data_from(sender: &str, sequence: u64, text: &str) -> SessionMessage {
    SessionMessage {
        sender: Party::new(sender),
        sender_session_id: None,
        recipient_session_id: None,
        sequence,
        payload: SessionPayload::Data {
            payload: Payload::text(text),
        },
    }
}

fn encoded(message: &SessionMessage) -> String {
    let mut codec = SessionCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(message.clone(), &mut buf).expect("encode");
    String::from_utf8(buf.to_vec()).expect("utf8")
}

#[test]
fn encoded_frame_is_one_json_line() {
    let line = encoded(&data_from("alice", 1, "hello"));
    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1);
    let value: serde_json::Value = serde_json::from_str(line.trim_end()).expect("valid json");
    assert_eq!(value["sender"], "alice");
    assert_eq!(value["sequence"], 1);
}

#[test]
fn partial_frame_waits_for_newline() {
    let message = data_from("alice", 1, "hello");
    let line = encoded(&message);
    let (head, tail) = line.split_at(line.len() / 2);

    let mut codec = SessionCodec::new();
    let mut buf = BytesMut::from(head);
    assert!(codec.decode(&mut buf).expect("partial decode").is_none());

    buf.extend_from_slice(tail.as_bytes());
    let decoded = codec.decode(&mut buf).expect("decode").expect("complete frame");
    assert_eq!(decoded, message);
}

#[test]
fn blank_lines_between_frames_are_skipped() {
    let first = data_from("alice", 1, "one");
    let second = data_from("alice", 2, "two");
    let raw = format!("\n  \n{}\n{}", encoded(&first), encoded(&second));

    let mut codec = SessionCodec::new();
    let mut buf = BytesMut::from(raw.as_str());
    assert_eq!(codec.decode(&mut buf).expect("decode"), Some(first));
    assert_eq!(codec.decode(&mut buf).expect("decode"), Some(second));
    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
}

#[test]
fn malformed_frame_is_a_codec_error() {
    let mut codec = SessionCodec::new();
    let mut buf = BytesMut::from("{\"sender\":\"alice\"}\n");
    let err = codec.decode(&mut buf).expect_err("missing fields");
    assert!(matches!(err, AppError::Codec(msg) if msg.starts_with("malformed frame")));
}

#[test]
fn oversized_frame_is_refused() {
    let mut codec = SessionCodec::new();
    let mut buf = BytesMut::from(vec![b'x'; MAX_FRAME_BYTES + 10].as_slice());
    let err = codec.decode(&mut buf).expect_err("frame too long");
    assert!(matches!(err, AppError::Codec(msg) if msg.contains("frame too long")));
}

#[tokio::test]
async fn reader_forwards_frames_and_drops_bad_ones() {
    let (client, server) = tokio::io::duplex(4096);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let reader = tokio::spawn(run_reader(Party::new("bob"), server, tx, cancel));

    let mut writer = client;
    writer.write_all(b"not json\n").await.expect("write garbage");
    writer
        .write_all(encoded(&data_from("mallory", 1, "spoofed")).as_bytes())
        .await
        .expect("write spoofed");
    writer
        .write_all(encoded(&data_from("bob", 1, "genuine")).as_bytes())
        .await
        .expect("write genuine");
    drop(writer);

    let received = rx.recv().await.expect("one frame forwarded");
    assert_eq!(received, data_from("bob", 1, "genuine"));
    reader.await.expect("join").expect("reader result");
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn reader_stops_on_cancel() {
    let (_client, server) = tokio::io::duplex(64);
    let (tx, _rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let reader = tokio::spawn(run_reader(Party::new("bob"), server, tx, cancel.clone()));

    cancel.cancel();
    reader.await.expect("join").expect("reader result");
}

/// Stream whose every read fails.
struct BrokenLink;

impl AsyncRead for BrokenLink {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "link lost")))
    }
}

#[tokio::test]
async fn reader_reports_io_failure() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let err = run_reader(Party::new("bob"), BrokenLink, tx, CancellationToken::new())
        .await
        .expect_err("read failure surfaces");
    assert!(matches!(err, AppError::Io(msg) if msg.contains("link lost")));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn framed_writer_output_is_readable() {
    let (client, server) = tokio::io::duplex(4096);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(run_reader(Party::new("alice"), server, tx, CancellationToken::new()));

    let mut framed = FramedWrite::new(client, SessionCodec::new());
    framed.send(data_from("alice", 1, "a")).await.expect("send");
    framed.send(data_from("alice", 2, "b")).await.expect("send");
    drop(framed);

    assert_eq!(rx.recv().await.expect("first").sequence, 1);
    assert_eq!(rx.recv().await.expect("second").sequence, 2);
    reader.await.expect("join").expect("reader result");
}
