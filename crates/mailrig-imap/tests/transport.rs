//! End-to-end transport tests over an in-memory duplex pipe.
//!
//! Each test plays the server side by hand: it reads what the client put on
//! the wire and writes raw response bytes back.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use mailrig_imap::{
    Client, Config, EnqueueOptions, Error, Event, Events, Request, Value,
};

fn connect() -> (Client, Events, DuplexStream) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let (client, events) = Client::from_stream(near, Config::builder("localhost").build());
    (client, events, far)
}

async fn greet(events: &mut Events, server: &mut DuplexStream) {
    server.write_all(b"* OK ready\r\n").await.unwrap();
    assert!(matches!(events.next().await, Some(Event::Ready)));
}

/// Reads one CRLF-terminated line of client output.
async fn read_line(server: &mut DuplexStream) -> Vec<u8> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        server.read_exact(&mut byte).await.unwrap();
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            return line;
        }
    }
}

#[tokio::test]
async fn greeting_arrives_chunked() {
    let (_client, mut events, mut server) = connect();

    server
        .write_all(b"* OK [CAPABILITY IMAP4rev1 LIT")
        .await
        .unwrap();
    server.write_all(b"ERAL+] ready\r\n").await.unwrap();

    assert!(matches!(events.next().await, Some(Event::Ready)));
}

#[tokio::test]
async fn literal_framing_preserves_bytes() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    let pending = client.enqueue(
        Request::new("FETCH")
            .attr(Value::Number(1))
            .attr(Value::atom("BODY[]")),
        &["FETCH"],
    );
    assert_eq!(read_line(&mut server).await, b"W1 FETCH 1 BODY[]\r\n");

    // Split right after the literal announcement.
    server.write_all(b"* 1 FETCH (BODY[] {5}\r\n").await.unwrap();
    server.write_all(b"hello)\r\nW1 OK done\r\n").await.unwrap();

    let response = pending.await.unwrap();
    let fetched = &response.payload["FETCH"];
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].nr, Some(1));
    assert_eq!(fetched[0].command, "FETCH");
    assert_eq!(
        fetched[0].attributes,
        vec![Value::List(vec![
            Value::atom("BODY[]"),
            Value::literal(&b"hello"[..]),
        ])]
    );
}

#[tokio::test]
async fn tag_correlation_attaches_payload() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    let pending = client.enqueue(Request::new("CAPABILITY"), &["CAPABILITY"]);
    assert_eq!(read_line(&mut server).await, b"W1 CAPABILITY\r\n");

    server
        .write_all(b"* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\nW1 OK done\r\n")
        .await
        .unwrap();

    let response = pending.await.unwrap();
    assert_eq!(response.human_readable.as_deref(), Some("done"));
    assert_eq!(response.payload["CAPABILITY"].len(), 1);
    assert_eq!(
        response.payload["CAPABILITY"][0].attributes,
        vec![Value::atom("IMAP4rev1"), Value::atom("AUTH=PLAIN")]
    );
}

#[tokio::test]
async fn continuation_drives_multi_chunk_send() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    let pending = client.enqueue(
        Request::new("LOGIN")
            .attr(Value::atom("user"))
            .attr(Value::literal(&b"pass"[..])),
        &[],
    );

    // The announcement chunk goes out bare; nothing more until the prompt.
    assert_eq!(read_line(&mut server).await, b"W1 LOGIN user {4}\r\n");

    server.write_all(b"+ go\r\n").await.unwrap();
    assert_eq!(read_line(&mut server).await, b"pass\r\n");

    server.write_all(b"W1 OK welcome\r\n").await.unwrap();
    assert!(pending.await.is_ok());
}

#[tokio::test]
async fn failure_maps_message_and_code() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    let pending = client.enqueue(
        Request::new("SELECT").attr(Value::atom("nope")),
        &[],
    );
    assert_eq!(read_line(&mut server).await, b"W1 SELECT nope\r\n");

    server.write_all(b"W1 NO [ALERT] bad mailbox\r\n").await.unwrap();

    match pending.await {
        Err(Error::No { message, code }) => {
            assert_eq!(message, "bad mailbox");
            assert_eq!(code.unwrap().name, "ALERT");
        }
        other => panic!("expected NO error, got {other:?}"),
    }
}

#[tokio::test]
async fn bad_completion_is_an_error_too() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    let pending = client.enqueue(Request::new("BOGUS"), &[]);
    read_line(&mut server).await;
    server.write_all(b"W1 BAD unknown command\r\n").await.unwrap();

    assert!(matches!(pending.await, Err(Error::Bad { message, .. }) if message == "unknown command"));
}

#[tokio::test]
async fn precheck_inserts_priority_command_first() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    let options = EnqueueOptions {
        precheck: Some(Box::new(|ctx| {
            Box::pin(async move {
                // The preparatory command jumps ahead of the checked one.
                let _ = ctx.enqueue_before(
                    Request::new("SELECT").attr(Value::Quoted("INBOX".to_string())),
                    &[],
                );
                Ok(())
            })
        })),
        ..EnqueueOptions::default()
    };
    let pending = client.enqueue_with(Request::new("FETCH"), &[], options);

    // The priority command is dispatched first, both tags suffixed.
    assert_eq!(read_line(&mut server).await, b"W2.p SELECT \"INBOX\"\r\n");
    server.write_all(b"W2.p OK selected\r\n").await.unwrap();

    assert_eq!(read_line(&mut server).await, b"W1.p FETCH\r\n");
    server.write_all(b"W1.p OK fetched\r\n").await.unwrap();

    let response = pending.await.unwrap();
    assert_eq!(response.human_readable.as_deref(), Some("fetched"));
}

#[tokio::test]
async fn precheck_failure_rejects_only_its_command() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    let options = EnqueueOptions {
        precheck: Some(Box::new(|_ctx| {
            Box::pin(async { Err(Error::InvalidState("no mailbox".to_string())) })
        })),
        ..EnqueueOptions::default()
    };
    let doomed = client.enqueue_with(Request::new("FETCH"), &[], options);
    let healthy = client.enqueue(Request::new("NOOP"), &[]);

    assert!(matches!(doomed.await, Err(Error::InvalidState(_))));

    // The queue moves on to the untouched command.
    assert_eq!(read_line(&mut server).await, b"W2 NOOP\r\n");
    server.write_all(b"W2 OK done\r\n").await.unwrap();
    assert!(healthy.await.is_ok());
}

#[tokio::test]
async fn untagged_handler_sees_unclaimed_responses() {
    let (client, mut events, mut server) = connect();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client.set_handler("EXISTS", move |response| {
        sink.lock().unwrap().push(response.nr);
    });

    greet(&mut events, &mut server).await;

    // Unsolicited while nothing is in flight.
    server.write_all(b"* 12 EXISTS\r\n").await.unwrap();

    // And again while a command that does not claim EXISTS is in flight.
    let pending = client.enqueue(Request::new("NOOP"), &[]);
    read_line(&mut server).await;
    server.write_all(b"* 13 EXISTS\r\nW1 OK done\r\n").await.unwrap();
    pending.await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Some(12), Some(13)]);
}

#[tokio::test(start_paused = true)]
async fn commands_wait_for_the_greeting() {
    let (client, _events, mut server) = connect();

    let _pending = client.enqueue(Request::new("NOOP"), &[]);

    // Nothing hits the wire before the first server response.
    let early = tokio::time::timeout(Duration::from_millis(50), read_line(&mut server)).await;
    assert!(early.is_err());

    server.write_all(b"* OK ready\r\n").await.unwrap();
    assert_eq!(read_line(&mut server).await, b"W1 NOOP\r\n");
}

#[tokio::test(start_paused = true)]
async fn idle_event_fires_when_queue_stays_empty() {
    let (_client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    assert!(matches!(events.next().await, Some(Event::Idle)));
}

#[tokio::test(start_paused = true)]
async fn missing_response_is_fatal_timeout() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    let pending = client.enqueue(Request::new("NOOP"), &[]);
    assert_eq!(read_line(&mut server).await, b"W1 NOOP\r\n");

    // No reply: the size-scaled response timeout expires.
    assert!(matches!(pending.await, Err(Error::Closed)));
    loop {
        match events.next().await {
            Some(Event::Fatal(Error::Timeout(_))) => break,
            Some(Event::Idle) => {}
            other => panic!("expected fatal timeout, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn close_rejects_outstanding_commands() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    let pending = client.enqueue(Request::new("NOOP"), &[]);
    read_line(&mut server).await;

    client.close().await;
    assert!(matches!(pending.await, Err(Error::Closed)));

    // Idempotent.
    client.close().await;
}

#[tokio::test]
async fn logout_waits_for_server_close() {
    let (client, mut events, server) = connect();
    let mut server = server;
    greet(&mut events, &mut server).await;

    let (result, ()) = tokio::join!(client.logout(), async move {
        assert_eq!(read_line(&mut server).await, b"W1 LOGOUT\r\n");
        server
            .write_all(b"* BYE logging out\r\nW1 OK bye\r\n")
            .await
            .unwrap();
        // Server closes the socket; dropping the far end delivers EOF.
        drop(server);
    });
    assert!(result.is_ok());
}

#[tokio::test]
async fn unexpected_eof_is_fatal() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    let pending = client.enqueue(Request::new("NOOP"), &[]);
    read_line(&mut server).await;
    drop(server);

    assert!(matches!(pending.await, Err(Error::Closed)));
    loop {
        match events.next().await {
            Some(Event::Fatal(Error::Io(_))) => break,
            Some(Event::Idle) => {}
            other => panic!("expected fatal I/O error, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn upgrade_is_rejected_on_plain_pipe() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    assert!(client.upgrade().await.is_err());
}

// === COMPRESS=DEFLATE ===

fn deflate_all(compress: &mut flate2::Compress, input: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    let mut consumed = 0;
    loop {
        let before_in = compress.total_in();
        let before_out = compress.total_out();
        compress
            .compress(&input[consumed..], &mut buf, flate2::FlushCompress::Sync)
            .unwrap();
        let used = usize::try_from(compress.total_in() - before_in).unwrap();
        let produced = usize::try_from(compress.total_out() - before_out).unwrap();
        consumed += used;
        out.extend_from_slice(&buf[..produced]);
        if used == 0 && produced == 0 {
            break;
        }
        if consumed == input.len() && produced < buf.len() {
            break;
        }
    }
    out
}

fn inflate_all(decompress: &mut flate2::Decompress, input: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    let mut consumed = 0;
    loop {
        let before_in = decompress.total_in();
        let before_out = decompress.total_out();
        decompress
            .decompress(&input[consumed..], &mut buf, flate2::FlushDecompress::None)
            .unwrap();
        let used = usize::try_from(decompress.total_in() - before_in).unwrap();
        let produced = usize::try_from(decompress.total_out() - before_out).unwrap();
        consumed += used;
        out.extend_from_slice(&buf[..produced]);
        if used == 0 && produced == 0 {
            break;
        }
        if consumed == input.len() && produced < buf.len() {
            break;
        }
    }
    out
}

async fn compressed_round_trip(client: &Client, server: &mut DuplexStream) {
    let mut deflater = flate2::Compress::new(flate2::Compression::default(), false);
    let mut inflater = flate2::Decompress::new(false);

    let pending = client.enqueue(Request::new("NOOP"), &[]);

    // Inflate what the client sends until a full line is restored.
    let mut cleartext = Vec::new();
    let mut buf = [0u8; 4096];
    while !cleartext.ends_with(b"\r\n") {
        let n = server.read(&mut buf).await.unwrap();
        assert!(n > 0, "pipe closed mid-command");
        cleartext.extend(inflate_all(&mut inflater, &buf[..n]));
    }
    assert_eq!(cleartext, b"W1 NOOP\r\n");

    // Reply compressed.
    let reply = deflate_all(&mut deflater, b"W1 OK done\r\n");
    server.write_all(&reply).await.unwrap();

    let response = pending.await.unwrap();
    assert_eq!(response.human_readable.as_deref(), Some("done"));
}

#[tokio::test]
async fn compression_splice_is_transparent() {
    let (client, mut events, mut server) = connect();
    greet(&mut events, &mut server).await;

    client.enable_compression().await.unwrap();
    // Double activation is refused.
    assert!(client.enable_compression().await.is_err());

    compressed_round_trip(&client, &mut server).await;
}

#[tokio::test]
async fn compression_offload_worker_behaves_identically() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let config = Config::builder("localhost").compression_offload(true).build();
    let (client, mut events) = Client::from_stream(near, config);
    let mut server = far;
    greet(&mut events, &mut server).await;

    client.enable_compression().await.unwrap();
    compressed_round_trip(&client, &mut server).await;
}
