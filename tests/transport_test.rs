// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use stonewire::{
    AppError, AppResult, EncryptionMode, EncryptionState, InboundMessage, Listener, RsaKeyPair,
    SessionStatus, Transport, TransportConfig, TransportEvent,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

fn test_keys() -> Arc<RsaKeyPair> {
    static KEYS: OnceLock<Arc<RsaKeyPair>> = OnceLock::new();
    KEYS.get_or_init(|| Arc::new(RsaKeyPair::generate(1024).unwrap()))
        .clone()
}

fn config(mode: EncryptionMode) -> TransportConfig {
    let mut config = TransportConfig::default();
    config.network.port = 0;
    config.network.reply_timeout_ms = 2000;
    config.request_handler_pool.num_channels = 2;
    config.pools.session.min = 2;
    config.pools.receive_buffer.min = 2;
    config.pools.io_context.min = 2;
    config.encryption.mode = mode;
    config.encryption.rsa_key_bits = 1024;
    config
}

async fn sum_handler(message: Arc<InboundMessage>) -> AppResult<()> {
    let text = String::from_utf8_lossy(message.payload()).to_string();
    let (a, b) = text
        .split_once(',')
        .ok_or_else(|| AppError::HandlerError(text.clone()))?;
    let sum: i64 = a.parse::<i64>().unwrap() + b.parse::<i64>().unwrap();
    message.reply(sum.to_string()).await
}

async fn start_server(config: TransportConfig) -> (Transport, Listener, SocketAddr) {
    let addr = config.network.listen_address().unwrap();
    let server = Transport::with_keys(config, test_keys()).unwrap();
    let listener = server.listen(addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    (server, listener, addr)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..150 {
        if check() {
            return;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn sum_request_gets_its_reply() {
    let (server, listener, addr) = start_server(config(EncryptionMode::Disabled)).await;
    server.on_data(sum_handler);

    let client = Transport::new(config(EncryptionMode::Disabled)).unwrap();
    let session = client.connect(addr).await.unwrap();
    assert_eq!(session.encryption_state(), EncryptionState::Plain);

    let reply = session.request("17,25").await.unwrap();
    assert_eq!(&reply[..], b"42");
    assert_eq!(session.pending_replies(), 0);

    eventually("server session", || server.session_count() == 1).await;
    client.close_session(&session).await;
    eventually("server side close", || server.session_count() == 0).await;
    assert_eq!(server.live_connections(), 0);
    listener.stop().await;
}

#[tokio::test]
async fn second_connection_is_rejected_after_admission_timeout() {
    let mut server_config = config(EncryptionMode::Disabled);
    server_config.network.max_connection = 1;
    server_config.network.admission_timeout_ms = 200;
    let (server, listener, addr) = start_server(server_config).await;
    let (rejected_tx, mut rejected_rx) = mpsc::unbounded_channel();
    server.subscribe(move |event| {
        if let TransportEvent::AdmissionRejected { remote } = event {
            let _ = rejected_tx.send(*remote);
        }
    });

    let client = Transport::new(config(EncryptionMode::Disabled)).unwrap();
    let first = client.connect(addr).await.unwrap();
    eventually("first admitted", || server.live_connections() == 1).await;

    let started = Instant::now();
    let second = client.connect(addr).await.unwrap();
    time::timeout(Duration::from_secs(3), second.closed())
        .await
        .expect("rejected connection was not closed");
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(second.status(), SessionStatus::Closed);
    assert!(rejected_rx.recv().await.is_some());

    assert!(first.is_running());
    assert_eq!(server.live_connections(), 1);

    // the slot frees up once the first connection goes away
    client.close_session(&first).await;
    eventually("slot released", || server.live_connections() == 0).await;
    let third = client.connect(addr).await.unwrap();
    eventually("third admitted", || server.session_count() == 1).await;
    assert!(third.is_running());
    listener.stop().await;
}

#[tokio::test]
async fn required_encryption_against_disabled_server_fails_handshake() {
    let (_server, listener, addr) = start_server(config(EncryptionMode::Disabled)).await;
    let client = Transport::new(config(EncryptionMode::Required)).unwrap();
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    client.subscribe(move |event| {
        if let TransportEvent::SessionEnded { session, cause } = event {
            let _ = ended_tx.send((session.clone(), cause.clone()));
        }
    });

    let result = client.connect(addr).await;
    assert!(matches!(result, Err(AppError::HandshakeFailure(_))));
    let (session, cause) = ended_rx.recv().await.unwrap();
    let cause = cause.expect("handshake failure left no close cause");
    assert!(cause.contains("handshake"), "unexpected cause: {}", cause);
    assert!(ended_rx.try_recv().is_err());
    assert_eq!(session.status(), SessionStatus::Closed);
    assert!(!session.is_encrypted());
    assert_eq!(client.session_count(), 0);
    assert_eq!(client.live_connections(), 0);
    listener.stop().await;
}

#[tokio::test]
async fn required_encryption_encrypts_both_peers() {
    let (server, listener, addr) = start_server(config(EncryptionMode::Required)).await;
    server.on_data(sum_handler);

    let client = Transport::new(config(EncryptionMode::Required)).unwrap();
    let session = client.connect(addr).await.unwrap();
    assert_eq!(session.encryption_state(), EncryptionState::Encrypted);

    eventually("server session", || server.session_count() == 1).await;
    let server_side = server.sessions().pop().unwrap();
    eventually("server encrypted", || server_side.is_encrypted()).await;

    let reply = session.request("1000,-1").await.unwrap();
    assert_eq!(&reply[..], b"999");
    listener.stop().await;
}

#[tokio::test]
async fn offered_encryption_is_negotiated_on_demand() {
    let (server, listener, addr) = start_server(config(EncryptionMode::Offered)).await;
    server.on_data(sum_handler);

    let client = Transport::new(config(EncryptionMode::Offered)).unwrap();
    let session = client.connect(addr).await.unwrap();
    assert_eq!(&session.request("2,3").await.unwrap()[..], b"5");
    assert!(!session.is_encrypted());

    session.negotiate_encryption().await.unwrap();
    assert!(session.is_encrypted());
    // a second negotiation keeps the installed key
    session.negotiate_encryption().await.unwrap();
    assert_eq!(&session.request("20,22").await.unwrap()[..], b"42");
    listener.stop().await;
}

#[tokio::test]
async fn plaintext_data_on_required_server_closes_session() {
    let (server, listener, addr) = start_server(config(EncryptionMode::Required)).await;
    server.on_data(sum_handler);

    let client = Transport::new(config(EncryptionMode::Disabled)).unwrap();
    let session = client.connect(addr).await.unwrap();
    let reply = session.request_timeout("1,1", Duration::from_millis(500)).await;
    assert!(reply.is_err());
    time::timeout(Duration::from_secs(3), session.closed())
        .await
        .expect("server did not drop the plaintext session");
    listener.stop().await;
}

#[tokio::test]
async fn late_reply_is_discarded() {
    let (server, listener, addr) = start_server(config(EncryptionMode::Disabled)).await;
    server.on_data(|message: Arc<InboundMessage>| async move {
        if &message.payload()[..] == b"slow" {
            time::sleep(Duration::from_millis(300)).await;
        }
        message.reply(message.payload().clone()).await
    });

    let client = Transport::new(config(EncryptionMode::Disabled)).unwrap();
    let session = client.connect(addr).await.unwrap();
    let timed_out = session
        .request_timeout("slow", Duration::from_millis(100))
        .await;
    match timed_out {
        Err(e) => assert!(e.is_reply_timeout()),
        Ok(_) => panic!("reply arrived before the timeout"),
    }
    assert_eq!(session.pending_replies(), 0);

    time::sleep(Duration::from_millis(400)).await;
    assert!(session.is_running());
    assert_eq!(&session.request("fast").await.unwrap()[..], b"fast");
    listener.stop().await;
}

#[tokio::test]
async fn callback_runs_on_reply() {
    let (server, listener, addr) = start_server(config(EncryptionMode::Disabled)).await;
    server.on_data(sum_handler);

    let client = Transport::new(config(EncryptionMode::Disabled)).unwrap();
    let session = client.connect(addr).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .request_with_callback("40,2", None, move |reply| {
            let _ = tx.send(reply);
        })
        .await
        .unwrap();
    let reply = time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply[..], b"42");
    listener.stop().await;
}

#[tokio::test]
async fn waiter_is_not_woken_by_transport_failure() {
    let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = raw.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let (mut stream, _) = raw.accept().await.unwrap();
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await.unwrap();
        // peer vanishes without answering
        drop(stream);
    });

    let client = Transport::new(config(EncryptionMode::Disabled)).unwrap();
    let session = client.connect(addr).await.unwrap();
    let started = Instant::now();
    let result = session
        .request_timeout("ping", Duration::from_millis(500))
        .await;
    peer.await.unwrap();

    assert!(matches!(result, Err(AppError::ReplyTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(session.status(), SessionStatus::Closed);
}

#[tokio::test]
async fn replying_twice_fails() {
    let (server, listener, addr) = start_server(config(EncryptionMode::Disabled)).await;
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    server.on_data(move |message: Arc<InboundMessage>| {
        let second_tx = second_tx.clone();
        async move {
            message.reply("first").await?;
            let second = message.reply("second").await;
            let _ = second_tx.send(second);
            Ok(())
        }
    });

    let client = Transport::new(config(EncryptionMode::Disabled)).unwrap();
    let session = client.connect(addr).await.unwrap();
    assert_eq!(&session.request("x").await.unwrap()[..], b"first");
    let second = second_rx.recv().await.unwrap();
    assert!(matches!(second, Err(AppError::AlreadyReplied(_))));
    assert!(session.is_running());
    listener.stop().await;
}

#[tokio::test]
async fn handler_error_closes_session() {
    let (server, listener, addr) = start_server(config(EncryptionMode::Disabled)).await;
    server.on_data(sum_handler);

    let client = Transport::new(config(EncryptionMode::Disabled)).unwrap();
    let session = client.connect(addr).await.unwrap();
    session.send("no comma here").await.unwrap();
    time::timeout(Duration::from_secs(3), session.closed())
        .await
        .expect("handler error did not close the session");
    eventually("server cleanup", || server.session_count() == 0).await;
    assert!(matches!(
        session.send("late").await,
        Err(AppError::SessionClosed(_))
    ));
    listener.stop().await;
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let (server, listener, addr) = start_server(config(EncryptionMode::Disabled)).await;
    server.on_data(sum_handler);

    let client = Transport::new(config(EncryptionMode::Disabled)).unwrap();
    let session = client.connect(addr).await.unwrap();
    let mut requests = Vec::new();
    for i in 0..64i64 {
        let session = session.clone();
        requests.push(tokio::spawn(async move {
            let reply = session.request(format!("{},{}", i, i)).await.unwrap();
            assert_eq!(String::from_utf8_lossy(&reply), (2 * i).to_string());
        }));
    }
    for request in requests {
        request.await.unwrap();
    }
    assert_eq!(session.pending_replies(), 0);
    listener.stop().await;
}

#[tokio::test]
async fn undersized_length_prefix_drops_connection() {
    let (server, listener, addr) = start_server(config(EncryptionMode::Disabled)).await;
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    server.subscribe(move |event| {
        if let TransportEvent::SessionEnded { cause, .. } = event {
            let _ = ended_tx.send(cause.clone());
        }
    });

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(&[0, 0, 0, 2, 0, 1]).await.unwrap();
    let mut buf = [0u8; 16];
    let read = time::timeout(Duration::from_secs(3), raw.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let cause = ended_rx.recv().await.unwrap();
    assert!(cause.unwrap().contains("protocol violation"));
    listener.stop().await;
}

#[tokio::test]
async fn handler_slots_bound_concurrency() {
    let mut server_config = config(EncryptionMode::Disabled);
    server_config.request_handler_pool.num_channels = 1;
    server_config.request_handler_pool.max_concurrent_handlers = 4;
    let (server, listener, addr) = start_server(server_config).await;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let active = active.clone();
        let peak = peak.clone();
        server.on_data(move |message| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                time::sleep(Duration::from_millis(300)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                message.reply("done").await
            }
        });
    }

    let client = Transport::new(config(EncryptionMode::Disabled)).unwrap();
    let session = client.connect(addr).await.unwrap();
    let started = Instant::now();
    let requests: Vec<_> = (0..5)
        .map(|i| {
            let session = session.clone();
            tokio::spawn(async move { session.request(format!("slow {}", i)).await })
        })
        .collect();
    for request in requests {
        assert_eq!(&request.await.unwrap().unwrap()[..], b"done");
    }
    // four ran side by side on a single worker; the fifth had to wait for a slot
    assert_eq!(peak.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert!(started.elapsed() < Duration::from_millis(1500));
    listener.stop().await;
}

#[tokio::test]
async fn oversized_request_is_refused_without_closing_session() {
    let mut server_config = config(EncryptionMode::Disabled);
    server_config.network.max_frame_size = 1024;
    let (server, listener, addr) = start_server(server_config).await;
    server.on_data(sum_handler);

    let mut client_config = config(EncryptionMode::Disabled);
    client_config.network.max_frame_size = 1024;
    let client = Transport::new(client_config).unwrap();
    let session = client.connect(addr).await.unwrap();

    let err = session.send(vec![b'1'; 4096]).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidValue(_)));
    assert!(session.is_running());
    assert_eq!(&session.request("20,22").await.unwrap()[..], b"42");
    assert_eq!(server.session_count(), 1);
    listener.stop().await;
}
