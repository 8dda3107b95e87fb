//! End-to-end client/handler sessions over in-memory streams.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, atomic::{AtomicUsize, Ordering}},
    time::Duration,
};

use formwire::{
    client::{CallError, CommandClient},
    codec::CodecKind,
    handler,
    registry::CommandRegistry,
    session::{SessionConfig, SessionError},
    value::{Fault, FaultKind, Value},
};
use tokio::{sync::watch, task::JoinHandle};

fn base_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new("ctx-v1");
    registry.register("upper", |pos, _kw| {
        let text = pos
            .first()
            .and_then(Value::as_text)
            .ok_or_else(|| Fault::new(FaultKind::Type, "upper takes one text argument"))?;
        Ok(Value::Text(text.to_uppercase()))
    });
    registry.register("divide", |pos, _kw| {
        let (Some(a), Some(b)) = (
            pos.first().and_then(Value::as_float),
            pos.get(1).and_then(Value::as_float),
        ) else {
            return Err(Fault::new(FaultKind::Type, "divide takes two numbers"));
        };
        if b == 0.0 {
            return Err(Fault::new(FaultKind::Arithmetic, "zero divisor"));
        }
        Ok(Value::Float(a / b))
    });
    registry
}

struct Harness {
    client: CommandClient,
    handler: JoinHandle<Result<(), SessionError>>,
    shutdown: watch::Sender<bool>,
}

async fn start(registry: CommandRegistry, cfg: SessionConfig) -> Harness {
    let (a, b) = tokio::io::duplex(16 * 1024);
    let registry = Arc::new(registry);
    let handler_registry = Arc::clone(&registry);
    let handler_cfg = cfg.clone();
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let handler: JoinHandle<Result<(), SessionError>> = tokio::spawn(async move {
        handler::serve_session(a, handler_registry, handler_cfg, &mut shutdown_rx).await
    });
    let client = CommandClient::connect(b, &registry, cfg)
        .await
        .expect("client handshake");
    Harness {
        client,
        handler,
        shutdown,
    }
}

#[tokio::test]
async fn upper_echoes_back_uppercased() {
    let h = start(base_registry(), SessionConfig::default()).await;
    let value = h
        .client
        .execute("upper", vec![Value::Text("abc".to_owned())], BTreeMap::new(), 1)
        .await
        .unwrap();
    assert_eq!(value, Value::Text("ABC".to_owned()));
    h.client.shutdown().await;
    h.handler.await.unwrap().unwrap();
}

#[tokio::test]
async fn remote_fault_is_rethrown_with_kind_and_message() {
    // With the textual codec the fault rides the name/message lines only.
    let h = start(base_registry(), SessionConfig::default()).await;
    let err = h
        .client
        .execute(
            "divide",
            vec![Value::Int(1), Value::Int(0)],
            BTreeMap::new(),
            1,
        )
        .await
        .unwrap_err();
    let CallError::Remote(fault) = err else {
        panic!("expected a remote fault, got {err:?}");
    };
    assert_eq!(fault.kind, FaultKind::Arithmetic);
    assert_eq!(fault.message, "zero divisor");
    h.client.shutdown().await;
}

#[tokio::test]
async fn binary_codec_round_trips_the_fault_value() {
    let cfg = SessionConfig {
        codec: CodecKind::Binary,
        ..SessionConfig::default()
    };
    let h = start(base_registry(), cfg).await;
    let err = h
        .client
        .execute(
            "divide",
            vec![Value::Float(1.0), Value::Float(0.0)],
            BTreeMap::new(),
            1,
        )
        .await
        .unwrap_err();
    let CallError::Remote(fault) = err else {
        panic!("expected a remote fault, got {err:?}");
    };
    assert_eq!(fault, Fault::new(FaultKind::Arithmetic, "zero divisor"));
    h.client.shutdown().await;
}

#[tokio::test]
async fn unknown_command_surfaces_the_dedicated_fault() {
    let h = start(base_registry(), SessionConfig::default()).await;
    let err = h
        .client
        .execute("nonesuch", vec![], BTreeMap::new(), 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::Remote(Fault {
            kind: FaultKind::UnknownCommand,
            ..
        })
    ));
    h.client.shutdown().await;
}

#[tokio::test]
async fn kw_args_reach_the_command() {
    let mut registry = base_registry();
    registry.register("greet", |_pos, kw| {
        let name = kw
            .get("name")
            .and_then(Value::as_text)
            .ok_or_else(|| Fault::new(FaultKind::Key, "missing name"))?;
        Ok(Value::Text(format!("hello {name}")))
    });
    let h = start(registry, SessionConfig::default()).await;
    let kw = BTreeMap::from([("name".to_owned(), Value::Text("ada".to_owned()))]);
    let value = h.client.execute("greet", vec![], kw, 1).await.unwrap();
    assert_eq!(value, Value::Text("hello ada".to_owned()));
    h.client.shutdown().await;
}

/// Registry whose `hold` command blocks until released, letting tests
/// pile calls up behind an in-flight exchange.
fn gated_registry(order: Arc<Mutex<Vec<String>>>) -> (CommandRegistry, std::sync::mpsc::Sender<()>) {
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let mut registry = base_registry();
    registry.register("hold", move |_pos, _kw| {
        release_rx
            .lock()
            .unwrap()
            .recv()
            .map_err(|e| Fault::new(FaultKind::Runtime, e.to_string()))?;
        Ok(Value::Null)
    });
    registry.register("mark", move |pos, _kw| {
        let label = pos
            .first()
            .and_then(Value::as_text)
            .ok_or_else(|| Fault::new(FaultKind::Type, "mark takes a label"))?;
        order.lock().unwrap().push(label.to_owned());
        Ok(Value::Null)
    });
    (registry, release_tx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_calls_dispatch_by_priority_then_fifo() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let (registry, release) = gated_registry(Arc::clone(&order));
    let h = start(registry, SessionConfig::default()).await;

    // Occupy the wire so the next submissions accumulate in the queue.
    let hold_id = h.client.submit("hold", vec![], BTreeMap::new(), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let a = h
        .client
        .submit("mark", vec![Value::Text("A".to_owned())], BTreeMap::new(), 5)
        .await
        .unwrap();
    let b = h
        .client
        .submit("mark", vec![Value::Text("B".to_owned())], BTreeMap::new(), 1)
        .await
        .unwrap();
    let c = h
        .client
        .submit("mark", vec![Value::Text("C".to_owned())], BTreeMap::new(), 1)
        .await
        .unwrap();

    release.send(()).unwrap();
    h.client.wait_response(&hold_id, None).await.unwrap();
    for id in [&b, &c, &a] {
        h.client.wait_response(id, None).await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["B", "C", "A"]);
    h.client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_wait_abandons_the_call_but_not_the_session() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let (registry, release) = gated_registry(order);
    let h = start(registry, SessionConfig::default()).await;

    let hold_id = h.client.submit("hold", vec![], BTreeMap::new(), 1).await.unwrap();
    let err = h
        .client
        .wait_response(&hold_id, Some(Duration::from_millis(80)))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Deadline));

    // The in-flight call still completes; its response is dropped and
    // the session keeps serving.
    release.send(()).unwrap();
    let value = h
        .client
        .execute("upper", vec![Value::Text("ok".to_owned())], BTreeMap::new(), 1)
        .await
        .unwrap();
    assert_eq!(value, Value::Text("OK".to_owned()));
    assert!(h.client.try_response(&hold_id).is_none());
    h.client.shutdown().await;
}

#[tokio::test]
async fn nonblocking_submit_pairs_with_exactly_one_retrieval() {
    let h = start(base_registry(), SessionConfig::default()).await;
    let id = h
        .client
        .submit("upper", vec![Value::Text("hi".to_owned())], BTreeMap::new(), 1)
        .await
        .unwrap();
    let value = h.client.wait_response(&id, None).await.unwrap();
    assert_eq!(value, Value::Text("HI".to_owned()));
    // Retrieval removed the entry.
    assert!(h.client.try_response(&id).is_none());
    h.client.shutdown().await;
}

#[tokio::test]
async fn idle_client_emits_keepalives_on_the_poll_interval() {
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&polls);
    let mut registry = base_registry();
    // Shadow the built-in time command with a counting double.
    registry.register("time", move |_pos, _kw| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Float(0.0))
    });
    let cfg = SessionConfig {
        poll_interval: Some(Duration::from_millis(50)),
        ..SessionConfig::default()
    };
    let h = start(registry, cfg).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        polls.load(Ordering::SeqCst) >= 3,
        "expected at least three keepalives, saw {}",
        polls.load(Ordering::SeqCst)
    );
    // Keepalives leave no caller-visible responses behind.
    let value = h
        .client
        .execute("upper", vec![Value::Text("x".to_owned())], BTreeMap::new(), 1)
        .await
        .unwrap();
    assert_eq!(value, Value::Text("X".to_owned()));
    h.client.shutdown().await;
}

#[tokio::test]
async fn mismatched_handshake_aborts_both_sides() {
    let (a, b) = tokio::io::duplex(4096);
    let server_registry = Arc::new(CommandRegistry::new("ctx-v1"));
    let client_registry = CommandRegistry::new("ctx-v2");
    let cfg = SessionConfig::default();
    let handler_cfg = cfg.clone();
    let (_shutdown, mut shutdown_rx) = watch::channel(false);
    let handler = tokio::spawn(async move {
        handler::serve_session(a, server_registry, handler_cfg, &mut shutdown_rx).await
    });
    let err = CommandClient::connect(b, &client_registry, cfg)
        .await
        .expect_err("client must refuse the session");
    assert!(matches!(err, SessionError::Incompatible { .. }));
    let handler_err = handler.await.unwrap().unwrap_err();
    assert!(matches!(handler_err, SessionError::Incompatible { .. }));
}

#[tokio::test]
async fn shutdown_closes_the_stream_and_the_handler_follows() {
    let h = start(base_registry(), SessionConfig::default()).await;
    assert!(!h.client.is_closed());
    h.client.shutdown().await;
    assert!(h.client.is_closed());
    // Handler notices the closed stream and ends cleanly.
    h.handler.await.unwrap().unwrap();
}

#[tokio::test]
async fn submitting_after_shutdown_fails_closed() {
    let h = start(base_registry(), SessionConfig::default()).await;
    h.client.shutdown().await;
    let err = h
        .client
        .submit("upper", vec![Value::Text("x".to_owned())], BTreeMap::new(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Closed));
}

#[tokio::test]
async fn shutdown_wakes_a_blocked_caller_with_closed() {
    // A peer that completes the handshake and then goes silent leaves
    // the caller blocked until shutdown cuts the session loose.
    let (peer_io, b) = tokio::io::duplex(4096);
    let peer = tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut io = peer_io;
        io.write_all(b"ctx-v1\n").await.unwrap();
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            if io.read_exact(&mut byte).await.is_err() {
                return;
            }
            if byte[0] == b'\n' {
                if line == b"ctx-v1" {
                    // Swallow the identity, then answer nothing ever.
                    line.clear();
                    continue;
                }
                line.clear();
            } else {
                line.push(byte[0]);
            }
        }
    });
    let registry = CommandRegistry::new("ctx-v1");
    let client = Arc::new(
        CommandClient::connect(b, &registry, SessionConfig::default())
            .await
            .unwrap(),
    );
    let waiter = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            client
                .execute("upper", vec![Value::Text("x".to_owned())], BTreeMap::new(), 1)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.shutdown().await;
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::Closed));
    peer.await.unwrap();
}

#[tokio::test]
async fn handler_shutdown_channel_ends_the_session() {
    let h = start(base_registry(), SessionConfig::default()).await;
    h.shutdown.send(true).unwrap();
    h.handler.await.unwrap().unwrap();
}
