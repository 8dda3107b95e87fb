//! Client side of a commanding session.
//!
//! A [`CommandClient`] fronts a single worker task that owns the stream.
//! Callers enqueue priority-tagged call records into a bounded min-heap
//! (ordered on priority, then submission sequence, so equal priorities
//! stay FIFO); the worker drains it one call at a time — the wire is
//! strictly serial — and parks each response in a table keyed by the
//! call id until its caller collects it. While the queue is idle the
//! worker emits keepalive `time` calls on the poller's cadence.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BTreeMap, BinaryHeap, HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering as AtomicOrdering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Notify, Semaphore, watch},
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{debug, warn};

use crate::{
    commanding::{CALL_TITLE, CallForm, CommandingForm},
    connection::Connection,
    form::{FormReceiver, FormSender},
    polling::Poller,
    registry::CommandRegistry,
    session::{self, SessionConfig, SessionError},
    value::{Fault, Value},
};

/// How a caller-visible call can fail.
#[derive(Debug, Error)]
pub enum CallError {
    /// The handler raised a fault; the original kind and message are
    /// preserved (and the exact fault value when the codec carries it).
    #[error(transparent)]
    Remote(#[from] Fault),
    /// The session stopped before the call completed.
    #[error("session closed before the call completed")]
    Closed,
    /// The caller's deadline elapsed; the in-flight call continues and
    /// its late response is dropped.
    #[error("deadline elapsed while waiting for the response")]
    Deadline,
}

/// One queued call record.
#[derive(Debug)]
struct QueuedCall {
    priority: i32,
    seq: u64,
    id: String,
    command: String,
    pos_args: Vec<Value>,
    kw_args: BTreeMap<String, Value>,
}

impl Ord for QueuedCall {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

impl PartialOrd for QueuedCall {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl PartialEq for QueuedCall {
    fn eq(&self, other: &Self) -> bool { self.cmp(other) == Ordering::Equal }
}

impl Eq for QueuedCall {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A short opaque token, unique for the client's lifetime with
/// overwhelming probability.
fn mint_call_id() -> String {
    let bytes: [u8; 8] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<BinaryHeap<Reverse<QueuedCall>>>,
    seq: AtomicU64,
    slots: Semaphore,
    queue_notify: Notify,
    responses: Mutex<HashMap<String, Result<Value, Fault>>>,
    abandoned: Mutex<HashSet<String>>,
    response_notify: Notify,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn new(queue_size: usize) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            slots: Semaphore::new(queue_size),
            queue_notify: Notify::new(),
            responses: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(HashSet::new()),
            response_notify: Notify::new(),
            closed,
        }
    }

    fn pop_call(&self) -> Option<QueuedCall> {
        let call = lock(&self.queue).pop().map(|Reverse(call)| call);
        if call.is_some() {
            // A drained slot frees queue capacity for the next producer.
            self.slots.add_permits(1);
        }
        call
    }

    fn store_response(&self, id: String, outcome: Result<Value, Fault>) {
        if lock(&self.abandoned).remove(&id) {
            debug!(call = %id, "dropping response for an abandoned call");
            return;
        }
        lock(&self.responses).insert(id, outcome);
        self.response_notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.send_replace(true);
        self.slots.close();
        self.queue_notify.notify_waiters();
        self.response_notify.notify_waiters();
    }
}

/// Caller handle over a validated client session.
#[derive(Debug)]
pub struct CommandClient {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandClient {
    /// Run the client half of the handshake over `io` and start the
    /// worker. The registry supplies only the identity token; commands
    /// execute on the handler's side.
    ///
    /// # Errors
    /// [`SessionError::Incompatible`] when the identity tokens differ,
    /// or stream errors during the handshake.
    pub async fn connect<S>(
        io: S,
        registry: &CommandRegistry,
        cfg: SessionConfig,
    ) -> Result<Self, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = Connection::new(io);
        session::validate_client(&mut conn, registry.identity(), &cfg).await?;
        let shared = Arc::new(Shared::new(cfg.queue_size));
        let worker = tokio::spawn(worker_loop(conn, Arc::clone(&shared), cfg));
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue a call and block until its response arrives, returning
    /// the value or surfacing the remote fault. Lower priority values
    /// dispatch earlier; ties dispatch in submission order.
    ///
    /// # Errors
    /// [`CallError::Remote`] for handler-side faults, [`CallError::Closed`]
    /// when the session stops first.
    pub async fn execute(
        &self,
        command: &str,
        pos_args: Vec<Value>,
        kw_args: BTreeMap<String, Value>,
        priority: i32,
    ) -> Result<Value, CallError> {
        let id = self.submit(command, pos_args, kw_args, priority).await?;
        self.wait_response(&id, None).await
    }

    /// Enqueue a call without waiting and return its id. The queue is
    /// bounded; submission waits for a free slot.
    ///
    /// # Errors
    /// [`CallError::Closed`] when the session has stopped.
    pub async fn submit(
        &self,
        command: &str,
        pos_args: Vec<Value>,
        kw_args: BTreeMap<String, Value>,
        priority: i32,
    ) -> Result<String, CallError> {
        let permit = self
            .shared
            .slots
            .acquire()
            .await
            .map_err(|_| CallError::Closed)?;
        // The slot stays taken until the worker drains the record.
        permit.forget();
        let id = mint_call_id();
        let seq = self.shared.seq.fetch_add(1, AtomicOrdering::Relaxed);
        lock(&self.shared.queue).push(Reverse(QueuedCall {
            priority,
            seq,
            id: id.clone(),
            command: command.to_owned(),
            pos_args,
            kw_args,
        }));
        self.shared.queue_notify.notify_one();
        Ok(id)
    }

    /// Take the response for `id` if it has arrived. Retrieval removes
    /// the entry.
    #[must_use]
    pub fn try_response(&self, id: &str) -> Option<Result<Value, Fault>> {
        lock(&self.shared.responses).remove(id)
    }

    /// Block until the response for `id` arrives, optionally bounded by
    /// a deadline.
    ///
    /// # Errors
    /// [`CallError::Deadline`] when the deadline elapses first (the late
    /// response will be dropped), [`CallError::Closed`] when the session
    /// stops, [`CallError::Remote`] for handler-side faults.
    pub async fn wait_response(
        &self,
        id: &str,
        deadline: Option<Duration>,
    ) -> Result<Value, CallError> {
        match deadline {
            None => self.wait_response_inner(id).await,
            Some(limit) => match tokio::time::timeout(limit, self.wait_response_inner(id)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.abandon(id);
                    Err(CallError::Deadline)
                }
            },
        }
    }

    async fn wait_response_inner(&self, id: &str) -> Result<Value, CallError> {
        let mut closed_rx = self.shared.closed.subscribe();
        loop {
            let notified = self.shared.response_notify.notified();
            tokio::pin!(notified);
            // Register before checking so an insert between the check
            // and the wait cannot be missed.
            notified.as_mut().enable();
            if let Some(outcome) = self.try_response(id) {
                return outcome.map_err(CallError::Remote);
            }
            if *closed_rx.borrow() {
                return Err(CallError::Closed);
            }
            tokio::select! {
                () = &mut notified => {}
                _ = closed_rx.changed() => {}
            }
        }
    }

    fn abandon(&self, id: &str) {
        // Drop an already-arrived response, or mark the id so the worker
        // drops it on arrival.
        if lock(&self.shared.responses).remove(id).is_none() {
            lock(&self.shared.abandoned).insert(id.to_owned());
        }
    }

    /// Whether the session has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool { *self.shared.closed.borrow() }

    /// Stop the worker and forcibly close the underlying stream. Pending
    /// and blocked callers fail with [`CallError::Closed`]; an in-flight
    /// call is cut off mid-exchange.
    pub async fn shutdown(&self) {
        self.shared.close();
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            // Aborting drops the connection, which is the only way to
            // unblock a worker parked inside a framing read.
            handle.abort();
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "client worker did not stop cleanly");
                }
            }
        }
    }
}

async fn worker_loop<S>(mut conn: Connection<S>, shared: Arc<Shared>, cfg: SessionConfig)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut closed_rx = shared.closed.subscribe();
    let result = run_worker(&mut conn, &shared, &cfg, &mut closed_rx).await;
    match &result {
        Ok(()) => debug!("client worker stopped"),
        Err(err) => warn!(error = %err, "client worker failed"),
    }
    // Dropping the connection closes the stream; waking everyone else
    // is the last duty.
    shared.close();
}

async fn run_worker<S>(
    conn: &mut Connection<S>,
    shared: &Shared,
    cfg: &SessionConfig,
    closed_rx: &mut watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut poller = cfg.poll_interval.map(Poller::constant);
    let mut last_activity = Instant::now();
    loop {
        if *closed_rx.borrow() {
            return Ok(());
        }
        if let Some(call) = shared.pop_call() {
            dispatch_call(conn, shared, cfg, call).await?;
            last_activity = Instant::now();
            continue;
        }
        match poller.as_mut() {
            Some(poller) => {
                let idle = last_activity.elapsed();
                let (reached, _delta) = poller.is_interval_reached(idle);
                if reached {
                    keepalive(conn, cfg).await?;
                    last_activity = Instant::now();
                    poller.advance();
                    continue;
                }
                let remaining = poller
                    .current_interval()
                    .checked_sub(idle)
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    () = shared.queue_notify.notified() => {}
                    () = sleep(remaining) => {}
                    _ = closed_rx.changed() => {}
                }
            }
            None => {
                tokio::select! {
                    () = shared.queue_notify.notified() => {}
                    _ = closed_rx.changed() => {}
                }
            }
        }
    }
}

/// Serve one queued call: request/ack, the call form out, one reply
/// form back, and the outcome into the response table.
async fn dispatch_call<S>(
    conn: &mut Connection<S>,
    shared: &Shared,
    cfg: &SessionConfig,
    call: QueuedCall,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(call = %call.id, command = %call.command, "dispatching");
    session::send_request(conn, cfg).await?;
    let form = CallForm::new(call.command, call.pos_args, call.kw_args).to_form(cfg.codec)?;
    FormSender::new(conn, &cfg.separation, cfg.timeout)?
        .send(&form, true)
        .await?;
    let reply = FormReceiver::new(
        conn,
        &cfg.separation,
        cfg.timeout,
        cfg.line_limit,
        cfg.codec,
    )?
    .receive()
    .await?;
    let outcome = match CommandingForm::from_form(&reply)? {
        CommandingForm::Result(result) => Ok(result.value),
        CommandingForm::Error(error) => Err(error.fault),
        CommandingForm::Call(_) => {
            return Err(SessionError::ProtocolViolation {
                expected: "RETURN or ERROR",
                got: CALL_TITLE.to_owned(),
            });
        }
    };
    shared.store_response(call.id, outcome);
    Ok(())
}

/// The idle keepalive: a built-in `time` call whose reply is discarded.
async fn keepalive<S>(conn: &mut Connection<S>, cfg: &SessionConfig) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session::send_request(conn, cfg).await?;
    let form = CallForm::new("time", Vec::new(), BTreeMap::new()).to_form(cfg.codec)?;
    FormSender::new(conn, &cfg.separation, cfg.timeout)?
        .send(&form, true)
        .await?;
    let _reply = FormReceiver::new(
        conn,
        &cfg.separation,
        cfg.timeout,
        cfg.line_limit,
        cfg.codec,
    )?
    .receive()
    .await?;
    debug!("keepalive exchanged");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(priority: i32, seq: u64) -> QueuedCall {
        QueuedCall {
            priority,
            seq,
            id: format!("id-{seq}"),
            command: "noop".to_owned(),
            pos_args: Vec::new(),
            kw_args: BTreeMap::new(),
        }
    }

    #[test]
    fn heap_orders_by_priority_then_sequence() {
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(queued(5, 0)));
        heap.push(Reverse(queued(1, 1)));
        heap.push(Reverse(queued(1, 2)));
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(c)| c.seq)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn minted_ids_are_distinct_hex_tokens() {
        let a = mint_call_id();
        let b = mint_call_id();
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn abandoned_responses_are_dropped_on_arrival() {
        let shared = Shared::new(4);
        lock(&shared.abandoned).insert("gone".to_owned());
        shared.store_response("gone".to_owned(), Ok(Value::Null));
        assert!(lock(&shared.responses).is_empty());
        shared.store_response("kept".to_owned(), Ok(Value::Null));
        assert!(lock(&shared.responses).contains_key("kept"));
    }
}
