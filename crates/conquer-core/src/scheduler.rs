//! Work distribution on top of the transport.
//!
//! The [`Scheduler`] answers the coordinator's negotiation messages (`env`,
//! `config`, `suite`), queues the schedules it receives and hands them to
//! worker threads through the blocking [`next`](Scheduler::next) call.
//! Workers hand results back through [`report`](Scheduler::report).
//!
//! The transport and the report loop run on a dedicated OS thread with a
//! current-thread tokio runtime. Worker threads only touch the two
//! [`BridgeQueue`]s.
//!
//! ```text
//! idle -> connecting -> negotiating -> scheduling -> draining -> stopped
//!                                \________________________________-> aborted
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeQueue;
use crate::client::{Client, ClientConfig, Subscriber, Transport};
use crate::codec::MessageType;
use crate::diagnostic::{Diagnostic, FatalHandler, exit_process};
use crate::env::CUSTOM_PROVIDER;
use crate::error::{Error, Result, ServerError};
use crate::model::{Report, Schedule, SuiteBuffer, SuiteItem};
use crate::serializer;
use crate::settings::SettingsResolver;

/// Protocol state, driven by inbound messages and the host's calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Connecting,
    Negotiating,
    Scheduling,
    Draining,
    Stopped,
    Aborted,
}

impl SchedulerState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Aborted)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entry of the schedule queue. `Finished` wakes workers once there is no more work.
#[derive(Debug)]
enum Work {
    Batch(Schedule),
    Finished,
}

#[derive(Debug, Default)]
struct SuiteState {
    buffer: SuiteBuffer,
    known: bool,
    requested: bool,
    sent: bool,
}

impl SuiteState {
    /// The suite payload, once, when it is both known and requested.
    fn take_payload(&mut self) -> Option<Value> {
        if !self.known || !self.requested || self.sent {
            return None;
        }
        self.sent = true;
        info!(items = self.buffer.len(), "sending suite");
        Some(serializer::serialize_suite(self.buffer.items()))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    meta: Map<String, Value>,
}

impl From<ErrorPayload> for ServerError {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            title: payload.title,
            body: payload.body,
            meta: payload
                .meta
                .into_iter()
                .map(|(key, value)| match value {
                    Value::String(text) => (key, text),
                    other => (key, other.to_string()),
                })
                .collect(),
        }
    }
}

/// Protocol state shared between the transport's consumer and worker threads.
struct Protocol {
    settings: Arc<SettingsResolver>,
    worker_id: u32,
    fatal: Arc<dyn FatalHandler>,
    state: Mutex<SchedulerState>,
    suite: Mutex<SuiteState>,
    schedules: BridgeQueue<Work>,
    reports: BridgeQueue<Report>,
    more: AtomicBool,
    /// Real schedules queued but not yet taken by a worker.
    queued: AtomicUsize,
    /// Set when the event loop exited without running the report loop.
    reports_closed: AtomicBool,
}

impl Protocol {
    fn set_state(&self, next: SchedulerState) {
        let mut state = lock(&self.state);
        if state.is_terminal() || *state == next {
            return;
        }
        debug!(from = ?*state, to = ?next, "scheduler state");
        *state = next;
    }

    fn enqueue_schedule(&self, schedule: Schedule) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.schedules.put(Work::Batch(schedule));
    }

    fn finish(&self) {
        self.more.store(false, Ordering::SeqCst);
        self.schedules.put(Work::Finished);
    }

    /// Drop reports nobody will send so `stop` does not wait on them.
    fn abandon_reports(&self) {
        self.reports_closed.store(true, Ordering::SeqCst);
        let mut dropped = 0;
        while self.reports.try_get().is_some() {
            self.reports.task_done();
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "reports dropped, scheduler loop is not running");
        }
    }

    fn done(&self) -> bool {
        !self.more.load(Ordering::SeqCst) && self.queued.load(Ordering::SeqCst) == 0
    }

    fn abort(&self, payload: &Value) {
        let server_error: ServerError = match serde_json::from_value::<ErrorPayload>(payload.clone()) {
            Ok(parsed) => parsed.into(),
            Err(_) => ServerError {
                title: "SERVER ERROR".into(),
                body: payload.to_string(),
                meta: Vec::new(),
            },
        };
        error!(title = %server_error.title, "server reported a fatal error");
        self.set_state(SchedulerState::Aborted);
        // release workers before handing control to the fatal handler
        self.finish();
        self.fatal.abort(&Diagnostic::from(&server_error));
    }
}

impl Subscriber for Protocol {
    fn on_server_message(
        &self,
        message_type: MessageType,
        payload: &Value,
    ) -> Result<Option<(MessageType, Value)>> {
        match message_type {
            MessageType::Env => {
                self.set_state(SchedulerState::Negotiating);
                let provider = self.settings.apply_env(payload).unwrap_or_else(|err| {
                    warn!(error = %err, "ignoring unusable env mapping");
                    CUSTOM_PROVIDER.to_string()
                });
                Ok(Some((MessageType::Env, json!(provider))))
            }
            MessageType::Config => {
                self.set_state(SchedulerState::Negotiating);
                let settings = self.settings.current();
                Ok(Some((
                    MessageType::Config,
                    serializer::serialize_config(&settings, self.worker_id),
                )))
            }
            MessageType::Suite => {
                self.set_state(SchedulerState::Negotiating);
                let mut suite = lock(&self.suite);
                suite.requested = true;
                Ok(suite.take_payload().map(|payload| (MessageType::Suite, payload)))
            }
            MessageType::Schedule => {
                self.set_state(SchedulerState::Scheduling);
                self.enqueue_schedule(serializer::deserialize_schedule(payload)?);
                Ok(None)
            }
            MessageType::Schedules => {
                self.set_state(SchedulerState::Scheduling);
                for schedule in serializer::deserialize_schedules(payload)? {
                    self.enqueue_schedule(schedule);
                }
                Ok(None)
            }
            MessageType::Done => {
                info!("server has no more work");
                self.finish();
                Ok(None)
            }
            MessageType::Error => {
                self.abort(payload);
                Ok(None)
            }
            MessageType::Ack | MessageType::Report => {
                debug!(%message_type, "ignoring message");
                Ok(None)
            }
        }
    }
}

async fn report_loop(protocol: &Protocol, transport: &dyn Transport) {
    while let Some(report) = protocol.reports.get_async().await {
        let items = report.items.len();
        match transport.send(MessageType::Report, serializer::serialize_report(&report)) {
            Ok(()) => debug!(items, "report queued for sending"),
            Err(err) => warn!(items, error = %err, "report could not be sent"),
        }
        protocol.reports.task_done();
    }
}

/// Blocking work-distribution surface for worker threads.
pub struct Scheduler {
    protocol: Arc<Protocol>,
    transport: Arc<dyn Transport>,
    thread: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("worker_id", &self.protocol.worker_id)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Scheduler over a websocket [`Client`] built from the current settings.
    pub fn connect(settings: Arc<SettingsResolver>, worker_id: u32) -> Result<Self> {
        Self::connect_with(settings, worker_id, exit_process())
    }

    pub fn connect_with(
        settings: Arc<SettingsResolver>,
        worker_id: u32,
        fatal: Arc<dyn FatalHandler>,
    ) -> Result<Self> {
        let config = ClientConfig::from_settings(&settings.current());
        let client = Client::with_fatal_handler(config, Arc::clone(&fatal))?;
        Ok(Self::new(settings, Arc::new(client), worker_id, fatal))
    }

    /// Scheduler over any transport.
    pub fn new(
        settings: Arc<SettingsResolver>,
        transport: Arc<dyn Transport>,
        worker_id: u32,
        fatal: Arc<dyn FatalHandler>,
    ) -> Self {
        let protocol = Arc::new(Protocol {
            settings,
            worker_id,
            fatal,
            state: Mutex::new(SchedulerState::Idle),
            suite: Mutex::new(SuiteState::default()),
            schedules: BridgeQueue::new(),
            reports: BridgeQueue::new(),
            more: AtomicBool::new(true),
            queued: AtomicUsize::new(0),
            reports_closed: AtomicBool::new(false),
        });
        transport.subscribe(Arc::clone(&protocol) as Arc<dyn Subscriber>);
        Self {
            protocol,
            transport,
            thread: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.protocol.state)
    }

    /// Start the event loop thread and submit the collected suite.
    pub fn start(&self, suite: impl IntoIterator<Item = SuiteItem>) -> Result<()> {
        let mut thread = lock(&self.thread);
        if thread.is_some() {
            return Err(Error::Runtime("scheduler already started".into()));
        }
        self.protocol.set_state(SchedulerState::Connecting);

        let (tx, rx) = oneshot::channel();
        let protocol = Arc::clone(&self.protocol);
        let transport = Arc::clone(&self.transport);
        let handle = std::thread::Builder::new()
            .name("conquer-scheduler".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!(error = %err, "could not create scheduler runtime");
                        protocol.abandon_reports();
                        return;
                    }
                };
                runtime.block_on(async move {
                    if let Err(err) = transport.start().await {
                        error!(error = %err, "could not start transport");
                        protocol.abandon_reports();
                        return;
                    }
                    tokio::select! {
                        () = report_loop(&protocol, transport.as_ref()) => {}
                        _ = rx => {}
                    }
                    transport.stop().await;
                });
            })?;
        *thread = Some(handle);
        *lock(&self.shutdown) = Some(tx);
        drop(thread);

        self.submit_suite(suite)
    }

    /// Add collected items. Items with an already known location are ignored.
    ///
    /// The suite is sent once the coordinator has asked for it.
    pub fn submit_suite(&self, items: impl IntoIterator<Item = SuiteItem>) -> Result<()> {
        let payload = {
            let mut suite = lock(&self.protocol.suite);
            suite.buffer.extend(items);
            suite.known = true;
            suite.take_payload()
        };
        match payload {
            Some(payload) => self.transport.send(MessageType::Suite, payload),
            None => Ok(()),
        }
    }

    /// Number of distinct suite items collected so far.
    pub fn suite_len(&self) -> usize {
        lock(&self.protocol.suite).buffer.len()
    }

    /// Block until work is available.
    ///
    /// Returns an empty schedule, without blocking, once the coordinator has
    /// signalled that there is no more work and every schedule was taken.
    pub fn next(&self) -> Schedule {
        if self.done() {
            return Schedule::empty();
        }
        match self.protocol.schedules.get() {
            Some(Work::Batch(schedule)) => {
                self.protocol.queued.fetch_sub(1, Ordering::SeqCst);
                self.protocol.schedules.task_done();
                schedule
            }
            Some(Work::Finished) => {
                self.protocol.schedules.task_done();
                // leave the marker for other waiting workers
                self.protocol.schedules.put(Work::Finished);
                Schedule::empty()
            }
            None => Schedule::empty(),
        }
    }

    /// Acknowledge a schedule and queue its report for sending.
    pub fn report(&self, schedule_id: Option<&str>, report: Report) -> Result<()> {
        if let Some(id) = schedule_id {
            self.transport.send(
                MessageType::Ack,
                json!({"schedule_id": id, "status": "success"}),
            )?;
        }
        if self.protocol.reports_closed.load(Ordering::SeqCst) {
            warn!(items = report.items.len(), "report dropped, scheduler loop is not running");
            return Ok(());
        }
        self.protocol.reports.put(report);
        Ok(())
    }

    /// Whether the coordinator is done and no schedule is left.
    pub fn done(&self) -> bool {
        self.protocol.done()
    }

    /// Send every queued report, then disconnect. Blocks the calling thread.
    pub fn stop(&self) {
        let Some(handle) = lock(&self.thread).take() else {
            return;
        };
        self.protocol.set_state(SchedulerState::Draining);
        if self.protocol.reports_closed.load(Ordering::SeqCst) {
            debug!("scheduler loop already gone, nothing to drain");
        } else {
            debug!(pending = self.protocol.reports.unfinished(), "draining reports");
            self.protocol.reports.join();
        }

        if let Some(tx) = lock(&self.shutdown).take() {
            let _ = tx.send(());
        }
        if handle.join().is_err() {
            error!("scheduler thread panicked");
        }
        self.protocol.set_state(SchedulerState::Stopped);
        info!("scheduler stopped");
    }
}
