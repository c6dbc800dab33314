//! Runtime host lifecycle against an in-memory control plane

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use helm_common::{Error, LeaderElection, ObjectKey};
use helm_operator::{
    Action, Context, ControllerRegistration, HostState, MetricsBindAddress, ProcessOptions,
    Reconciler, RunError, RuntimeHost,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{eventually, options, widget, widget_kind, widget_registry, InMemoryClient};

/// Counts reconciles and checks the host state each one starts in
struct Recorder {
    host_state: watch::Receiver<HostState>,
    work: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: AtomicUsize,
    finished: AtomicUsize,
    started_while_not_running: AtomicUsize,
}

impl Recorder {
    fn new(host: &RuntimeHost, work: Duration) -> Arc<Self> {
        Arc::new(Self {
            host_state: host.subscribe_state(),
            work,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            started_while_not_running: AtomicUsize::new(0),
        })
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

struct RecordingReconciler(Arc<Recorder>);

#[async_trait]
impl Reconciler for RecordingReconciler {
    async fn reconcile(&self, _key: &ObjectKey, _ctx: &Context) -> Result<Action, Error> {
        let recorder = &self.0;
        if *recorder.host_state.borrow() != HostState::Running {
            recorder.started_while_not_running.fetch_add(1, Ordering::SeqCst);
        }
        recorder.started.fetch_add(1, Ordering::SeqCst);
        let now = recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        recorder.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(recorder.work).await;

        recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
        recorder.finished.fetch_add(1, Ordering::SeqCst);
        Ok(Action::await_change())
    }
}

/// Fails with the given error a number of times, then succeeds
struct Flaky {
    failures: usize,
    retryable: bool,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Reconciler for Flaky {
    async fn reconcile(&self, key: &ObjectKey, _ctx: &Context) -> Result<Action, Error> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(if self.retryable {
                Error::client(key.to_string(), "connection refused")
            } else {
                Error::validation_for(key.to_string(), "spec is invalid")
            });
        }
        Ok(Action::await_change())
    }
}

/// Always asks to be revisited after a fixed interval
struct Periodic {
    every: Duration,
    runs: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl Reconciler for Periodic {
    async fn reconcile(&self, _key: &ObjectKey, _ctx: &Context) -> Result<Action, Error> {
        self.runs.lock().unwrap().push(Instant::now());
        Ok(Action::requeue(self.every))
    }
}

fn host_with(client: Arc<InMemoryClient>, options: ProcessOptions) -> RuntimeHost {
    RuntimeHost::builder(options, widget_registry())
        .client(client)
        .build()
        .unwrap()
}

fn spawn_run(
    mut host: RuntimeHost,
    shutdown: CancellationToken,
) -> JoinHandle<(RuntimeHost, Result<(), RunError>)> {
    tokio::spawn(async move {
        let result = host.run(shutdown).await;
        (host, result)
    })
}

fn seed_widgets(client: &InMemoryClient, count: usize) {
    for i in 0..count {
        client.apply(&widget_kind(), widget(&format!("w{i}")));
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_drains_in_flight_work_and_stops() {
    let client = InMemoryClient::new();
    seed_widgets(&client, 3);
    let mut host = host_with(client, options());
    let recorder = Recorder::new(&host, Duration::from_secs(1));
    host.attach(
        ControllerRegistration::new(
            "widgets",
            widget_kind().id().clone(),
            RecordingReconciler(Arc::clone(&recorder)),
        )
        .concurrency(2),
    )
    .unwrap();

    let mut state = host.subscribe_state();
    let shutdown = CancellationToken::new();
    let run = spawn_run(host, shutdown.clone());

    state.wait_for(|s| *s == HostState::Running).await.unwrap();
    eventually("two reconciles in flight", || recorder.started() == 2).await;
    shutdown.cancel();

    let (host, result) = run.await.unwrap();
    result.unwrap();
    assert_eq!(host.state(), HostState::Stopped);
    assert_eq!(
        host.history(),
        &[
            HostState::Uninitialized,
            HostState::Configured,
            HostState::Registering,
            HostState::Running,
            HostState::ShuttingDown,
            HostState::Stopped,
        ]
    );
    assert_eq!(recorder.started(), 2, "no reconcile may start once shutdown begins");
    assert_eq!(recorder.finished(), 2, "in-flight reconciles finish before stop");
    assert_eq!(recorder.started_while_not_running.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrency_limit_is_never_exceeded() {
    let client = InMemoryClient::new();
    seed_widgets(&client, 10);
    let mut host = host_with(client, options());
    let recorder = Recorder::new(&host, Duration::from_secs(1));
    host.attach(
        ControllerRegistration::new(
            "widgets",
            widget_kind().id().clone(),
            RecordingReconciler(Arc::clone(&recorder)),
        )
        .concurrency(3),
    )
    .unwrap();

    let shutdown = CancellationToken::new();
    let run = spawn_run(host, shutdown.clone());

    eventually("all widgets reconciled", || recorder.finished() == 10).await;
    assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 3);

    shutdown.cancel();
    run.await.unwrap().1.unwrap();
}

#[tokio::test(start_paused = true)]
async fn updates_to_a_key_are_reconciled_again() {
    let client = InMemoryClient::new();
    seed_widgets(&client, 1);
    let mut host = host_with(Arc::clone(&client), options());
    let recorder = Recorder::new(&host, Duration::from_millis(100));
    host.attach(ControllerRegistration::new(
        "widgets",
        widget_kind().id().clone(),
        RecordingReconciler(Arc::clone(&recorder)),
    ))
    .unwrap();

    let shutdown = CancellationToken::new();
    let run = spawn_run(host, shutdown.clone());
    eventually("initial reconcile", || recorder.finished() == 1).await;

    client.apply(&widget_kind(), widget("w0"));
    eventually("reconcile after update", || recorder.finished() == 2).await;

    shutdown.cancel();
    run.await.unwrap().1.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retryable_errors_are_retried_until_success() {
    let client = InMemoryClient::new();
    seed_widgets(&client, 1);
    let mut host = host_with(client, options());
    let attempts = Arc::new(AtomicUsize::new(0));
    host.attach(ControllerRegistration::new(
        "widgets",
        widget_kind().id().clone(),
        Flaky {
            failures: 3,
            retryable: true,
            attempts: Arc::clone(&attempts),
        },
    ))
    .unwrap();

    let shutdown = CancellationToken::new();
    let run = spawn_run(host, shutdown.clone());

    eventually("recovery after retries", || attempts.load(Ordering::SeqCst) == 4).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4, "success stops the retries");

    shutdown.cancel();
    run.await.unwrap().1.unwrap();
}

#[tokio::test(start_paused = true)]
async fn permanent_errors_wait_for_the_next_change() {
    let client = InMemoryClient::new();
    seed_widgets(&client, 1);
    let mut host = host_with(Arc::clone(&client), options());
    let attempts = Arc::new(AtomicUsize::new(0));
    host.attach(ControllerRegistration::new(
        "widgets",
        widget_kind().id().clone(),
        Flaky {
            failures: usize::MAX,
            retryable: false,
            attempts: Arc::clone(&attempts),
        },
    ))
    .unwrap();

    let shutdown = CancellationToken::new();
    let run = spawn_run(host, shutdown.clone());

    eventually("first attempt", || attempts.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    client.apply(&widget_kind(), widget("w0"));
    eventually("attempt after change", || attempts.load(Ordering::SeqCst) == 2).await;

    shutdown.cancel();
    run.await.unwrap().1.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dispatch_waits_for_leadership_and_stops_when_it_is_lost() {
    let client = InMemoryClient::new();
    seed_widgets(&client, 2);
    let elector = common::ScriptedLeaderElection::new();
    let opts = ProcessOptions {
        enable_leader_election: true,
        ..options()
    };
    let mut host = RuntimeHost::builder(opts, widget_registry())
        .client(client)
        .leader_election(elector.clone())
        .build()
        .unwrap();
    let recorder = Recorder::new(&host, Duration::from_millis(10));
    host.attach(ControllerRegistration::new(
        "widgets",
        widget_kind().id().clone(),
        RecordingReconciler(Arc::clone(&recorder)),
    ))
    .unwrap();

    let run = spawn_run(host, CancellationToken::new());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(recorder.started(), 0, "followers never dispatch");

    elector.grant();
    eventually("reconciles as leader", || recorder.finished() == 2).await;

    elector.revoke();
    let (host, result) = run.await.unwrap();
    assert!(matches!(result, Err(RunError::LeadershipLost)));
    assert_eq!(host.state(), HostState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn leadership_is_released_on_shutdown() {
    let client = InMemoryClient::new();
    let elector = common::ScriptedLeaderElection::new();
    elector.grant();
    let opts = ProcessOptions {
        enable_leader_election: true,
        ..options()
    };
    let mut host = RuntimeHost::builder(opts, widget_registry())
        .client(client)
        .leader_election(elector.clone())
        .build()
        .unwrap();
    let recorder = Recorder::new(&host, Duration::ZERO);
    host.attach(ControllerRegistration::new(
        "widgets",
        widget_kind().id().clone(),
        RecordingReconciler(recorder),
    ))
    .unwrap();

    let mut state = host.subscribe_state();
    let shutdown = CancellationToken::new();
    let run = spawn_run(host, shutdown.clone());
    state.wait_for(|s| *s == HostState::Running).await.unwrap();
    eventually("leadership", || elector.is_leader()).await;

    shutdown.cancel();
    run.await.unwrap().1.unwrap();
    assert!(elector.released());
}

#[tokio::test(start_paused = true)]
async fn ended_watch_is_fatal() {
    let client = InMemoryClient::new();
    seed_widgets(&client, 1);
    let mut host = host_with(Arc::clone(&client), options());
    let recorder = Recorder::new(&host, Duration::ZERO);
    host.attach(ControllerRegistration::new(
        "widgets",
        widget_kind().id().clone(),
        RecordingReconciler(Arc::clone(&recorder)),
    ))
    .unwrap();

    let run = spawn_run(host, CancellationToken::new());
    eventually("initial reconcile", || recorder.finished() == 1).await;

    client.end_watches();
    let (host, result) = run.await.unwrap();
    match result {
        Err(RunError::WatchEnded { controller, kind }) => {
            assert_eq!(controller, "widgets");
            assert_eq!(&kind, widget_kind().id());
        }
        other => panic!("expected WatchEnded, got {other:?}"),
    }
    assert_eq!(host.state(), HostState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stuck_reconcile_hits_the_drain_timeout() {
    let client = InMemoryClient::new();
    seed_widgets(&client, 1);
    let mut host = host_with(client, options());
    let recorder = Recorder::new(&host, Duration::from_secs(3600));
    host.attach(ControllerRegistration::new(
        "widgets",
        widget_kind().id().clone(),
        RecordingReconciler(Arc::clone(&recorder)),
    ))
    .unwrap();

    let shutdown = CancellationToken::new();
    let run = spawn_run(host, shutdown.clone());
    eventually("reconcile in flight", || recorder.started() == 1).await;
    shutdown.cancel();

    let (host, result) = run.await.unwrap();
    assert!(matches!(
        result,
        Err(RunError::DrainTimeout(timeout)) if timeout == Duration::from_secs(5)
    ));
    assert_eq!(host.state(), HostState::Stopped);
    assert_eq!(recorder.finished(), 0);
}

#[tokio::test(start_paused = true)]
async fn requeues_of_a_key_are_merged() {
    let client = InMemoryClient::new();
    seed_widgets(&client, 1);
    let mut host = host_with(Arc::clone(&client), options());
    let runs = Arc::new(Mutex::new(Vec::new()));
    host.attach(ControllerRegistration::new(
        "widgets",
        widget_kind().id().clone(),
        Periodic {
            every: Duration::from_secs(10),
            runs: Arc::clone(&runs),
        },
    ))
    .unwrap();

    let start = Instant::now();
    let shutdown = CancellationToken::new();
    let run = spawn_run(host, shutdown.clone());
    eventually("initial reconcile", || runs.lock().unwrap().len() == 1).await;

    // A change between two scheduled runs must not start a second schedule
    tokio::time::sleep_until(start + Duration::from_secs(3)).await;
    client.apply(&widget_kind(), widget("w0"));
    tokio::time::sleep_until(start + Duration::from_secs(38)).await;

    let runs = runs.lock().unwrap().clone();
    assert_eq!(runs.len(), 5, "runs at 0s, 3s, 13s, 23s and 33s: {runs:?}");
    for pair in runs[1..].windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(10));
    }

    shutdown.cancel();
    run.await.unwrap().1.unwrap();
}

fn unused_local_addr() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };
    let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn metrics_endpoint_lives_as_long_as_the_run() {
    for _ in 0..25 {
        let addr = unused_local_addr();
        let client = InMemoryClient::new();
        seed_widgets(&client, 1);
        let opts = ProcessOptions {
            metrics_addr: MetricsBindAddress::Listen(addr),
            ..options()
        };
        let mut host = host_with(client, opts);
        let recorder = Recorder::new(&host, Duration::ZERO);
        host.attach(ControllerRegistration::new(
            "widgets",
            widget_kind().id().clone(),
            RecordingReconciler(Arc::clone(&recorder)),
        ))
        .unwrap();

        let mut state = host.subscribe_state();
        let shutdown = CancellationToken::new();
        let run = spawn_run(host, shutdown.clone());
        state.wait_for(|s| *s == HostState::Running).await.unwrap();

        assert!(http_get(addr, "/readyz").await.starts_with("HTTP/1.1 200"));
        assert!(http_get(addr, "/metrics").await.starts_with("HTTP/1.1 200"));
        shutdown.cancel();

        let (host, result) = run.await.unwrap();
        result.unwrap();
        assert_eq!(host.state(), HostState::Stopped);
        assert!(TcpStream::connect(addr).await.is_err(), "endpoint closed after stop");
    }
}
