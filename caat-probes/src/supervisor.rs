use crate::errors::CaatError;
use crate::kernel::{Artifact, BufferOptions, BundleId, KernelBackend};
use crate::loader::{ArtifactLoader, EntryPoints, InstrumentationBundle};
use crate::probes::{AttachmentHandle, AttachmentManager, HookSpec};
use crate::stream::decode::{Event, RecordDecoder};
use crate::stream::{BackpressurePolicy, EventStreamConsumer, MetricsSnapshot, StreamMetrics};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    Idle,
    Loading,
    Attaching,
    Running,
    Detaching,
    Unloading,
    Stopped,
    Error,
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Error)
    }

    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        match (self, next) {
            (Idle, Loading)
            | (Loading, Attaching)
            | (Attaching, Running)
            | (Running, Detaching)
            | (Detaching, Unloading)
            | (Unloading, Stopped) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One configured program-to-hook binding.
#[derive(Debug, Clone, PartialEq, Eq, serde_derive::Deserialize)]
pub struct HookConfig {
    pub program: String,
    pub hook: HookSpec,
    /// Skip instead of rolling back when the hook cannot be attached.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub hooks: Vec<HookConfig>,
    /// Buffer maps to stream, one consumer each.
    pub streams: Vec<String>,
    pub policy: BackpressurePolicy,
    pub buffer: BufferOptions,
    pub shutdown_timeout: Duration,
    pub stats_interval: Option<Duration>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            hooks: Vec::new(),
            streams: Vec::new(),
            policy: BackpressurePolicy::default(),
            buffer: BufferOptions::default(),
            shutdown_timeout: Duration::from_secs(5),
            stats_interval: None,
        }
    }
}

/// Summary of a run that reached `Stopped`.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub bundle: BundleId,
    pub attached: usize,
    pub skipped: usize,
    pub streams: Vec<(String, MetricsSnapshot)>,
    /// Detach/unload failures logged during teardown.
    pub teardown_errors: usize,
    /// Consumers had to be aborted after the shutdown timeout.
    pub forced_shutdown: bool,
}

type ConsumerSet = JoinSet<(String, Result<(), CaatError>)>;

/// Drives one bundle through load, attach, stream and teardown.
///
/// The supervisor is the only owner of the bundle and its attachments;
/// consumers only ever see their own buffer map.
pub struct Supervisor<B: KernelBackend, D: RecordDecoder> {
    backend: Arc<B>,
    settings: SupervisorSettings,
    decoder: Arc<D>,
    state: watch::Sender<SupervisorState>,
}

impl<B: KernelBackend, D: RecordDecoder> Supervisor<B, D> {
    pub fn new(backend: Arc<B>, settings: SupervisorSettings, decoder: Arc<D>) -> Supervisor<B, D> {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Supervisor {
            backend,
            settings,
            decoder,
            state,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SupervisorState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            error!(target: "error", "Refusing supervisor transition {} -> {}", current, next);
            return;
        }
        debug!("Supervisor {} -> {}", current, next);
        self.state.send_replace(next);
    }

    fn entry_points(&self) -> EntryPoints {
        EntryPoints {
            programs: self
                .settings
                .hooks
                .iter()
                .filter(|h| !h.optional)
                .map(|h| h.program.clone())
                .collect(),
            maps: self.settings.streams.clone(),
        }
    }

    /// Runs the full lifecycle until `cancel` fires.
    ///
    /// Every error path detaches and unloads before returning the error that
    /// caused it. The sink is closed once all consumers have exited.
    ///
    /// A supervisor runs once. Any call made after the first one has left
    /// `Idle` fails with `NotIdle` and touches nothing.
    pub async fn run(
        &self,
        artifact: &Artifact,
        sink: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Result<RunReport, CaatError> {
        let mut current = SupervisorState::Idle;
        let started = self.state.send_if_modified(|s| {
            current = *s;
            if *s != SupervisorState::Idle {
                return false;
            }
            *s = SupervisorState::Loading;
            true
        });
        if !started {
            warn!(target: "error", "Refusing to run, supervisor is {}", current);
            return Err(CaatError::NotIdle {
                state: current.to_string(),
            });
        }
        debug!("Supervisor state: {} -> {}", current, SupervisorState::Loading);
        let loader = ArtifactLoader::new(self.backend.clone());
        let mut bundle = match loader.load(artifact, &self.entry_points()) {
            Ok(b) => b,
            Err(e) => {
                error!(target: "error", "Loading {} failed: {}", artifact.name(), e);
                self.transition(SupervisorState::Error);
                return Err(e);
            }
        };
        info!("Loaded {} from {}", bundle.id(), artifact.name());

        self.transition(SupervisorState::Attaching);
        let manager = AttachmentManager::new(self.backend.clone());
        let mut handles = Vec::with_capacity(self.settings.hooks.len());
        let mut skipped = 0;
        for h in &self.settings.hooks {
            match manager.attach(&bundle, &h.program, &h.hook) {
                Ok(handle) => handles.push(handle),
                Err(e) if h.optional => {
                    warn!(target: "error", "Skipping optional hook {} -> {}: {}", h.program, h.hook, e);
                    skipped += 1;
                }
                Err(e) => {
                    error!(target: "error", "Attaching {} to {} failed, rolling back: {}", h.program, h.hook, e);
                    return Err(self.fail(e, &loader, &mut bundle, handles));
                }
            }
        }

        let mut sources = Vec::with_capacity(self.settings.streams.len());
        for map in &self.settings.streams {
            match bundle.open_buffer(map, &self.settings.buffer) {
                Ok(s) => sources.push((map.clone(), s)),
                Err(e) => {
                    error!(target: "error", "Opening buffer map {} failed: {}", map, e);
                    drop(sources);
                    return Err(self.fail(e, &loader, &mut bundle, handles));
                }
            }
        }

        self.transition(SupervisorState::Running);
        let stop = cancel.child_token();
        let mut consumers: ConsumerSet = JoinSet::new();
        let mut metrics = Vec::with_capacity(sources.len());
        for (map, source) in sources {
            let consumer = EventStreamConsumer::new(
                &map,
                source,
                self.decoder.clone(),
                sink.clone(),
                self.settings.policy,
            );
            metrics.push((map.clone(), consumer.metrics()));
            let token = stop.clone();
            consumers.spawn(async move {
                let res = consumer.consume(token).await;
                (map, res)
            });
        }
        drop(sink);
        info!(
            "Running {} with {} hook(s), {} stream(s)",
            bundle.id(),
            handles.len(),
            metrics.len()
        );

        let mut ticker = self
            .settings
            .stats_interval
            .filter(|d| !d.is_zero())
            .map(|d| interval_at(Instant::now() + d, d));

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(joined) = consumers.join_next() => {
                    let (map, reason) = match joined {
                        Ok((map, Ok(()))) => (map, "exited before shutdown".to_string()),
                        Ok((map, Err(e))) => (map, e.to_string()),
                        Err(e) => ("unknown".to_string(), e.to_string()),
                    };
                    error!(target: "error", "Consumer for {} failed: {}", map, reason);
                    break Err(CaatError::ConsumerFailed { map, reason });
                }
                _ = tick(&mut ticker) => log_stats(&metrics),
            }
        };

        if let Err(e) = outcome {
            self.transition(SupervisorState::Error);
            stop.cancel();
            self.drain(&mut consumers).await;
            self.detach_all(&manager, handles);
            self.unload(&loader, &mut bundle);
            return Err(e);
        }

        self.transition(SupervisorState::Detaching);
        stop.cancel();
        let forced_shutdown = self.drain(&mut consumers).await;
        let streams = metrics
            .iter()
            .map(|(map, m)| (map.clone(), m.snapshot()))
            .collect::<Vec<_>>();

        let attached = handles.len();
        let mut teardown_errors = self.detach_all(&manager, handles);

        self.transition(SupervisorState::Unloading);
        teardown_errors += self.unload(&loader, &mut bundle);

        self.transition(SupervisorState::Stopped);
        info!("Stopped {} ({} teardown error(s))", bundle.id(), teardown_errors);

        Ok(RunReport {
            bundle: bundle.id(),
            attached,
            skipped,
            streams,
            teardown_errors,
            forced_shutdown,
        })
    }

    /// Best-effort cleanup before surfacing `err`; cleanup failures are only logged.
    fn fail(
        &self,
        err: CaatError,
        loader: &ArtifactLoader<B>,
        bundle: &mut InstrumentationBundle<B>,
        handles: Vec<AttachmentHandle<B>>,
    ) -> CaatError {
        self.transition(SupervisorState::Error);
        self.detach_all(&AttachmentManager::new(self.backend.clone()), handles);
        self.unload(loader, bundle);
        err
    }

    /// Waits for consumers up to the shutdown timeout, then aborts the rest.
    /// Returns whether any had to be aborted.
    async fn drain(&self, consumers: &mut ConsumerSet) -> bool {
        let graceful = tokio::time::timeout(self.settings.shutdown_timeout, async {
            while let Some(joined) = consumers.join_next().await {
                match joined {
                    Ok((map, Ok(()))) => debug!("Consumer for {} exited", map),
                    Ok((map, Err(e))) => {
                        warn!(target: "error", "Consumer for {} exited with error: {}", map, e)
                    }
                    Err(e) => warn!(target: "error", "Consumer task failed: {}", e),
                }
            }
        })
        .await;

        if graceful.is_ok() {
            return false;
        }

        warn!(target: "error", "{} consumer(s) did not stop within {:?}, aborting", consumers.len(), self.settings.shutdown_timeout);
        consumers.abort_all();
        while consumers.join_next().await.is_some() {}
        true
    }

    fn detach_all(
        &self,
        manager: &AttachmentManager<B>,
        handles: Vec<AttachmentHandle<B>>,
    ) -> usize {
        let mut failures = 0;
        for mut handle in handles {
            if manager.detach(&mut handle).is_err() {
                failures += 1;
            }
        }
        failures
    }

    fn unload(&self, loader: &ArtifactLoader<B>, bundle: &mut InstrumentationBundle<B>) -> usize {
        match loader.unload(bundle) {
            Ok(()) => 0,
            Err(e) => {
                error!(target: "error", "Unloading {} failed: {}", bundle.id(), e);
                1
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_stats(metrics: &[(String, Arc<StreamMetrics>)]) {
    for (map, m) in metrics {
        let s = m.snapshot();
        info!(
            target: "stats",
            "{}: read={} decoded={} dropped_decode={} dropped_backpressure={} blocked={} lost_kernel={}",
            map,
            s.records_read,
            s.records_decoded,
            s.dropped_decode,
            s.dropped_backpressure,
            s.blocked_sends,
            s.lost_kernel
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::sim::{SimBackend, SimFailure, SimTable};
    use crate::stream::decode::tests::open_record;
    use crate::stream::decode::{CaatDecoder, EventKind};
    use bytes::Bytes;
    use crate::errors::DecodeError;
    use crate::kernel::RawEventRecord;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::io;
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn artifact() -> Artifact {
        let table = SimTable {
            programs: vec![
                "trace_openat".into(),
                "trace_connect".into(),
                "trace_exec".into(),
            ],
            maps: vec!["EVENTS".into()],
        };
        Artifact::Bytes {
            name: "caat.bpf.o".into(),
            data: Bytes::from(table.render()),
        }
    }

    fn tracepoint(name: &str) -> HookSpec {
        HookSpec::Tracepoint {
            category: "syscalls".into(),
            name: name.into(),
        }
    }

    fn hook(program: &str, spec: HookSpec) -> HookConfig {
        HookConfig {
            program: program.into(),
            hook: spec,
            optional: false,
        }
    }

    fn settings(hooks: Vec<HookConfig>) -> SupervisorSettings {
        SupervisorSettings {
            hooks,
            streams: vec!["EVENTS".into()],
            ..Default::default()
        }
    }

    fn supervisor(
        sim: &Arc<SimBackend>,
        settings: SupervisorSettings,
    ) -> Arc<Supervisor<SimBackend, CaatDecoder>> {
        Arc::new(Supervisor::new(
            sim.clone(),
            settings,
            Arc::new(CaatDecoder),
        ))
    }

    async fn wait_state(rx: &mut watch::Receiver<SupervisorState>, target: SupervisorState) {
        timeout(Duration::from_secs(5), async {
            while *rx.borrow_and_update() != target {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("state not reached");
    }

    #[test]
    fn state_machine_transitions() {
        use SupervisorState::*;
        let path = [Idle, Loading, Attaching, Running, Detaching, Unloading, Stopped];
        for w in path.windows(2) {
            assert!(w[0].can_transition_to(w[1]));
            assert!(!w[1].can_transition_to(w[0]));
        }
        for s in &path[..6] {
            assert!(s.can_transition_to(Error));
        }
        assert!(!Stopped.can_transition_to(Error));
        assert!(!Error.can_transition_to(Idle));
        assert!(!Running.can_transition_to(Stopped));
    }

    #[test]
    fn hook_config_from_json() {
        let h: HookConfig = serde_json::from_value(json!({
            "program": "trace_openat",
            "hook": { "type": "tracepoint", "category": "syscalls", "name": "sys_enter_openat" },
        }))
        .unwrap();
        assert_eq!(h, hook("trace_openat", tracepoint("sys_enter_openat")));
    }

    #[tokio::test]
    async fn trace_openat_end_to_end() {
        let sim = Arc::new(SimBackend::new());
        let sup = supervisor(
            &sim,
            settings(vec![hook("trace_openat", tracepoint("sys_enter_openat"))]),
        );
        let mut state = sup.subscribe();
        let (snd, mut recv) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let sup = sup.clone();
            let cancel = cancel.clone();
            async move { sup.run(&artifact(), snd, cancel).await }
        });

        wait_state(&mut state, SupervisorState::Running).await;
        assert_eq!(sim.live_links(), 1);

        for (ts, path) in [(10, "/etc/passwd"), (20, "/etc/hosts"), (30, "/tmp/x")] {
            assert!(sim.emit("EVENTS", Some(0), open_record(100, ts, path)));
        }

        let mut last = 0;
        for _ in 0..3 {
            let ev = recv.recv().await.unwrap();
            assert_eq!(ev.kind, EventKind::Open);
            assert!(ev.timestamp_ns > last);
            last = ev.timestamp_ns;
        }

        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(report.attached, 1);
        assert_eq!(report.teardown_errors, 0);
        assert!(!report.forced_shutdown);
        assert_eq!(report.streams[0].0, "EVENTS");
        assert_eq!(report.streams[0].1.records_decoded, 3);

        assert_eq!(sim.live_resources(), 0);
        assert!(recv.recv().await.is_none());
    }

    #[tokio::test]
    async fn attach_failure_rolls_back() {
        let sim = Arc::new(SimBackend::new());
        sim.fail_attach("syscalls/sys_enter_execve");
        let sup = supervisor(
            &sim,
            settings(vec![
                hook("trace_openat", tracepoint("sys_enter_openat")),
                hook("trace_connect", tracepoint("sys_enter_connect")),
                hook("trace_exec", tracepoint("sys_enter_execve")),
            ]),
        );
        let (snd, _recv) = mpsc::channel(4);

        let err = sup
            .run(&artifact(), snd, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CaatError::KernelIo(_)));
        assert_eq!(sup.state(), SupervisorState::Error);
        assert_eq!(sim.live_links(), 0);
        assert_eq!(sim.loaded_bundles(), 0);
        assert_eq!(sim.live_resources(), 0);
    }

    #[tokio::test]
    async fn load_failure_is_surfaced() {
        let sim = Arc::new(SimBackend::new());
        sim.fail_load(SimFailure::PermissionDenied);
        let sup = supervisor(&sim, settings(vec![]));
        let (snd, _recv) = mpsc::channel(4);

        assert!(matches!(
            sup.run(&artifact(), snd, CancellationToken::new()).await,
            Err(CaatError::PermissionDenied(_))
        ));
        assert_eq!(sup.state(), SupervisorState::Error);
        assert_eq!(sim.live_resources(), 0);
    }

    #[tokio::test]
    async fn missing_stream_map_is_invalid_artifact() {
        let sim = Arc::new(SimBackend::new());
        let mut s = settings(vec![hook("trace_openat", tracepoint("sys_enter_openat"))]);
        s.streams.push("NET_EVENTS".into());
        let sup = supervisor(&sim, s);
        let (snd, _recv) = mpsc::channel(4);

        assert!(matches!(
            sup.run(&artifact(), snd, CancellationToken::new()).await,
            Err(CaatError::InvalidArtifact(_))
        ));
        assert_eq!(sim.live_resources(), 0);
    }

    #[tokio::test]
    async fn consumer_failure_escalates() {
        let sim = Arc::new(SimBackend::new());
        let sup = supervisor(
            &sim,
            settings(vec![hook("trace_openat", tracepoint("sys_enter_openat"))]),
        );
        let mut state = sup.subscribe();
        let (snd, recv) = mpsc::channel(4);

        let task = tokio::spawn({
            let sup = sup.clone();
            async move { sup.run(&artifact(), snd, CancellationToken::new()).await }
        });
        wait_state(&mut state, SupervisorState::Running).await;

        drop(recv);
        sim.emit("EVENTS", Some(1), open_record(7, 1, "/etc/shadow"));

        let err = task.await.unwrap().err().unwrap();
        assert!(matches!(err, CaatError::ConsumerFailed { ref map, .. } if map == "EVENTS"));
        assert_eq!(sup.state(), SupervisorState::Error);
        assert_eq!(sim.live_resources(), 0);
    }

    #[tokio::test]
    async fn optional_hook_is_skipped() {
        let sim = Arc::new(SimBackend::new());
        let mut hooks = vec![hook("trace_openat", tracepoint("sys_enter_openat"))];
        hooks.push(HookConfig {
            program: "trace_tcp".into(),
            hook: HookSpec::Kprobe {
                symbol: "tcp_v4_connect".into(),
                offset: 0,
            },
            optional: true,
        });
        let sup = supervisor(&sim, settings(hooks));
        let (snd, _recv) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = sup.run(&artifact(), snd, cancel).await.unwrap();
        assert_eq!(report.attached, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(sim.live_resources(), 0);
    }

    #[tokio::test]
    async fn detach_failure_does_not_block_unload() {
        let sim = Arc::new(SimBackend::new());
        sim.fail_detach("syscalls/sys_enter_openat");
        let sup = supervisor(
            &sim,
            settings(vec![
                hook("trace_openat", tracepoint("sys_enter_openat")),
                hook("trace_connect", tracepoint("sys_enter_connect")),
            ]),
        );
        let (snd, _recv) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = sup.run(&artifact(), snd, cancel).await.unwrap();
        assert_eq!(report.attached, 2);
        assert_eq!(report.teardown_errors, 1);
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(sim.loaded_bundles(), 0);
        assert_eq!(sim.live_resources(), 0);
    }

    #[tokio::test]
    async fn second_run_is_refused() {
        let sim = Arc::new(SimBackend::new());
        let sup = supervisor(
            &sim,
            settings(vec![hook("trace_openat", tracepoint("sys_enter_openat"))]),
        );
        let mut state = sup.subscribe();
        let cancel = CancellationToken::new();
        let (snd, _recv) = mpsc::channel(4);

        let task = tokio::spawn({
            let sup = sup.clone();
            let cancel = cancel.clone();
            async move { sup.run(&artifact(), snd, cancel).await }
        });
        wait_state(&mut state, SupervisorState::Running).await;

        // while the first run is live
        let (snd, _recv2) = mpsc::channel(4);
        let err = sup
            .run(&artifact(), snd, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CaatError::NotIdle { ref state } if state == "Running"));
        assert_eq!(sim.loaded_bundles(), 1);
        assert_eq!(sim.live_links(), 1);
        assert_eq!(sup.state(), SupervisorState::Running);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(sim.live_resources(), 0);

        // and after it has stopped
        let (snd, _recv3) = mpsc::channel(4);
        let err = sup
            .run(&artifact(), snd, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CaatError::NotIdle { ref state } if state == "Stopped"));
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(sim.loaded_bundles(), 0);
        assert_eq!(sim.live_resources(), 0);
    }

    #[tokio::test]
    async fn kernel_loss_reaches_report() {
        let sim = Arc::new(SimBackend::new().with_buffer_capacity(2));
        let sup = supervisor(
            &sim,
            settings(vec![hook("trace_openat", tracepoint("sys_enter_openat"))]),
        );
        let mut state = sup.subscribe();
        let (snd, mut recv) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let sup = sup.clone();
            let cancel = cancel.clone();
            async move { sup.run(&artifact(), snd, cancel).await }
        });
        wait_state(&mut state, SupervisorState::Running).await;

        let accepted = (1..=5)
            .filter(|ts| sim.emit("EVENTS", Some(0), open_record(100, *ts, "/var/log/x")))
            .count();
        assert_eq!(accepted, 2);

        assert_eq!(recv.recv().await.unwrap().timestamp_ns, 1);
        assert_eq!(recv.recv().await.unwrap().timestamp_ns, 2);

        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        let stats = &report.streams[0].1;
        assert_eq!(stats.records_read, 2);
        assert_eq!(stats.records_decoded, 2);
        assert_eq!(stats.lost_kernel, 3);
        assert_eq!(sim.live_resources(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stuck_consumer_is_aborted_after_timeout() {
        let sim = Arc::new(SimBackend::new());
        let mut s = settings(vec![hook("trace_openat", tracepoint("sys_enter_openat"))]);
        s.shutdown_timeout = Duration::from_millis(50);
        let slow = |raw: &RawEventRecord| -> Result<Event, DecodeError> {
            std::thread::sleep(Duration::from_millis(500));
            CaatDecoder.decode(raw)
        };
        let sup = Arc::new(Supervisor::new(sim.clone(), s, Arc::new(slow)));
        let mut state = sup.subscribe();
        let (snd, _recv) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let sup = sup.clone();
            let cancel = cancel.clone();
            async move { sup.run(&artifact(), snd, cancel).await }
        });
        wait_state(&mut state, SupervisorState::Running).await;

        assert!(sim.emit("EVENTS", Some(0), open_record(1, 1, "/a")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let report = timeout(Duration::from_secs(5), task)
            .await
            .expect("run did not finish")
            .unwrap()
            .unwrap();
        assert!(report.forced_shutdown);
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_eq!(sim.live_resources(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_are_logged_every_interval() {
        let logs = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let sim = Arc::new(SimBackend::new());
        let mut s = settings(vec![hook("trace_openat", tracepoint("sys_enter_openat"))]);
        s.stats_interval = Some(Duration::from_secs(10));
        let sup = supervisor(&sim, s);
        let mut state = sup.subscribe();
        let (snd, _recv) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let sup = sup.clone();
            let cancel = cancel.clone();
            async move { sup.run(&artifact(), snd, cancel).await }
        });
        wait_state(&mut state, SupervisorState::Running).await;

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let out = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert_eq!(out.matches("EVENTS: read=0").count(), 3);
        assert!(out.contains("lost_kernel=0"));
    }
}
