use std::{sync::Arc, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use crate::{
    cache::DependencyCache,
    command::{self, Language},
    config::EngineConfig,
    error::EngineError,
    metrics::MetricsRegistry,
    models::{self, ExecuteRequest},
    sandbox::{Provisioner, Sandbox},
    stream::StreamEvent,
};

/// A run accepted by [`SessionManager::start`]: the event stream plus the
/// generation tag identifying this particular sandbox, so a stale watcher
/// (timeout, disconnected consumer) can never tear down a successor run
/// started under the same session id.
pub struct StartedRun {
    pub generation: Uuid,
    pub events: mpsc::Receiver<StreamEvent>,
}

struct ActiveSession {
    generation: Uuid,
    sandbox: Arc<dyn Sandbox>,
    stdin: mpsc::Sender<String>,
    kill: Option<oneshot::Sender<()>>,
    started_at: DateTime<Utc>,
}

/// Where this run's dependencies come from: the bundle's manifest (if any)
/// and the cache entry for it (if complete). Resolved before provisioning,
/// since a declared-dependency cache miss is the one case a sandbox starts
/// online.
struct DependencyPlan {
    manifest: Option<String>,
    cached: Option<std::path::PathBuf>,
}

impl DependencyPlan {
    async fn resolve(
        cache: &DependencyCache,
        language: Language,
        request: &ExecuteRequest,
    ) -> Self {
        let manifest = language
            .manifest_file()
            .and_then(|name| request.files.iter().find(|f| f.name == name))
            .map(|f| f.content.clone());
        let cached = match &manifest {
            Some(manifest) => cache.lookup(language, manifest).await,
            None => None,
        };
        Self { manifest, cached }
    }

    fn needs_online_install(&self) -> bool {
        self.manifest.is_some() && self.cached.is_none()
    }
}

/// Process-wide registry from session id to live sandbox and execution
/// handle. Guarantees at most one active sandbox per session id and exactly
/// one teardown per sandbox instance, however the run ends.
pub struct SessionManager {
    provisioner: Arc<dyn Provisioner>,
    cache: Arc<DependencyCache>,
    metrics: Arc<MetricsRegistry>,
    config: EngineConfig,
    sessions: DashMap<String, ActiveSession>,
    start_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        cache: Arc<DependencyCache>,
        metrics: Arc<MetricsRegistry>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            provisioner,
            cache,
            metrics,
            config,
            sessions: DashMap::new(),
            start_locks: DashMap::new(),
        })
    }

    /// Validates the request, replaces any live run under the same session
    /// id, provisions a sandbox and attaches an execution handle. Language
    /// and bundle problems are rejected up front, before any sandbox
    /// exists; provisioning failures after that point are delivered as an
    /// `error` event followed by `end` on the returned stream.
    pub async fn start(
        self: &Arc<Self>,
        session_id: &str,
        request: ExecuteRequest,
    ) -> Result<StartedRun, EngineError> {
        models::validate_session_id(session_id)?;
        let language = Language::parse(&request.language)
            .ok_or_else(|| EngineError::UnsupportedLanguage(request.language.clone()))?;
        models::validate_bundle(&request)?;

        let generation = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.event_channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();

        // The launch runs detached so an impatient caller dropping the
        // request cannot abandon a half-provisioned sandbox; the task always
        // reaches either registration (watched by timeout and stop paths) or
        // its own cleanup.
        let manager = self.clone();
        let session_id_owned = session_id.to_string();
        tokio::spawn(async move {
            let lock = manager.start_lock(&session_id_owned);
            let _serialized = lock.lock().await;

            manager.stop(&session_id_owned).await;
            manager.metrics.run_started();

            if let Err(err) = manager
                .launch(&session_id_owned, generation, language, &request, tx.clone())
                .await
            {
                tracing::warn!(
                    session_id = %session_id_owned,
                    error = %format!("{err:#}"),
                    "run launch failed"
                );
                manager.metrics.run_failed();
                let _ = tx.try_send(StreamEvent::Error(format!("{err:#}\n")));
                let _ = tx.try_send(StreamEvent::End);
            }
            let _ = ready_tx.send(());
        });
        let _ = ready_rx.await;

        Ok(StartedRun {
            generation,
            events: rx,
        })
    }

    /// Cancels the in-flight execution and destroys the sandbox. Safe to
    /// call repeatedly or for a session with no active sandbox.
    pub async fn stop(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            self.teardown(session).await;
        }
    }

    /// Like [`stop`], but only if the registered run still is the given
    /// generation. Returns whether a sandbox was torn down. Used by the
    /// timeout watchdog, the consumer-disconnect guard and the natural-exit
    /// path; the sandbox destroy latch absorbs whichever of them fires
    /// late.
    pub async fn stop_generation(&self, session_id: &str, generation: Uuid) -> bool {
        let removed = self
            .sessions
            .remove_if(session_id, |_, session| session.generation == generation);
        match removed {
            Some((_, session)) => {
                self.teardown(session).await;
                true
            }
            None => false,
        }
    }

    /// Relays one input chunk to the running process's stdin.
    pub async fn input(&self, session_id: &str, text: String) -> Result<(), EngineError> {
        if text.len() > models::MAX_INPUT_BYTES {
            return Err(EngineError::InvalidRequest("input too large".to_string()));
        }
        let stdin = self
            .sessions
            .get(session_id)
            .map(|session| session.stdin.clone())
            .ok_or(EngineError::NoActiveSession)?;
        stdin
            .send(text)
            .await
            .map_err(|_| EngineError::NoActiveSession)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    async fn launch(
        self: &Arc<Self>,
        session_id: &str,
        generation: Uuid,
        language: Language,
        request: &ExecuteRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<()> {
        let plan = DependencyPlan::resolve(&self.cache, language, request).await;

        let sandbox = self
            .provisioner
            .provision(session_id, language, plan.needs_online_install())
            .await
            .context("sandbox provisioning failed")?;

        if let Err(err) = self
            .stage_and_attach(session_id, generation, language, request, &sandbox, plan, &events)
            .await
        {
            let _ = sandbox.destroy().await;
            return Err(err);
        }
        Ok(())
    }

    async fn stage_and_attach(
        self: &Arc<Self>,
        session_id: &str,
        generation: Uuid,
        language: Language,
        request: &ExecuteRequest,
        sandbox: &Arc<dyn Sandbox>,
        plan: DependencyPlan,
        events: &mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<()> {
        sandbox
            .write_files(&request.files)
            .await
            .context("writing source bundle into sandbox")?;

        if let (Some(manifest), Some(deps_dir)) = (&plan.manifest, language.deps_dir()) {
            if let Some(tree) = &plan.cached {
                self.metrics.cache_hit();
                sandbox
                    .copy_in(tree, deps_dir)
                    .await
                    .context("staging cached dependency tree")?;
            } else {
                self.metrics.cache_miss();
                self.install_dependencies(language, manifest, sandbox, deps_dir, events)
                    .await?;
                sandbox
                    .seal_network()
                    .await
                    .context("sealing sandbox network after install")?;
            }
        }

        let run_command = command::synthesize(language, &request.files, &request.entry_file);
        let mut handle = sandbox
            .run(&run_command, events.clone())
            .await
            .context("attaching execution handle")?;
        if let Some(initial) = request.input.clone() {
            let _ = handle.stdin().send(initial).await;
        }

        let kill = handle.take_kill();
        self.sessions.insert(
            session_id.to_string(),
            ActiveSession {
                generation,
                sandbox: sandbox.clone(),
                stdin: handle.stdin(),
                kill,
                started_at: Utc::now(),
            },
        );
        self.metrics.session_opened();

        // Termination watcher: fires on process exit, stream error (pumps
        // drain on EOF) and kill alike; emits the single `end` event and
        // funnels into the generation-checked teardown.
        let manager = self.clone();
        let watcher_events = events.clone();
        let watcher_session = session_id.to_string();
        tokio::spawn(async move {
            let summary = handle.wait().await;
            if !summary.killed {
                if summary.exit_code != 0 {
                    manager.metrics.run_failed();
                    let _ = watcher_events
                        .send(StreamEvent::Error(format!(
                            "process exited with status {}\n",
                            summary.exit_code
                        )))
                        .await;
                }
                manager.metrics.run_completed();
            }
            let _ = watcher_events.send(StreamEvent::End).await;
            manager.stop_generation(&watcher_session, generation).await;
        });

        // Wall-clock watchdog; a run that outlives the limit is stopped
        // exactly like a disconnect.
        let manager = self.clone();
        let watchdog_session = session_id.to_string();
        let limit = Duration::from_millis(self.config.run_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if manager.stop_generation(&watchdog_session, generation).await {
                manager.metrics.run_timed_out();
                tracing::warn!(
                    session_id = %watchdog_session,
                    "run exceeded wall-clock limit, sandbox destroyed"
                );
            }
        });

        Ok(())
    }

    async fn install_dependencies(
        &self,
        language: Language,
        manifest: &str,
        sandbox: &Arc<dyn Sandbox>,
        deps_dir: &str,
        events: &mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<()> {
        let Some(install) = language.install_command() else {
            return Ok(());
        };
        let installed = tokio::time::timeout(
            Duration::from_millis(self.config.install_timeout_ms),
            sandbox.exec(install),
        )
        .await
        .context("dependency install timed out")?
        .context("dependency install failed")?;

        if installed.exit_code != 0 {
            // Program-level failure: relayed, not fatal to the engine. The
            // run proceeds and surfaces whatever import errors follow.
            let _ = events.send(StreamEvent::Error(installed.stderr)).await;
            return Ok(());
        }
        tracing::debug!(
            language = language.as_str(),
            output = %installed.stdout.trim(),
            "dependency install finished"
        );

        // Cache population is best-effort; a failure only degrades the
        // future hit rate.
        let staging =
            std::env::temp_dir().join(format!("runbox-stage-{}", Uuid::new_v4().as_simple()));
        let persisted = async {
            sandbox.copy_out(deps_dir, &staging).await?;
            self.cache.populate(language, manifest, &staging).await
        }
        .await;
        if let Err(err) = persisted {
            tracing::warn!(
                language = language.as_str(),
                error = %format!("{err:#}"),
                "dependency cache populate failed"
            );
        }
        let _ = tokio::fs::remove_dir_all(&staging).await;
        Ok(())
    }

    async fn teardown(&self, mut session: ActiveSession) {
        if let Some(kill) = session.kill.take() {
            let _ = kill.send(());
        }
        if let Err(err) = session.sandbox.destroy().await {
            tracing::warn!(
                sandbox = session.sandbox.name(),
                error = %format!("{err:#}"),
                "sandbox destroy failed"
            );
        }
        self.metrics.session_closed();
        tracing::debug!(
            sandbox = session.sandbox.name(),
            lifetime_ms = (Utc::now() - session.started_at).num_milliseconds(),
            "session closed"
        );
    }

    fn start_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.start_locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::{SystemTime, UNIX_EPOCH},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        models::SourceFile,
        sandbox::{ExecOutput, ExecutionHandle, ExitSummary, sandbox_name},
        stream::StopGuard,
    };

    struct FakeProvisioner {
        created: AtomicUsize,
        destroyed: Arc<AtomicUsize>,
        received_input: Arc<Mutex<Vec<String>>>,
        script: Vec<StreamEvent>,
        hold: bool,
        fail_provision: bool,
    }

    impl FakeProvisioner {
        fn new(script: Vec<StreamEvent>, hold: bool) -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                destroyed: Arc::new(AtomicUsize::new(0)),
                received_input: Arc::new(Mutex::new(Vec::new())),
                script,
                hold,
                fail_provision: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                destroyed: Arc::new(AtomicUsize::new(0)),
                received_input: Arc::new(Mutex::new(Vec::new())),
                script: Vec::new(),
                hold: false,
                fail_provision: true,
            })
        }
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        fn backend(&self) -> &'static str {
            "fake"
        }

        async fn provision(
            &self,
            session_id: &str,
            _language: Language,
            _online: bool,
        ) -> anyhow::Result<Arc<dyn Sandbox>> {
            if self.fail_provision {
                anyhow::bail!("sandbox capacity exhausted");
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeSandbox {
                name: sandbox_name(session_id),
                destroyed: AtomicBool::new(false),
                destroy_count: self.destroyed.clone(),
                received_input: self.received_input.clone(),
                script: self.script.clone(),
                hold: self.hold,
            }))
        }
    }

    struct FakeSandbox {
        name: String,
        destroyed: AtomicBool,
        destroy_count: Arc<AtomicUsize>,
        received_input: Arc<Mutex<Vec<String>>>,
        script: Vec<StreamEvent>,
        hold: bool,
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn name(&self) -> &str {
            &self.name
        }

        async fn write_files(&self, _files: &[SourceFile]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn exec(&self, _command: &str) -> anyhow::Result<ExecOutput> {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        async fn copy_in(&self, _host_src: &Path, _scratch_dst: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn copy_out(&self, _scratch_src: &str, _host_dst: &Path) -> anyhow::Result<()> {
            Ok(())
        }

        async fn run(
            &self,
            _command: &str,
            events: mpsc::Sender<StreamEvent>,
        ) -> anyhow::Result<ExecutionHandle> {
            let (stdin_tx, mut stdin_rx) = mpsc::channel(16);
            let (kill_tx, kill_rx) = oneshot::channel::<()>();
            let (done_tx, done_rx) = oneshot::channel();
            let script = self.script.clone();
            let hold = self.hold;
            let sink = self.received_input.clone();
            tokio::spawn(async move {
                let input_pump = tokio::spawn(async move {
                    while let Some(chunk) = stdin_rx.recv().await {
                        sink.lock().await.push(chunk);
                    }
                });
                for event in script {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                if hold {
                    let _ = kill_rx.await;
                }
                input_pump.abort();
                let _ = done_tx.send(ExitSummary {
                    exit_code: 0,
                    killed: hold,
                });
            });
            Ok(ExecutionHandle::from_parts(stdin_tx, kill_tx, done_rx))
        }

        async fn destroy(&self) -> anyhow::Result<()> {
            if !self.destroyed.swap(true, Ordering::SeqCst) {
                self.destroy_count.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn test_config(run_timeout_ms: u64) -> EngineConfig {
        EngineConfig {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            sandbox_backend: crate::config::SandboxBackendKind::Process,
            memory_limit_mb: 64,
            cpu_limit: 0.5,
            pids_limit: 16,
            scratch_size_mb: 16,
            run_timeout_ms,
            install_timeout_ms: 1_000,
            max_output_bytes: 64 * 1024,
            event_channel_capacity: 16,
            cache_root: unique_temp_dir("cache"),
            image_python: String::new(),
            image_javascript: String::new(),
            image_c: String::new(),
            image_cpp: String::new(),
            image_java: String::new(),
            log_level: "info".to_string(),
        }
    }

    fn unique_temp_dir(tag: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("runbox-session-test-{tag}-{nanos}"))
    }

    fn manager_with(
        provisioner: Arc<FakeProvisioner>,
        run_timeout_ms: u64,
    ) -> Arc<SessionManager> {
        let config = test_config(run_timeout_ms);
        SessionManager::new(
            provisioner,
            Arc::new(DependencyCache::new(config.cache_root.clone())),
            Arc::new(MetricsRegistry::new()),
            config,
        )
    }

    fn python_request(code: &str) -> ExecuteRequest {
        ExecuteRequest {
            language: "python".to_string(),
            files: vec![SourceFile {
                name: "main.py".to_string(),
                content: code.to_string(),
            }],
            entry_file: "main.py".to_string(),
            input: None,
        }
    }

    async fn collect_until_end(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("stream stalled before end")
                .expect("stream closed before end");
            let is_end = event == StreamEvent::End;
            events.push(event);
            if is_end {
                return events;
            }
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn unsupported_language_creates_zero_sandboxes() {
        let provisioner = FakeProvisioner::new(Vec::new(), false);
        let manager = manager_with(provisioner.clone(), 5_000);
        let mut request = python_request("print('hi')");
        request.language = "cobol".to_string();

        let err = manager.start("s1", request).await.err().expect("rejected");
        assert!(matches!(err, EngineError::UnsupportedLanguage(_)));
        assert_eq!(provisioner.created.load(Ordering::SeqCst), 0);
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn run_streams_output_then_end_and_cleans_up() {
        let provisioner = FakeProvisioner::new(
            vec![StreamEvent::Output("hi\n".to_string())],
            false,
        );
        let manager = manager_with(provisioner.clone(), 5_000);

        let mut run = manager
            .start("s1", python_request("print('hi')"))
            .await
            .expect("run accepted");
        let events = collect_until_end(&mut run.events).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Output("hi\n".to_string()),
                StreamEvent::End,
            ]
        );

        wait_until(|| manager.active_sessions() == 0).await;
        assert_eq!(provisioner.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn events_preserve_production_order() {
        let provisioner = FakeProvisioner::new(
            vec![
                StreamEvent::Output("A".to_string()),
                StreamEvent::Output("B".to_string()),
            ],
            false,
        );
        let manager = manager_with(provisioner, 5_000);

        let mut run = manager
            .start("s1", python_request(""))
            .await
            .expect("run accepted");
        let events = collect_until_end(&mut run.events).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Output("A".to_string()),
                StreamEvent::Output("B".to_string()),
                StreamEvent::End,
            ]
        );
    }

    #[tokio::test]
    async fn second_start_replaces_prior_sandbox() {
        let provisioner = FakeProvisioner::new(Vec::new(), true);
        let manager = manager_with(provisioner.clone(), 30_000);

        let _first = manager
            .start("shared", python_request(""))
            .await
            .expect("first run accepted");
        let _second = manager
            .start("shared", python_request(""))
            .await
            .expect("second run accepted");

        assert_eq!(provisioner.created.load(Ordering::SeqCst), 2);
        wait_until(|| provisioner.destroyed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(manager.active_sessions(), 1);

        manager.stop("shared").await;
        assert_eq!(provisioner.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let provisioner = FakeProvisioner::new(Vec::new(), true);
        let manager = manager_with(provisioner.clone(), 30_000);

        let _run = manager
            .start("s1", python_request(""))
            .await
            .expect("run accepted");
        manager.stop("s1").await;
        manager.stop("s1").await;
        manager.stop("never-existed").await;

        assert_eq!(provisioner.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn natural_exit_then_stop_destroys_once() {
        let provisioner = FakeProvisioner::new(Vec::new(), false);
        let manager = manager_with(provisioner.clone(), 5_000);

        let mut run = manager
            .start("s1", python_request(""))
            .await
            .expect("run accepted");
        collect_until_end(&mut run.events).await;
        wait_until(|| manager.active_sessions() == 0).await;

        manager.stop("s1").await;
        assert_eq!(provisioner.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn input_reaches_the_running_process() {
        let provisioner = FakeProvisioner::new(Vec::new(), true);
        let manager = manager_with(provisioner.clone(), 30_000);

        let _run = manager
            .start("s1", python_request(""))
            .await
            .expect("run accepted");
        manager.input("s1", "ping".to_string()).await.expect("relayed");

        let received = provisioner.received_input.clone();
        wait_until(|| received.try_lock().map(|v| v.contains(&"ping".to_string())).unwrap_or(false))
            .await;

        manager.stop("s1").await;
    }

    #[tokio::test]
    async fn input_without_live_session_is_rejected() {
        let provisioner = FakeProvisioner::new(Vec::new(), false);
        let manager = manager_with(provisioner, 5_000);

        let err = manager
            .input("ghost", "x".to_string())
            .await
            .err()
            .expect("rejected");
        assert!(matches!(err, EngineError::NoActiveSession));
    }

    #[tokio::test]
    async fn initial_input_is_forwarded() {
        let provisioner = FakeProvisioner::new(Vec::new(), true);
        let manager = manager_with(provisioner.clone(), 30_000);

        let mut request = python_request("");
        request.input = Some("seed".to_string());
        let _run = manager.start("s1", request).await.expect("run accepted");

        let received = provisioner.received_input.clone();
        wait_until(|| received.try_lock().map(|v| v.contains(&"seed".to_string())).unwrap_or(false))
            .await;
        manager.stop("s1").await;
    }

    #[tokio::test]
    async fn timeout_stops_run_like_a_disconnect() {
        let provisioner = FakeProvisioner::new(Vec::new(), true);
        let manager = manager_with(provisioner.clone(), 40);

        let mut run = manager
            .start("s1", python_request("while True: pass"))
            .await
            .expect("run accepted");

        let events = collect_until_end(&mut run.events).await;
        assert_eq!(events.last(), Some(&StreamEvent::End));
        wait_until(|| manager.active_sessions() == 0).await;
        assert_eq!(provisioner.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn consumer_disconnect_guard_destroys_sandbox() {
        let provisioner = FakeProvisioner::new(Vec::new(), true);
        let manager = manager_with(provisioner.clone(), 30_000);

        let run = manager
            .start("s1", python_request(""))
            .await
            .expect("run accepted");
        let guard = StopGuard::new(manager.clone(), "s1".to_string(), run.generation);
        drop(run.events);
        drop(guard);

        wait_until(|| provisioner.destroyed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn stale_guard_does_not_touch_a_successor_run() {
        let provisioner = FakeProvisioner::new(Vec::new(), true);
        let manager = manager_with(provisioner.clone(), 30_000);

        let first = manager
            .start("shared", python_request(""))
            .await
            .expect("first run accepted");
        let stale_generation = first.generation;
        let _second = manager
            .start("shared", python_request(""))
            .await
            .expect("second run accepted");
        wait_until(|| provisioner.destroyed.load(Ordering::SeqCst) == 1).await;

        assert!(!manager.stop_generation("shared", stale_generation).await);
        assert_eq!(manager.active_sessions(), 1);
        assert_eq!(provisioner.destroyed.load(Ordering::SeqCst), 1);

        manager.stop("shared").await;
    }

    #[tokio::test]
    async fn provisioning_failure_streams_error_then_end() {
        let provisioner = FakeProvisioner::failing();
        let manager = manager_with(provisioner.clone(), 5_000);

        let mut run = manager
            .start("s1", python_request(""))
            .await
            .expect("start itself succeeds");
        let events = collect_until_end(&mut run.events).await;

        match &events[..] {
            [StreamEvent::Error(message), StreamEvent::End] => {
                assert!(message.contains("provisioning failed"), "{message}");
            }
            other => panic!("unexpected event sequence: {other:?}"),
        }
        assert_eq!(manager.active_sessions(), 0);
    }
}
