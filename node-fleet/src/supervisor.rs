//! Per-node process supervision
//!
//! A [`NodeSupervisor`] owns at most one node process at a time:
//! - `init` loads the node's `config.yaml`, running the one-time `setup`
//!   invocation first when the file does not exist yet
//! - `start` spawns `<binary> run --config-dir <dir>` for the node's version
//! - an exit nobody asked for is logged and followed by a relaunch, paced by
//!   the configured [`RestartPolicy`]
//! - `stop` raises the explicit-stop flag before signalling the process, so
//!   the resulting exit is never mistaken for a crash
//!
//! The process itself is owned by a watcher task; the supervisor keeps a
//! channel pair to ask for termination and to learn about the exit.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifacts::{create_private_dir, ArtifactProvider};
use crate::coordinator::NodeControl;
use crate::error::NodeError;
use crate::logging::LogLevel;
use crate::output;
use crate::policy::RestartPolicy;
use crate::state::{new_state, ActiveProcess, NodePhase, NodeRuntimeState, NodeSpec, NodeStatus, Shared};
use crate::version::Version;

/// How long a stopped node may take to exit before it is killed
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// A run at least this long resets the consecutive restart counter
pub const STABLE_UPTIME: Duration = Duration::from_secs(60);

/// Supervisor of one node process
#[derive(Clone)]
pub struct NodeSupervisor {
    spec: Arc<NodeSpec>,
    artifacts: Arc<dyn ArtifactProvider>,
    restart_policy: Arc<dyn RestartPolicy>,
    stop_grace: Duration,
    state: Shared<NodeRuntimeState>,
}

impl NodeSupervisor {
    pub fn new(
        spec: NodeSpec,
        version: Version,
        artifacts: Arc<dyn ArtifactProvider>,
        restart_policy: Arc<dyn RestartPolicy>,
    ) -> Self {
        Self {
            spec: Arc::new(spec),
            artifacts,
            restart_policy,
            stop_grace: DEFAULT_STOP_GRACE,
            state: new_state(NodeRuntimeState::new(version)),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn version(&self) -> Version {
        self.state.lock().version.clone()
    }

    pub fn set_version(&self, version: Version) {
        self.state.lock().version = version;
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.state.lock();
        NodeStatus {
            name: self.spec.name.clone(),
            phase: state.phase,
            version: state.version.clone(),
            initialized: state.initialized,
            pid: state.active.as_ref().and_then(|a| a.pid),
            restart_attempts: state.restart_attempts,
            console_address: state.console_address(),
        }
    }

    /// Loads the node configuration, running `setup` first if it is missing
    pub async fn init(&self) -> Result<(), NodeError> {
        let config_file = self.spec.config_file();
        if !tokio::fs::try_exists(&config_file).await.unwrap_or(false) {
            self.setup().await?;
        }

        let config_error = |reason: String| NodeError::ConfigLoad {
            node: self.spec.name.clone(),
            path: config_file.clone(),
            reason,
        };

        let content = tokio::fs::read_to_string(&config_file)
            .await
            .map_err(|e| config_error(e.to_string()))?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&content).map_err(|e| config_error(e.to_string()))?;
        if !value.is_mapping() {
            return Err(config_error("expected a mapping at the top level".into()));
        }

        let mut state = self.state.lock();
        state.node_config = Some(value);
        state.initialized = true;
        Ok(())
    }

    /// One-time node setup; the invocation must exit successfully
    pub async fn setup(&self) -> Result<(), NodeError> {
        info!(node = %self.spec.name, "Setting up new node ..");
        let setup_failed = |reason: String| NodeError::SetupFailed {
            node: self.spec.name.clone(),
            reason,
        };

        let binary = self.artifacts.ensure(&self.version()).await?;
        create_private_dir(&self.spec.config_dir)
            .await
            .map_err(|e| setup_failed(format!("cannot create {}: {e}", self.spec.config_dir.display())))?;

        let mut command = node_command(&binary);
        command
            .arg("setup")
            .arg("--config-dir")
            .arg(&self.spec.config_dir)
            .arg("--identity-dir")
            .arg(self.spec.identity_dir());

        let mut child = command
            .spawn()
            .map_err(|e| setup_failed(format!("spawn failed: {e}")))?;
        let pumps = self.forward_output(&mut child);

        let status = child
            .wait()
            .await
            .map_err(|e| setup_failed(format!("wait failed: {e}")))?;
        for pump in pumps {
            let _ = pump.await;
        }

        if !status.success() {
            return Err(setup_failed(format!("setup exited with {status}")));
        }
        debug!(node = %self.spec.name, "Done setting up");
        Ok(())
    }

    /// Clears the explicit-stop flag and launches the node process.
    ///
    /// No-op when the node is already running or being launched.
    pub async fn start(&self) -> Result<(), NodeError> {
        self.state.lock().stop_requested = false;
        self.launch().await
    }

    /// Stops the node without triggering a restart. Idempotent.
    pub async fn stop(&self) {
        let (active, was_stopped) = {
            let mut state = self.state.lock();
            let was_stopped = state.stop_requested && state.phase == NodePhase::Stopped;
            state.stop_requested = true;
            state.launch_epoch += 1;
            state.phase = NodePhase::Stopped;
            (state.active.take(), was_stopped)
        };

        if was_stopped && active.is_none() {
            return;
        }
        info!(node = %self.spec.name, "Stopping ..");

        if let Some(active) = active {
            let _ = active.stop_tx.send(());
            let _ = active.exited_rx.await;
            debug!(node = %self.spec.name, "Stopped");
        }
    }

    async fn launch(&self) -> Result<(), NodeError> {
        let (version, epoch) = {
            let mut state = self.state.lock();
            if state.stop_requested
                || state.active.is_some()
                || state.phase == NodePhase::Starting
            {
                return Ok(());
            }
            state.phase = NodePhase::Starting;
            state.launch_epoch += 1;
            (state.version.clone(), state.launch_epoch)
        };

        info!(node = %self.spec.name, "Starting version {} ..", version);
        let binary = match self.artifacts.ensure(&version).await {
            Ok(path) => path,
            Err(e) => {
                self.abandon_launch(epoch);
                return Err(e.into());
            }
        };

        let mut command = node_command(&binary);
        command
            .arg("run")
            .arg("--config-dir")
            .arg(&self.spec.config_dir)
            .args(&self.spec.extra_args);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.abandon_launch(epoch);
                return Err(NodeError::Spawn {
                    node: self.spec.name.clone(),
                    source,
                });
            }
        };
        self.forward_output(&mut child);

        let pid = child.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();

        let committed = {
            let mut state = self.state.lock();
            if state.stop_requested || state.launch_epoch != epoch {
                None
            } else {
                state.generation += 1;
                state.phase = NodePhase::Running;
                state.active = Some(ActiveProcess {
                    pid,
                    stop_tx,
                    exited_rx,
                });
                Some(state.generation)
            }
        };

        let Some(generation) = committed else {
            debug!(node = %self.spec.name, "Stop requested while starting, discarding process");
            let _ = terminate(&mut child, self.stop_grace).await;
            return Ok(());
        };

        tokio::spawn(self.clone().watch(child, generation, stop_rx, exited_tx));
        debug!(node = %self.spec.name, "Started (pid {:?})", pid);
        Ok(())
    }

    fn abandon_launch(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.launch_epoch == epoch && state.phase == NodePhase::Starting {
            state.phase = NodePhase::Stopped;
        }
    }

    async fn watch(
        self,
        mut child: Child,
        generation: u64,
        mut stop_rx: oneshot::Receiver<()>,
        exited_tx: oneshot::Sender<()>,
    ) {
        let started = Instant::now();
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut stop_rx => terminate(&mut child, self.stop_grace).await,
        };
        let _ = exited_tx.send(());

        let attempt = {
            let mut state = self.state.lock();
            if state.generation != generation || state.stop_requested {
                return;
            }
            state.active = None;
            state.phase = NodePhase::Restarting;
            if started.elapsed() >= STABLE_UPTIME {
                state.restart_attempts = 0;
            }
            let attempt = state.restart_attempts;
            state.restart_attempts += 1;
            attempt
        };

        let status = match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        };
        error!(node = %self.spec.name, "Exited unexpectedly ({}), restarting ..", status);

        self.schedule_restart(generation, attempt).await;
    }

    /// Relaunch loop after an unexpected exit of launch `generation`
    fn schedule_restart(self, generation: u64, mut attempt: u32) -> BoxFuture<'static, ()> {
        async move {
            loop {
                let Some(delay) = self.restart_policy.next_delay(attempt) else {
                    error!(
                        node = %self.spec.name,
                        "Giving up after {} consecutive restart attempts", attempt
                    );
                    let mut state = self.state.lock();
                    if state.generation == generation && !state.stop_requested {
                        state.phase = NodePhase::Stopped;
                    }
                    return;
                };

                debug!(node = %self.spec.name, "Restarting in {:?}", delay);
                tokio::time::sleep(delay).await;

                let superseded = {
                    let state = self.state.lock();
                    state.stop_requested || state.generation != generation
                };
                if superseded {
                    return;
                }

                match self.launch().await {
                    Ok(()) => return,
                    Err(e) => {
                        error!(node = %self.spec.name, "Restart failed: {}", e);
                        attempt += 1;
                        let mut state = self.state.lock();
                        state.restart_attempts = state.restart_attempts.max(attempt);
                        if !state.stop_requested && state.active.is_none() {
                            state.phase = NodePhase::Restarting;
                        }
                    }
                }
            }
        }
        .boxed()
    }

    fn forward_output(&self, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(output::forward_lines(
                stdout,
                self.spec.name.clone(),
                LogLevel::Info,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(output::forward_lines(
                stderr,
                self.spec.name.clone(),
                LogLevel::Error,
            )));
        }
        pumps
    }
}

#[async_trait]
impl NodeControl for NodeSupervisor {
    fn name(&self) -> &str {
        NodeSupervisor::name(self)
    }

    async fn init(&self) -> Result<(), NodeError> {
        NodeSupervisor::init(self).await
    }

    fn is_initialized(&self) -> bool {
        NodeSupervisor::is_initialized(self)
    }

    async fn start(&self) -> Result<(), NodeError> {
        NodeSupervisor::start(self).await
    }

    async fn stop(&self) {
        NodeSupervisor::stop(self).await
    }

    fn set_version(&self, version: Version) {
        NodeSupervisor::set_version(self, version)
    }

    fn status(&self) -> NodeStatus {
        NodeSupervisor::status(self)
    }
}

/// Command for the node binary, run from the binary's own directory
fn node_command(binary: &Path) -> Command {
    let mut command = Command::new(binary);
    if let Some(dir) = binary.parent() {
        command.current_dir(dir);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// Asks the process to exit, killing it once `grace` has elapsed
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => match tokio::time::timeout(grace, child.wait()).await {
                    Ok(status) => return status,
                    Err(_) => warn!("Process {} ignored SIGTERM for {:?}, killing", pid, grace),
                },
                Err(e) => warn!("Failed to send SIGTERM to {}: {}", pid, e),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    child.kill().await?;
    child.wait().await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ArtifactError;
    use crate::policy::{AlwaysWithFixedBackoff, CappedRetries};
    use std::path::PathBuf;

    /// Hands out one prepared binary for every version
    struct FixedBinary(PathBuf);

    #[async_trait]
    impl ArtifactProvider for FixedBinary {
        async fn ensure(&self, _version: &Version) -> Result<PathBuf, ArtifactError> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        log: PathBuf,
        supervisor: NodeSupervisor,
    }

    /// Writes `body` as an executable shell script and wraps it in a supervisor.
    /// Every invocation appends its arguments to `invocations.log`.
    fn fixture(body: &str, policy: Arc<dyn RestartPolicy>) -> Fixture {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let bin_dir = temp.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let log = temp.path().join("invocations.log");
        let script = bin_dir.join("storagenode-1.0.0");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" >> '{}'\n{}\n", log.display(), body),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spec = NodeSpec {
            name: "Node 01".into(),
            config_dir: temp.path().join("node01"),
            enabled: true,
            extra_args: vec![],
        };
        let supervisor = NodeSupervisor::new(
            spec,
            Version::new("1.0.0").unwrap(),
            Arc::new(FixedBinary(script)),
            policy,
        )
        .with_stop_grace(Duration::from_secs(2));

        Fixture {
            _temp: temp,
            log,
            supervisor,
        }
    }

    fn invocations(log: &Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn runs(log: &Path) -> usize {
        invocations(log).iter().filter(|l| l.starts_with("run")).count()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached within 5s");
    }

    fn fast_restarts() -> Arc<dyn RestartPolicy> {
        Arc::new(AlwaysWithFixedBackoff {
            delay: Duration::from_millis(100),
        })
    }

    #[tokio::test]
    async fn test_crashing_node_is_restarted_until_stopped() {
        let f = fixture("exit 3", fast_restarts());

        f.supervisor.start().await.unwrap();
        wait_for(|| runs(&f.log) >= 4).await;
        assert!(f.supervisor.status().restart_attempts >= 3);

        f.supervisor.stop().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let after_stop = runs(&f.log);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(runs(&f.log), after_stop);
        assert_eq!(f.supervisor.status().phase, NodePhase::Stopped);
    }

    #[tokio::test]
    async fn test_explicit_stop_does_not_restart() {
        let f = fixture("exec sleep 30", fast_restarts());

        f.supervisor.start().await.unwrap();
        wait_for(|| runs(&f.log) == 1).await;
        let status = f.supervisor.status();
        assert_eq!(status.phase, NodePhase::Running);
        assert!(status.pid.is_some());

        f.supervisor.stop().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(runs(&f.log), 1);
        let status = f.supervisor.status();
        assert_eq!(status.phase, NodePhase::Stopped);
        assert_eq!(status.pid, None);

        // idempotent
        f.supervisor.stop().await;
        assert_eq!(f.supervisor.status().phase, NodePhase::Stopped);
    }

    #[tokio::test]
    async fn test_start_passes_config_dir_and_ignores_double_start() {
        let f = fixture("exec sleep 30", fast_restarts());

        f.supervisor.start().await.unwrap();
        f.supervisor.start().await.unwrap();
        wait_for(|| runs(&f.log) >= 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let lines = invocations(&f.log);
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            format!("run --config-dir {}", f.supervisor.spec().config_dir.display())
        );
        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_capped_policy_gives_up() {
        let policy = Arc::new(CappedRetries {
            delay: Duration::from_millis(50),
            max_attempts: 2,
        });
        let f = fixture("exit 1", policy);

        f.supervisor.start().await.unwrap();
        wait_for(|| runs(&f.log) == 3 && f.supervisor.status().phase == NodePhase::Stopped).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runs(&f.log), 3);
    }

    #[tokio::test]
    async fn test_restart_after_stop_uses_new_version() {
        let f = fixture("exec sleep 30", fast_restarts());
        f.supervisor.start().await.unwrap();
        f.supervisor.stop().await;

        f.supervisor.set_version(Version::new("1.1.0").unwrap());
        f.supervisor.start().await.unwrap();
        assert_eq!(f.supervisor.status().version.as_str(), "1.1.0");
        assert_eq!(f.supervisor.status().phase, NodePhase::Running);
        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_init_runs_setup_when_config_missing() {
        let body = r#"if [ "$1" = "setup" ]; then
  printf 'console.address: 127.0.0.1:14002\n' > "$3/config.yaml"
  exit 0
fi
exec sleep 30"#;
        let f = fixture(body, fast_restarts());

        f.supervisor.init().await.unwrap();

        let lines = invocations(&f.log);
        let config_dir = f.supervisor.spec().config_dir.display().to_string();
        assert_eq!(
            lines,
            vec![format!("setup --config-dir {config_dir} --identity-dir {config_dir}/identity")]
        );
        let status = f.supervisor.status();
        assert!(status.initialized);
        assert_eq!(status.console_address.as_deref(), Some("127.0.0.1:14002"));
    }

    #[tokio::test]
    async fn test_init_skips_setup_when_config_present() {
        let f = fixture("exit 0", fast_restarts());
        let config_dir = &f.supervisor.spec().config_dir;
        std::fs::create_dir_all(config_dir).unwrap();
        std::fs::write(config_dir.join("config.yaml"), "storage.path: /mnt/data\n").unwrap();

        f.supervisor.init().await.unwrap();
        assert!(invocations(&f.log).is_empty());
        assert!(f.supervisor.is_initialized());
    }

    #[tokio::test]
    async fn test_failed_setup_is_surfaced() {
        let f = fixture("exit 1", fast_restarts());

        let err = f.supervisor.init().await.unwrap_err();
        assert!(matches!(err, NodeError::SetupFailed { .. }));
        assert!(!f.supervisor.is_initialized());
    }

    #[tokio::test]
    async fn test_setup_without_config_is_config_load_error() {
        let f = fixture("exit 0", fast_restarts());

        let err = f.supervisor.init().await.unwrap_err();
        assert!(matches!(err, NodeError::ConfigLoad { .. }));
    }

    #[tokio::test]
    async fn test_malformed_config_is_config_load_error() {
        let f = fixture("exit 0", fast_restarts());
        let config_dir = &f.supervisor.spec().config_dir;
        std::fs::create_dir_all(config_dir).unwrap();
        std::fs::write(config_dir.join("config.yaml"), "key: [unclosed\n").unwrap();

        let err = f.supervisor.init().await.unwrap_err();
        assert!(matches!(err, NodeError::ConfigLoad { .. }));
        assert!(invocations(&f.log).is_empty());
    }
}
