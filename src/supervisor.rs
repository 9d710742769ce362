//! The restart loop: spawn the child, watch for stale output, terminate,
//! repeat until shutdown.

use crate::backoff::backoff_delay;
use crate::child::{ChildProcess, SpawnError};
use crate::config::StokerConfig;
use crate::reader::{OutputLine, Reader, StreamSource};
use crate::signals::ShutdownSignal;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time;

/// Runtime settings for one supervisor, resolved from file config at the
/// edge so everything in here works in plain `Duration`s.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Silence longer than this restarts the child.
    pub stale_timeout: Duration,
    /// Bounded-wait granularity of the receive loop.
    pub poll_interval: Duration,
    /// How long teardown waits between SIGTERM and SIGKILL.
    pub term_grace: Duration,
    pub spawn_backoff_initial: Duration,
    pub spawn_backoff_max: Duration,
    /// Consecutive spawn failures tolerated before giving up.
    pub max_spawn_failures: u32,
    /// Stop after this many generations; None means run forever.
    pub max_generations: Option<u64>,
}

impl SupervisorConfig {
    pub fn from_config(config: &StokerConfig) -> Self {
        Self {
            command: config.child.command.clone(),
            args: config.child.args.clone(),
            stale_timeout: Duration::from_secs(config.watchdog.stale_timeout_secs),
            poll_interval: Duration::from_secs(config.watchdog.poll_interval_secs),
            term_grace: Duration::from_secs(config.watchdog.term_grace_secs),
            spawn_backoff_initial: Duration::from_secs(config.backoff.initial_delay_secs),
            spawn_backoff_max: Duration::from_secs(config.backoff.max_delay_secs),
            max_spawn_failures: config.backoff.max_spawn_failures,
            max_generations: config.max_generations,
        }
    }
}

/// Errors that end the supervision loop.
#[derive(Debug)]
pub enum SuperviseError {
    /// Spawning failed and the retry budget is exhausted.
    Spawn { source: SpawnError },
    /// Writing pass-through output failed (our own stdout/stderr is gone).
    Output { source: std::io::Error },
    /// Waiting on the child failed.
    Reap { source: std::io::Error },
}

impl std::fmt::Display for SuperviseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuperviseError::Spawn { source } => {
                write!(f, "giving up on spawning the child: {}", source)
            }
            SuperviseError::Output { source } => {
                write!(f, "failed to write pass-through output: {}", source)
            }
            SuperviseError::Reap { source } => {
                write!(f, "failed to reap child process: {}", source)
            }
        }
    }
}

impl std::error::Error for SuperviseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SuperviseError::Spawn { source } => Some(source),
            SuperviseError::Output { source } => Some(source),
            SuperviseError::Reap { source } => Some(source),
        }
    }
}

impl From<SpawnError> for SuperviseError {
    fn from(source: SpawnError) -> Self {
        SuperviseError::Spawn { source }
    }
}

/// What ended one generation.
#[derive(Debug)]
enum GenerationEnd {
    /// No output for longer than the stale timeout.
    Stalled { silent_for: Duration },
    /// Shutdown was requested.
    Interrupted,
}

#[derive(Debug)]
struct GenerationOutcome {
    end: GenerationEnd,
    lines: u64,
    /// None when shutdown arrived before a child was ever spawned.
    status: Option<ExitStatus>,
}

/// Totals reported when the loop stops.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub generations: u64,
    pub lines: u64,
    pub interrupted: bool,
}

/// Owns the restart loop and the pass-through sinks.
pub struct Supervisor {
    config: SupervisorConfig,
    shutdown: ShutdownSignal,
    /// Live child pid, published for the second-signal escalation path.
    child_pid: Arc<AtomicU32>,
    out: Box<dyn AsyncWrite + Send + Unpin>,
    err: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Supervisor {
    /// Pass-through goes to the process's own stdout and stderr.
    pub fn new(
        config: SupervisorConfig,
        shutdown: ShutdownSignal,
        child_pid: Arc<AtomicU32>,
    ) -> Supervisor {
        Supervisor {
            config,
            shutdown,
            child_pid,
            out: Box::new(tokio::io::stdout()),
            err: Box::new(tokio::io::stderr()),
        }
    }

    /// Replace the pass-through sinks. Tests capture output this way.
    #[allow(dead_code)]
    pub fn with_output<O, E>(mut self, out: O, err: E) -> Supervisor
    where
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        self.out = Box::new(out);
        self.err = Box::new(err);
        self
    }

    /// Run generations until shutdown is requested or the generation cap is
    /// reached. Returns totals for the whole run.
    pub async fn run(&mut self) -> Result<RunSummary, SuperviseError> {
        tracing::info!(
            command = %self.config.command,
            args = ?self.config.args,
            stale_timeout_secs = self.config.stale_timeout.as_secs_f64(),
            "supervisor starting"
        );
        let mut summary = RunSummary::default();
        while !self.shutdown.is_requested() && !self.cap_reached(summary.generations) {
            let generation = summary.generations + 1;
            let outcome = self.run_generation(generation).await?;
            if outcome.status.is_some() {
                summary.generations = generation;
            }
            summary.lines += outcome.lines;
            match outcome.end {
                GenerationEnd::Interrupted => {
                    summary.interrupted = true;
                    break;
                }
                GenerationEnd::Stalled { silent_for } => {
                    tracing::info!(
                        generation,
                        lines = outcome.lines,
                        silent_secs = silent_for.as_secs_f64(),
                        exit_code = ?outcome.status.and_then(|s| s.code()),
                        "child restarted after stale output"
                    );
                }
            }
        }
        if self.shutdown.is_requested() {
            summary.interrupted = true;
        }
        tracing::info!(
            generations = summary.generations,
            lines = summary.lines,
            interrupted = summary.interrupted,
            "supervisor stopped"
        );
        Ok(summary)
    }

    /// Whether the completed-generation count has reached the configured
    /// cap. Checked before each spawn, so a cap of zero runs nothing.
    fn cap_reached(&self, completed: u64) -> bool {
        self.config.max_generations.is_some_and(|max| completed >= max)
    }

    /// One child generation: spawn, pump output until it goes stale or
    /// shutdown arrives, then tear everything down.
    async fn run_generation(
        &mut self,
        generation: u64,
    ) -> Result<GenerationOutcome, SuperviseError> {
        let mut child = match self.spawn_with_backoff().await? {
            Some(child) => child,
            None => {
                return Ok(GenerationOutcome {
                    end: GenerationEnd::Interrupted,
                    lines: 0,
                    status: None,
                })
            }
        };
        self.child_pid.store(child.id(), Ordering::Release);
        tracing::info!(generation, pid = child.id(), "child started");

        let (stdout, stderr) = match child.take_streams() {
            Ok(streams) => streams,
            Err(e) => {
                child.terminate();
                let _ = child.reap().await;
                self.child_pid.store(0, Ordering::Release);
                return Err(e.into());
            }
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = Reader::spawn(stdout, stderr, tx);

        let mut shutdown = self.shutdown.clone();
        // Time of last observed output, or process start.
        let mut deadline = Instant::now();
        let mut lines: u64 = 0;
        let mut streams_open = true;

        let end = loop {
            if streams_open {
                tokio::select! {
                    _ = shutdown.requested() => break GenerationEnd::Interrupted,
                    polled = time::timeout(self.config.poll_interval, rx.recv()) => match polled {
                        Ok(Some(line)) => {
                            self.forward(&line).await?;
                            deadline = line.at;
                            lines += 1;
                        }
                        Ok(None) => {
                            tracing::debug!(generation, "child closed its output streams");
                            streams_open = false;
                        }
                        Err(_) => {
                            if deadline.elapsed() > self.config.stale_timeout {
                                break GenerationEnd::Stalled { silent_for: deadline.elapsed() };
                            }
                        }
                    },
                }
            } else {
                // The channel is closed, but the restart decision still
                // belongs to the deadline check at the poll cadence.
                tokio::select! {
                    _ = shutdown.requested() => break GenerationEnd::Interrupted,
                    _ = time::sleep(self.config.poll_interval) => {
                        if deadline.elapsed() > self.config.stale_timeout {
                            break GenerationEnd::Stalled { silent_for: deadline.elapsed() };
                        }
                    }
                }
            }
        };

        if let GenerationEnd::Stalled { .. } = end {
            self.emit_restart_notice().await?;
        }

        child.terminate();
        drop(rx); // queued lines from the old generation are discarded
        self.join_with_grace(reader, &child).await;
        let status = child
            .reap()
            .await
            .map_err(|e| SuperviseError::Reap { source: e })?;
        self.child_pid.store(0, Ordering::Release);
        tracing::debug!(generation, exit_code = ?status.code(), "child reaped");

        Ok(GenerationOutcome {
            end,
            lines,
            status: Some(status),
        })
    }

    /// Spawn the child, retrying with exponential backoff on failure.
    ///
    /// Returns None if shutdown was requested before a spawn succeeded.
    async fn spawn_with_backoff(&mut self) -> Result<Option<ChildProcess>, SuperviseError> {
        let mut failures: u32 = 0;
        loop {
            if self.shutdown.is_requested() {
                return Ok(None);
            }
            match ChildProcess::spawn(&self.config.command, &self.config.args) {
                Ok(child) => return Ok(Some(child)),
                Err(e) => {
                    failures += 1;
                    if failures > self.config.max_spawn_failures {
                        tracing::error!(
                            failures,
                            error = %e,
                            "giving up after repeated spawn failures"
                        );
                        return Err(e.into());
                    }
                    let delay = backoff_delay(
                        self.config.spawn_backoff_initial,
                        failures - 1,
                        self.config.spawn_backoff_max,
                    );
                    tracing::warn!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "spawn failed, retrying after backoff"
                    );
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = shutdown.requested() => return Ok(None),
                        _ = time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Join the reader pumps, escalating to SIGKILL if the child keeps its
    /// streams open past the termination grace.
    async fn join_with_grace(&self, reader: Reader, child: &ChildProcess) {
        let join = reader.join();
        tokio::pin!(join);
        if time::timeout(self.config.term_grace, &mut join).await.is_err() {
            tracing::warn!(
                pid = child.id(),
                grace_secs = self.config.term_grace.as_secs_f64(),
                "child streams still open after termination grace, force killing"
            );
            child.force_kill();
            join.await;
        }
    }

    /// Write one line to the sink matching its source stream, verbatim.
    async fn forward(&mut self, line: &OutputLine) -> Result<(), SuperviseError> {
        let sink = match line.source {
            StreamSource::Stdout => &mut self.out,
            StreamSource::Stderr => &mut self.err,
        };
        sink.write_all(line.text.as_bytes())
            .await
            .map_err(|e| SuperviseError::Output { source: e })?;
        sink.flush()
            .await
            .map_err(|e| SuperviseError::Output { source: e })
    }

    /// The user-facing restart notice goes to the pass-through stdout sink
    /// so it interleaves with the child's own output.
    async fn emit_restart_notice(&mut self) -> Result<(), SuperviseError> {
        let notice = format!(
            "No output in {} seconds. Restarting script...\n",
            format_secs(self.config.stale_timeout)
        );
        self.out
            .write_all(notice.as_bytes())
            .await
            .map_err(|e| SuperviseError::Output { source: e })?;
        self.out
            .flush()
            .await
            .map_err(|e| SuperviseError::Output { source: e })
    }
}

/// Render a duration for the restart notice: whole seconds stay integral
/// ("3"), fractional values keep their fraction ("0.3").
fn format_secs(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        d.as_secs().to_string()
    } else {
        d.as_secs_f64().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn test_config(command: &str, args: &[&str]) -> SupervisorConfig {
        SupervisorConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            stale_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(50),
            term_grace: Duration::from_secs(2),
            spawn_backoff_initial: Duration::from_millis(10),
            spawn_backoff_max: Duration::from_millis(40),
            max_spawn_failures: 2,
            max_generations: None,
        }
    }

    fn sh_config(script: &str) -> SupervisorConfig {
        test_config("sh", &["-c", script])
    }

    async fn run_capture(
        config: SupervisorConfig,
        shutdown: ShutdownSignal,
        child_pid: Arc<AtomicU32>,
    ) -> (Result<RunSummary, SuperviseError>, String, String) {
        let (mut out_capture, out_sink) = tokio::io::duplex(64 * 1024);
        let (mut err_capture, err_sink) = tokio::io::duplex(64 * 1024);
        let mut supervisor =
            Supervisor::new(config, shutdown, child_pid).with_output(out_sink, err_sink);
        let result = supervisor.run().await;
        drop(supervisor);

        let mut out = String::new();
        out_capture.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        err_capture.read_to_string(&mut err).await.unwrap();
        (result, out, err)
    }

    async fn run_default(
        config: SupervisorConfig,
    ) -> (Result<RunSummary, SuperviseError>, String, String) {
        let (_trigger, shutdown) = ShutdownSignal::manual();
        run_capture(config, shutdown, Arc::new(AtomicU32::new(0))).await
    }

    #[test]
    fn notice_seconds_render_cleanly() {
        assert_eq!(format_secs(Duration::from_secs(3)), "3");
        assert_eq!(format_secs(Duration::from_millis(300)), "0.3");
        assert_eq!(format_secs(Duration::from_millis(1500)), "1.5");
    }

    #[tokio::test]
    async fn passes_lines_through_in_order() {
        let mut config = sh_config("printf 'one\\ntwo\\nthree\\n'; sleep 30");
        config.max_generations = Some(1);
        let (result, out, _err) = run_default(config).await;
        let summary = result.unwrap();
        assert_eq!(summary.generations, 1);
        assert_eq!(summary.lines, 3);
        assert_eq!(
            out,
            "one\ntwo\nthree\nNo output in 0.3 seconds. Restarting script...\n"
        );
    }

    #[tokio::test]
    async fn restarts_a_silent_child_within_the_window() {
        let start = Instant::now();
        let mut config = sh_config("sleep 30");
        config.max_generations = Some(1);
        let (result, out, _err) = run_default(config).await;
        let elapsed = start.elapsed();
        let summary = result.unwrap();
        assert_eq!(summary.generations, 1);
        assert_eq!(summary.lines, 0);
        assert_eq!(out, "No output in 0.3 seconds. Restarting script...\n");
        // Declared no earlier than the timeout, and well within timeout +
        // poll interval once teardown slack is allowed for.
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn output_resets_the_deadline() {
        // Emits every 150 ms, well under the 300 ms timeout, then hangs.
        let mut config = sh_config(
            "i=0; while [ $i -lt 5 ]; do echo tick-$i; i=$((i+1)); sleep 0.15; done; sleep 30",
        );
        config.max_generations = Some(1);
        let start = Instant::now();
        let (result, out, _err) = run_default(config).await;
        let summary = result.unwrap();
        assert_eq!(summary.lines, 5);
        assert_eq!(
            out,
            "tick-0\ntick-1\ntick-2\ntick-3\ntick-4\nNo output in 0.3 seconds. Restarting script...\n"
        );
        // Four sleeps before the last tick, then the stale timeout.
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn child_exit_defers_restart_until_the_timeout() {
        let start = Instant::now();
        let mut config = sh_config("echo once");
        config.max_generations = Some(1);
        let (result, out, _err) = run_default(config).await;
        let summary = result.unwrap();
        assert_eq!(summary.lines, 1);
        assert_eq!(out, "once\nNo output in 0.3 seconds. Restarting script...\n");
        // The child exits immediately, but the restart decision still waits
        // for the stale timeout instead of spinning on the closed channel.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn generations_run_sequentially_with_distinct_children() {
        let mut config = sh_config("echo pid-$$; sleep 30");
        config.max_generations = Some(2);
        let (result, out, _err) = run_default(config).await;
        let summary = result.unwrap();
        assert_eq!(summary.generations, 2);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("pid-"));
        assert!(lines[1].starts_with("No output in"));
        assert!(lines[2].starts_with("pid-"));
        assert!(lines[3].starts_with("No output in"));
        assert_ne!(lines[0], lines[2], "each generation must be a new child");
    }

    #[tokio::test]
    async fn zero_generation_cap_never_spawns() {
        let mut config = sh_config("echo never; sleep 30");
        config.max_generations = Some(0);
        let (result, out, _err) = run_default(config).await;
        let summary = result.unwrap();
        assert_eq!(summary.generations, 0);
        assert_eq!(summary.lines, 0);
        assert!(!summary.interrupted);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn stderr_lines_pass_through_and_count_as_liveness() {
        let start = Instant::now();
        let mut config = sh_config(
            "i=0; while [ $i -lt 3 ]; do echo err-$i >&2; i=$((i+1)); sleep 0.15; done; sleep 30",
        );
        config.max_generations = Some(1);
        let (result, out, err) = run_default(config).await;
        let summary = result.unwrap();
        assert_eq!(summary.lines, 3);
        assert_eq!(err, "err-0\nerr-1\nerr-2\n");
        assert_eq!(out, "No output in 0.3 seconds. Restarting script...\n");
        // Two sleeps before the last stderr line, then the stale timeout.
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn force_kills_a_term_ignoring_child_after_the_grace() {
        let start = Instant::now();
        // The shell ignores TERM (its sleeps inherit the disposition), so
        // teardown must escalate to SIGKILL once the grace expires.
        let mut config = sh_config("trap '' TERM; echo ready; while :; do sleep 30; done");
        config.term_grace = Duration::from_millis(400);
        config.max_generations = Some(1);
        let (result, out, _err) = run_default(config).await;
        let summary = result.unwrap();
        assert_eq!(summary.generations, 1);
        assert_eq!(out, "ready\nNo output in 0.3 seconds. Restarting script...\n");
        let elapsed = start.elapsed();
        // Stale timeout first, then the full grace before the escalation.
        assert!(elapsed >= Duration::from_millis(700), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn shutdown_terminates_and_reaps_the_child() {
        let (trigger, shutdown) = ShutdownSignal::manual();
        let child_pid = Arc::new(AtomicU32::new(0));
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(200)).await;
            trigger.trigger();
        });
        let (result, out, _err) = run_capture(
            sh_config("echo $$; sleep 30"),
            shutdown,
            Arc::clone(&child_pid),
        )
        .await;
        let summary = result.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.generations, 1);
        assert!(!out.contains("No output in"));
        assert_eq!(child_pid.load(Ordering::Acquire), 0);

        // The child must already be gone when run() returns.
        let pid: i32 = out.trim().parse().unwrap();
        assert!(nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err());
    }

    #[tokio::test]
    async fn already_requested_shutdown_prevents_any_spawn() {
        let (trigger, shutdown) = ShutdownSignal::manual();
        trigger.trigger();
        let (result, out, _err) = run_capture(
            sh_config("echo nope; sleep 30"),
            shutdown,
            Arc::new(AtomicU32::new(0)),
        )
        .await;
        let summary = result.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.generations, 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn spawn_failures_exhaust_the_retry_budget() {
        let config = test_config("/nonexistent/stoker-test-binary", &[]);
        let (result, _out, _err) = run_default(config).await;
        let err = result.unwrap_err();
        assert!(matches!(err, SuperviseError::Spawn { .. }));
        assert!(err.to_string().contains("giving up"));
    }

    #[tokio::test]
    async fn shutdown_during_spawn_backoff_exits_cleanly() {
        let (trigger, shutdown) = ShutdownSignal::manual();
        let mut config = test_config("/nonexistent/stoker-test-binary", &[]);
        config.spawn_backoff_initial = Duration::from_millis(500);
        config.spawn_backoff_max = Duration::from_millis(500);
        config.max_spawn_failures = 10;
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });
        let (result, out, _err) =
            run_capture(config, shutdown, Arc::new(AtomicU32::new(0))).await;
        let summary = result.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.generations, 0);
        assert!(out.is_empty());
    }
}
