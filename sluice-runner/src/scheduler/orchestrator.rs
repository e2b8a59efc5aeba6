//! Pipeline orchestrator
//!
//! Owns a validated pipeline definition and drives runs of it:
//! - Dispatches every pending stage whose dependencies all succeeded, bounded
//!   by the worker limit
//! - Marks transitive dependents of a failed or cancelled stage as skipped
//! - On cancellation, cancels pending stages, signals running ones, and aborts
//!   workers that outlive the grace period
//! - Persists the run and its logs after every transition

use chrono::Utc;
use sluice_core::domain::log::{LogEntry, LogLevel};
use sluice_core::domain::pipeline::PipelineDefinition;
use sluice_core::domain::run::{
    FailureKind, Run, RunOutcome, RunStatus, StageResult, StageStatus, Trigger,
};
use sluice_core::error::DefinitionError;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::context::StageContext;
use crate::graph::DependencyGraph;
use crate::service::{InMemoryLogBuffer, LogBufferService, RunHistory, StageService};
use crate::workspace::WorkspaceManager;

/// Extra time given to stage workers after the cancellation grace period, so
/// the executor's own SIGKILL lands before the worker is aborted
const ABORT_MARGIN: Duration = Duration::from_secs(1);

type StageOutcome = (String, StageResult);

pub struct PipelineOrchestrator {
    definition: Arc<PipelineDefinition>,
    stages: Arc<dyn StageService>,
    history: Arc<dyn RunHistory>,
    workspaces: WorkspaceManager,
    worker_limit: usize,
    cancel_grace: Duration,
    variables: BTreeMap<String, String>,

    /// Cancellation tokens of runs created or executing in this process
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator for `definition`
    ///
    /// # Errors
    /// Any `DefinitionError` from building the dependency graph. No run of an
    /// invalid definition can ever start.
    pub fn new(
        definition: Arc<PipelineDefinition>,
        stages: Arc<dyn StageService>,
        history: Arc<dyn RunHistory>,
        config: &RunnerConfig,
    ) -> Result<Self, DefinitionError> {
        DependencyGraph::build(&definition)?;

        let workspaces = WorkspaceManager::new(config.workspace_base.clone())
            .with_source(config.source_dir.clone())
            .keep_workspaces(config.keep_workspaces);

        Ok(Self {
            definition,
            stages,
            history,
            workspaces,
            worker_limit: config.worker_limit.max(1),
            cancel_grace: config.cancel_grace,
            variables: config.variables.clone(),
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn history(&self) -> &Arc<dyn RunHistory> {
        &self.history
    }

    /// Creates a run with every stage pending; it can be cancelled from now on
    pub fn create_run(&self, trigger: Trigger) -> Run {
        let run = Run::new(&self.definition, trigger);
        self.register(run.id);
        run
    }

    /// Requests cancellation of a run
    ///
    /// Returns `false` if the run is unknown or already finished.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(&run_id) {
            Some(token) => {
                info!(run_id = %run_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains_key(&run_id)
    }

    /// Number of runs currently executing
    pub fn active_runs(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Executes `run` and returns its outcome
    pub async fn start(&self, run: Run) -> RunOutcome {
        self.execute(run)
            .await
            .outcome()
            .unwrap_or(RunOutcome::Failed)
    }

    /// Executes `run` and returns the final record
    ///
    /// Every stage of the returned run is in a terminal state.
    pub async fn execute(&self, mut run: Run) -> Run {
        let token = self.register(run.id);
        if run.cancel_requested {
            token.cancel();
        }
        let logs: Arc<dyn LogBufferService> = Arc::new(InMemoryLogBuffer::new());

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        info!(
            run_id = %run.id,
            pipeline = %run.pipeline,
            branch = %run.trigger.branch,
            commit = %run.trigger.commit_ref,
            "Starting run"
        );
        logs.add_entry(LogEntry::new(
            LogLevel::Info,
            format!(
                "Run of '{}' started for {} at {}",
                run.pipeline, run.trigger.branch, run.trigger.commit_ref
            ),
        ));
        self.persist(&run, &logs).await;

        match DependencyGraph::build(&self.definition) {
            Ok(graph) => self.drive(&mut run, &graph, &token, &logs).await,
            Err(e) => {
                error!(run_id = %run.id, "Invalid pipeline definition: {}", e);
                for stage in run.stages.values_mut() {
                    let _ = stage.conclude(StageStatus::Skipped, None, e.to_string());
                }
            }
        }

        let outcome = run.conclude();
        info!(run_id = %run.id, outcome = %outcome, "Run finished");
        logs.add_entry(LogEntry::new(
            LogLevel::Info,
            format!("Run finished: {}", outcome),
        ));
        self.persist(&run, &logs).await;

        self.unregister(run.id);
        self.workspaces.cleanup(run.id).await;
        run
    }

    async fn drive(
        &self,
        run: &mut Run,
        graph: &DependencyGraph,
        token: &CancellationToken,
        logs: &Arc<dyn LogBufferService>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.worker_limit));
        let mut workers: JoinSet<StageOutcome> = JoinSet::new();
        let mut tasks: HashMap<Id, String> = HashMap::new();

        while !token.is_cancelled() {
            if self.dispatch_ready(run, graph, token, logs, &semaphore, &mut workers, &mut tasks) {
                self.persist(run, logs).await;
            }
            if workers.is_empty() {
                break;
            }

            tokio::select! {
                joined = workers.join_next_with_id() => {
                    if let Some(joined) = joined {
                        self.complete(run, graph, &mut tasks, joined, logs);
                        self.persist(run, logs).await;
                    }
                }
                _ = token.cancelled() => {}
            }
        }

        if token.is_cancelled() {
            self.wind_down(run, graph, workers, tasks, logs).await;
        }

        // Unreachable for a valid graph; keeps the no-pending-stage guarantee
        for (name, stage) in run.stages.iter_mut() {
            if stage.status == StageStatus::Pending {
                warn!(run_id = %run.id, stage = %name, "Stage was never dispatched");
                let _ = stage.conclude(StageStatus::Skipped, None, "stage was never dispatched");
            }
        }
    }

    /// Starts every ready stage the worker limit allows
    #[allow(clippy::too_many_arguments)]
    fn dispatch_ready(
        &self,
        run: &mut Run,
        graph: &DependencyGraph,
        token: &CancellationToken,
        logs: &Arc<dyn LogBufferService>,
        semaphore: &Arc<Semaphore>,
        workers: &mut JoinSet<StageOutcome>,
        tasks: &mut HashMap<Id, String>,
    ) -> bool {
        let mut dispatched = false;

        for name in graph.topological_order() {
            let pending = run
                .stage(name)
                .is_some_and(|s| s.status == StageStatus::Pending);
            let ready = pending
                && graph.dependencies(name).iter().all(|dep| {
                    run.stage(dep)
                        .is_some_and(|s| s.status == StageStatus::Succeeded)
                });
            if !ready {
                continue;
            }

            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                debug!(run_id = %run.id, "Worker limit reached, {} waits", name);
                break;
            };

            if let Some(stage) = run.stage_mut(name) {
                let _ = stage.transition(StageStatus::Running);
            }
            debug!(run_id = %run.id, stage = %name, "Dispatching stage");

            let worker = self.stage_worker(run, name.to_string(), token.clone(), logs, permit);
            let handle = workers.spawn(worker);
            tasks.insert(handle.id(), name.to_string());
            dispatched = true;
        }

        dispatched
    }

    fn stage_worker(
        &self,
        run: &Run,
        name: String,
        cancel: CancellationToken,
        logs: &Arc<dyn LogBufferService>,
        permit: OwnedSemaphorePermit,
    ) -> impl Future<Output = StageOutcome> + Send + 'static {
        let definition = Arc::clone(&self.definition);
        let stages = Arc::clone(&self.stages);
        let workspaces = self.workspaces.clone();
        let logs = Arc::clone(logs);
        let run_id = run.id;
        let mut variables = self.run_variables(run);

        async move {
            // Released when the stage finishes
            let _permit = permit;

            let Some(stage) = definition.stage(&name) else {
                return (name, failed(FailureKind::StepExecution, "stage is not defined"));
            };

            let workspace = match workspaces.prepare(run_id, &name).await {
                Ok(dir) => dir,
                Err(e) => {
                    error!(run_id = %run_id, stage = %name, "Workspace preparation failed: {:#}", e);
                    logs.add_entry(
                        LogEntry::new(LogLevel::Error, format!("Workspace preparation failed: {:#}", e))
                            .for_stage(name.clone()),
                    );
                    let reason = format!("workspace preparation failed: {:#}", e);
                    return (name, failed(FailureKind::Workspace, reason));
                }
            };

            variables.insert(
                "SLUICE_WORKSPACE".to_string(),
                workspace.display().to_string(),
            );
            let ctx = StageContext::new(run_id, name.clone(), workspace, variables, logs);
            let result = stages.run(stage, &ctx, cancel).await;
            (name, result)
        }
    }

    /// Records a finished worker and skips the dependents of a stage that did not succeed
    fn complete(
        &self,
        run: &mut Run,
        graph: &DependencyGraph,
        tasks: &mut HashMap<Id, String>,
        joined: Result<(Id, StageOutcome), JoinError>,
        logs: &Arc<dyn LogBufferService>,
    ) {
        let (name, result) = match joined {
            Ok((id, (name, result))) => {
                tasks.remove(&id);
                (name, result)
            }
            Err(e) => {
                let Some(name) = tasks.remove(&e.id()) else {
                    return;
                };
                let result = if e.is_cancelled() {
                    warn!(run_id = %run.id, stage = %name, "Stage aborted after the grace period");
                    let mut result = failed(
                        FailureKind::Cancelled,
                        "stage did not stop within the cancellation grace period",
                    );
                    result.status = StageStatus::Cancelled;
                    result
                } else {
                    error!(run_id = %run.id, stage = %name, "Stage worker panicked");
                    failed(FailureKind::StepExecution, "stage worker panicked")
                };
                (name, result)
            }
        };

        let mut result = result;
        if !result.status.is_terminal() || result.status == StageStatus::Skipped {
            warn!(
                run_id = %run.id,
                stage = %name,
                "Stage returned non-final status {}",
                result.status
            );
            result.reason = Some(format!("stage ended in status {}", result.status));
            result.status = StageStatus::Failed;
            result.finished_at = Some(Utc::now());
            result.failure = Some(FailureKind::StepExecution);
        }

        let status = result.status;
        info!(run_id = %run.id, stage = %name, status = %status, "Stage finished");
        run.stages.insert(name.clone(), result);

        if status == StageStatus::Succeeded {
            return;
        }

        for dependent in graph.transitive_dependents(&name) {
            let Some(stage) = run.stages.get_mut(dependent) else {
                continue;
            };
            if stage.status != StageStatus::Pending {
                continue;
            }
            let reason = format!("dependency '{}' {}", name, status);
            info!(run_id = %run.id, stage = %dependent, "Skipping stage: {}", reason);
            logs.add_entry(
                LogEntry::new(LogLevel::Warning, format!("Skipped: {}", reason))
                    .for_stage(dependent),
            );
            let _ = stage.conclude(
                StageStatus::Skipped,
                Some(FailureKind::DependencyFailed),
                reason,
            );
        }
    }

    /// Cancels pending stages, then waits out running workers up to the grace period
    async fn wind_down(
        &self,
        run: &mut Run,
        graph: &DependencyGraph,
        mut workers: JoinSet<StageOutcome>,
        mut tasks: HashMap<Id, String>,
        logs: &Arc<dyn LogBufferService>,
    ) {
        run.cancel_requested = true;
        warn!(run_id = %run.id, running = workers.len(), "Cancelling run");
        logs.add_entry(LogEntry::new(LogLevel::Warning, "Run cancellation requested"));

        for stage in run.stages.values_mut() {
            if stage.status == StageStatus::Pending {
                let _ = stage.conclude(
                    StageStatus::Cancelled,
                    Some(FailureKind::Cancelled),
                    "run cancelled before the stage started",
                );
            }
        }
        self.persist(run, logs).await;

        let deadline = tokio::time::Instant::now() + self.cancel_grace + ABORT_MARGIN;
        loop {
            match tokio::time::timeout_at(deadline, workers.join_next_with_id()).await {
                Ok(Some(joined)) => {
                    self.complete(run, graph, &mut tasks, joined, logs);
                    self.persist(run, logs).await;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        run_id = %run.id,
                        "Aborting {} stage worker(s) after the grace period",
                        workers.len()
                    );
                    workers.abort_all();
                    while let Some(joined) = workers.join_next_with_id().await {
                        self.complete(run, graph, &mut tasks, joined, logs);
                    }
                    self.persist(run, logs).await;
                    break;
                }
            }
        }
    }

    /// Environment every step of `run` receives
    fn run_variables(&self, run: &Run) -> BTreeMap<String, String> {
        let mut variables = self.variables.clone();
        variables.insert("SLUICE_RUN_ID".to_string(), run.id.to_string());
        variables.insert("SLUICE_PIPELINE".to_string(), run.pipeline.clone());
        variables.insert("SLUICE_BRANCH".to_string(), run.trigger.branch.clone());
        variables.insert("SLUICE_COMMIT".to_string(), run.trigger.commit_ref.clone());
        variables
    }

    async fn persist(&self, run: &Run, logs: &Arc<dyn LogBufferService>) {
        if let Err(e) = self.history.save(run).await {
            warn!(run_id = %run.id, "Failed to store run: {}", e);
        }
        let entries = logs.drain();
        if let Err(e) = self.history.append_logs(run.id, &entries).await {
            warn!(run_id = %run.id, "Failed to store {} log entries: {}", entries.len(), e);
        }
    }

    fn register(&self, run_id: Uuid) -> CancellationToken {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.entry(run_id).or_default().clone()
    }

    fn unregister(&self, run_id: Uuid) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&run_id);
    }
}

/// A stage result that failed without running any step
fn failed(kind: FailureKind, reason: impl Into<String>) -> StageResult {
    let mut result = StageResult::pending();
    let _ = result.transition(StageStatus::Running);
    let _ = result.conclude(StageStatus::Failed, Some(kind), reason);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::InMemorySecretStore;
    use crate::service::{InMemoryRunHistory, StageRunner};
    use crate::test_support::{ScriptedExecutor, pipeline, secret_step, stage, step};
    use sluice_core::domain::pipeline::StageDefinition;
    use std::time::Instant;

    struct Harness {
        executor: Arc<ScriptedExecutor>,
        history: Arc<InMemoryRunHistory>,
        orchestrator: Arc<PipelineOrchestrator>,
        _workspaces: tempfile::TempDir,
    }

    fn harness(
        stages: Vec<StageDefinition>,
        secrets: InMemorySecretStore,
        configure: impl FnOnce(&mut RunnerConfig),
    ) -> Harness {
        let workspaces = tempfile::tempdir().unwrap();
        let mut config = RunnerConfig::new(workspaces.path().to_path_buf());
        config.cancel_grace = Duration::from_millis(100);
        configure(&mut config);

        let executor = Arc::new(ScriptedExecutor::new());
        let history = Arc::new(InMemoryRunHistory::new());
        let runner = StageRunner::new(executor.clone(), Arc::new(secrets), config.step_timeout);
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(pipeline(stages)),
            Arc::new(runner),
            history.clone(),
            &config,
        )
        .unwrap();

        Harness {
            executor,
            history,
            orchestrator: Arc::new(orchestrator),
            _workspaces: workspaces,
        }
    }

    fn node_app(test: &str, build: &str, deploy_secret: &str) -> Vec<StageDefinition> {
        vec![
            stage("test", &[], vec![step("npm-test", test)]),
            stage(
                "build-and-push",
                &["test"],
                vec![
                    step("build", build),
                    secret_step("push", "ok", "DOCKER_PASSWORD", "DOCKER_PASSWORD"),
                ],
            ),
            stage(
                "deploy",
                &["build-and-push"],
                vec![secret_step("apply", "print:deployed", "KUBECONFIG_DATA", deploy_secret)],
            ),
        ]
    }

    fn secrets() -> InMemorySecretStore {
        InMemorySecretStore::new()
            .with_secret("DOCKER_PASSWORD", "d0cker-pa55")
            .with_secret("KUBE_CONFIG", "apiVersion: v1")
    }

    fn status(run: &Run, stage: &str) -> StageStatus {
        run.stage(stage).unwrap().status
    }

    async fn wait_for_running(h: &Harness, run_id: Uuid, stage: &str) {
        for _ in 0..200 {
            if let Some(run) = h.history.get(run_id).await.unwrap() {
                if run.stage(stage).is_some_and(|s| s.status == StageStatus::Running) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stage {} never started", stage);
    }

    #[test]
    fn test_invalid_definition_is_rejected_up_front() {
        let definition = pipeline(vec![
            stage("a", &["b"], vec![step("x", "ok")]),
            stage("b", &["a"], vec![step("y", "ok")]),
        ]);
        let result = PipelineOrchestrator::new(
            Arc::new(definition),
            Arc::new(StageRunner::new(
                Arc::new(ScriptedExecutor::new()),
                Arc::new(InMemorySecretStore::new()),
                Duration::from_secs(1),
            )),
            Arc::new(InMemoryRunHistory::new()),
            &RunnerConfig::default(),
        );

        assert!(matches!(result, Err(DefinitionError::Cycle { .. })));
    }

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let h = harness(node_app("ok", "ok", "KUBE_CONFIG"), secrets(), |_| {});
        let run = h.orchestrator.create_run(Trigger::push("main", "abc123"));

        let run = h.orchestrator.execute(run).await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.outcome(), Some(RunOutcome::Succeeded));
        assert!(run.stages.values().all(|s| s.status == StageStatus::Succeeded));
        assert_eq!(h.executor.scripts(), vec!["ok", "ok", "ok", "print:deployed"]);
        assert!(!h.orchestrator.is_active(run.id));
    }

    #[tokio::test]
    async fn test_failed_test_stage_skips_dependents() {
        let h = harness(node_app("fail", "ok", "KUBE_CONFIG"), secrets(), |_| {});
        let run = h.orchestrator.create_run(Trigger::push("main", "abc123"));

        let run = h.orchestrator.execute(run).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(status(&run, "test"), StageStatus::Failed);
        for dependent in ["build-and-push", "deploy"] {
            let result = run.stage(dependent).unwrap();
            assert_eq!(result.status, StageStatus::Skipped);
            assert_eq!(result.failure, Some(FailureKind::DependencyFailed));
            assert!(result.reason.as_deref().unwrap().contains("'test'"));
        }
        assert_eq!(h.executor.scripts(), vec!["fail"]);
    }

    #[tokio::test]
    async fn test_missing_kube_config_fails_deploy() {
        let h = harness(
            node_app("ok", "ok", "KUBE_CONFIG"),
            InMemorySecretStore::new().with_secret("DOCKER_PASSWORD", "d0cker-pa55"),
            |_| {},
        );
        let outcome = h
            .orchestrator
            .start(h.orchestrator.create_run(Trigger::push("main", "abc123")))
            .await;

        assert_eq!(outcome, RunOutcome::Failed);
        let run = h.history.list(None, 1).await.unwrap().remove(0);
        assert_eq!(status(&run, "test"), StageStatus::Succeeded);
        assert_eq!(status(&run, "build-and-push"), StageStatus::Succeeded);
        let deploy = run.stage("deploy").unwrap();
        assert_eq!(deploy.status, StageStatus::Failed);
        assert_eq!(deploy.failure, Some(FailureKind::SecretNotFound));
        assert!(!h.executor.scripts().contains(&"print:deployed".to_string()));
    }

    #[tokio::test]
    async fn test_independent_branch_keeps_draining() {
        let h = harness(
            vec![
                stage("test", &[], vec![step("t", "fail")]),
                stage("docs", &[], vec![step("d", "ok")]),
                stage("deploy", &["test"], vec![step("x", "print:deploy")]),
                stage("publish-docs", &["docs"], vec![step("p", "print:publish")]),
            ],
            InMemorySecretStore::new(),
            |_| {},
        );

        let run = h
            .orchestrator
            .execute(h.orchestrator.create_run(Trigger::push("main", "abc")))
            .await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(status(&run, "deploy"), StageStatus::Skipped);
        assert_eq!(status(&run, "docs"), StageStatus::Succeeded);
        assert_eq!(status(&run, "publish-docs"), StageStatus::Succeeded);
    }

    fn independent(ms: u64) -> Vec<StageDefinition> {
        vec![
            stage("lint", &[], vec![step("l", &format!("sleep:{}", ms))]),
            stage("unit", &[], vec![step("u", &format!("sleep:{}", ms))]),
        ]
    }

    #[tokio::test]
    async fn test_independent_stages_overlap_with_two_workers() {
        let h = harness(independent(200), InMemorySecretStore::new(), |c| {
            c.worker_limit = 2
        });

        let run = h
            .orchestrator
            .execute(h.orchestrator.create_run(Trigger::push("main", "abc")))
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(h.executor.peak_concurrency(), 2);
    }

    #[tokio::test]
    async fn test_worker_limit_one_runs_sequentially() {
        let h = harness(independent(50), InMemorySecretStore::new(), |c| {
            c.worker_limit = 1
        });

        let run = h
            .orchestrator
            .execute(h.orchestrator.create_run(Trigger::push("main", "abc")))
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(h.executor.peak_concurrency(), 1);
        let records = h.executor.records();
        assert!(records[0].finished <= records[1].started);
    }

    #[tokio::test]
    async fn test_cancel_during_build_and_push() {
        let h = harness(node_app("ok", "sleep:10000", "KUBE_CONFIG"), secrets(), |_| {});
        let run = h.orchestrator.create_run(Trigger::push("main", "abc123"));
        let run_id = run.id;

        let orchestrator = Arc::clone(&h.orchestrator);
        let handle = tokio::spawn(async move { orchestrator.execute(run).await });

        wait_for_running(&h, run_id, "build-and-push").await;
        let requested = Instant::now();
        assert!(h.orchestrator.cancel(run_id));

        let run = handle.await.unwrap();
        assert!(requested.elapsed() < Duration::from_millis(100) + ABORT_MARGIN);

        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.cancel_requested);
        assert_eq!(status(&run, "test"), StageStatus::Succeeded);
        assert_eq!(status(&run, "build-and-push"), StageStatus::Cancelled);
        assert_eq!(status(&run, "deploy"), StageStatus::Cancelled);
        assert!(!h.executor.scripts().contains(&"print:deployed".to_string()));
        assert!(!h.orchestrator.cancel(run_id));
    }

    #[tokio::test]
    async fn test_unresponsive_stage_is_aborted_after_grace() {
        let h = harness(
            vec![stage("stuck", &[], vec![step("s", "hang:30000")])],
            InMemorySecretStore::new(),
            |_| {},
        );
        let run = h.orchestrator.create_run(Trigger::push("main", "abc"));
        let run_id = run.id;

        let orchestrator = Arc::clone(&h.orchestrator);
        let handle = tokio::spawn(async move { orchestrator.execute(run).await });
        wait_for_running(&h, run_id, "stuck").await;
        h.orchestrator.cancel(run_id);

        let run = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let stuck = run.stage("stuck").unwrap();
        assert_eq!(stuck.status, StageStatus::Cancelled);
        assert!(stuck.reason.as_deref().unwrap().contains("grace period"));
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_nothing() {
        let h = harness(node_app("ok", "ok", "KUBE_CONFIG"), secrets(), |_| {});
        let run = h.orchestrator.create_run(Trigger::push("main", "abc"));
        assert!(h.orchestrator.cancel(run.id));

        let run = h.orchestrator.execute(run).await;

        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.stages.values().all(|s| s.status == StageStatus::Cancelled));
        assert!(h.executor.scripts().is_empty());
    }

    #[tokio::test]
    async fn test_history_and_logs_are_redacted() {
        let h = harness(
            vec![stage(
                "deploy",
                &[],
                vec![secret_step("apply", "echo-env:KUBECONFIG_DATA", "KUBECONFIG_DATA", "KUBE_CONFIG")],
            )],
            secrets(),
            |c| {
                c.variables
                    .insert("REGISTRY".to_string(), "registry.local".to_string());
            },
        );

        let run = h
            .orchestrator
            .execute(h.orchestrator.create_run(Trigger::push("main", "c0ffee")))
            .await;
        assert_eq!(run.status, RunStatus::Succeeded);

        let record = &h.executor.records()[0];
        assert_eq!(record.env.get("SLUICE_COMMIT").map(String::as_str), Some("c0ffee"));
        assert_eq!(record.env.get("REGISTRY").map(String::as_str), Some("registry.local"));
        assert!(record.env.contains_key("SLUICE_WORKSPACE"));

        let stored = h.history.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);

        let logs = h.history.logs(run.id).await.unwrap();
        assert!(logs.iter().any(|e| e.step.as_deref() == Some("apply") && e.message == "***"));
        assert!(logs.iter().all(|e| !e.message.contains("apiVersion: v1")));
        let stored_json = serde_json::to_string(&stored).unwrap();
        assert!(!stored_json.contains("apiVersion: v1"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let h = harness(node_app("ok", "ok", "KUBE_CONFIG"), secrets(), |_| {});
        assert!(!h.orchestrator.cancel(Uuid::new_v4()));
    }
}
