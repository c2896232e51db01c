use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::collaborators::types::{IssueInput, PullRequestRef};
use crate::collaborators::Collaborators;
use crate::config::OrchestratorConfig;
use crate::error::{AppError, Result};
use crate::workflow::executor::{Backoff, RetryExecutor, StageError, StageOutcome};
use crate::workflow::registry::{Registration, WorkflowRegistry};
use crate::workflow::stats::{StatsSnapshot, WorkflowStats};
use crate::workflow::streaks::FailureStreaks;
use crate::workflow::types::{
    ErrorKind, Stage, TransitionEvent, WorkflowError, WorkflowOutcome, WorkflowRecord,
    WorkflowResult, WorkflowState,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How the pipeline stopped, before escalation is decided.
enum Conclusion {
    PullRequest(PullRequestRef),
    NotFeasible(String),
    /// A stage failed or was rejected; counted toward the failure streak.
    StageFailed(WorkflowError),
    /// Systemic failure that is not attributed to a stage.
    Aborted(WorkflowError),
}

/// State owned by a single `process_issue` invocation.
struct WorkflowRun {
    record: WorkflowRecord,
    registration: Registration,
    started: Instant,
}

/// Drives issues through analysis, resolution, review, and PR generation.
pub struct WorkflowOrchestrator {
    config: OrchestratorConfig,
    collaborators: Collaborators,
    executor: RetryExecutor,
    registry: Arc<WorkflowRegistry>,
    /// Consecutive stage failures per issue, carried across submissions.
    failure_streaks: Mutex<FailureStreaks>,
    events: broadcast::Sender<TransitionEvent>,
    stats: WorkflowStats,
}

impl WorkflowOrchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let executor = RetryExecutor::new(Backoff::from(&config));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let failure_streaks =
            FailureStreaks::new(config.failure_streak_window(), config.max_tracked_streaks);

        Self {
            config,
            collaborators,
            executor,
            registry: Arc::new(WorkflowRegistry::new()),
            failure_streaks: Mutex::new(failure_streaks),
            events,
            stats: WorkflowStats::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Snapshot of every workflow currently in flight.
    pub fn active_workflows(&self) -> Vec<WorkflowRecord> {
        self.registry.active_workflows()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Receive an event for every state change of every workflow.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    pub fn failure_streak(&self, issue_number: u64) -> u32 {
        self.streaks().get(issue_number, Instant::now())
    }

    /// Number of issues whose failure streak is currently remembered.
    pub fn tracked_streaks(&self) -> usize {
        self.streaks().len()
    }

    /// Forget failure streaks older than the configured window.
    pub fn prune_failure_streaks(&self) -> usize {
        self.streaks().prune(Instant::now())
    }

    /// Run one issue through the whole pipeline.
    ///
    /// Only caller errors are returned as `Err`: a zero issue number, or an
    /// issue that already has a workflow in flight. Every pipeline failure
    /// comes back as an unsuccessful `WorkflowResult`.
    pub async fn process_issue(
        &self,
        issue_number: u64,
        title: &str,
        body: &str,
    ) -> Result<WorkflowResult> {
        let run = self.begin(issue_number)?;
        let issue = IssueInput {
            number: issue_number,
            title: title.to_string(),
            body: body.to_string(),
        };
        Ok(self.execute(issue, run).await)
    }

    /// Register the issue now and run the pipeline on a background task.
    ///
    /// Duplicates are rejected before anything is spawned.
    pub fn submit(
        self: &Arc<Self>,
        issue_number: u64,
        title: String,
        body: String,
    ) -> Result<JoinHandle<WorkflowResult>> {
        let run = self.begin(issue_number)?;
        let issue = IssueInput {
            number: issue_number,
            title,
            body,
        };
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.execute(issue, run).await }))
    }

    fn begin(&self, issue_number: u64) -> Result<WorkflowRun> {
        if issue_number == 0 {
            return Err(AppError::InvalidInput(
                "issue number must be positive".to_string(),
            ));
        }

        // Seeding and registering happen under the streak lock. A run that
        // is finishing settles its streak before releasing the registry
        // entry, so this either sees the settled streak or a duplicate.
        let registered = {
            let streaks = self.streaks();
            let record = WorkflowRecord::new(issue_number, streaks.get(issue_number, Instant::now()));
            self.registry
                .register(&record)
                .map(|registration| (record, registration))
        };
        let (record, registration) = match registered {
            Ok(registered) => registered,
            Err(e) => {
                self.stats.record_rejected_duplicate();
                tracing::warn!(issue = issue_number, "Rejected duplicate workflow");
                return Err(e);
            }
        };

        self.stats.record_started();
        tracing::info!(
            issue = issue_number,
            consecutive_failures = record.consecutive_failures,
            "Workflow started"
        );

        Ok(WorkflowRun {
            record,
            registration,
            started: Instant::now(),
        })
    }

    async fn execute(&self, issue: IssueInput, mut run: WorkflowRun) -> WorkflowResult {
        let conclusion = match self.drive(&issue, &mut run).await {
            Ok(conclusion) => conclusion,
            Err(e) => {
                tracing::error!(issue = issue.number, error = %e, "Workflow aborted by internal error");
                Conclusion::Aborted(internal_failure(&e))
            }
        };
        self.finish(run, conclusion)
    }

    async fn drive(&self, issue: &IssueInput, run: &mut WorkflowRun) -> Result<Conclusion> {
        // Analysis
        let analyzer = Arc::clone(&self.collaborators.analyzer);
        let input = issue.clone();
        let step = self
            .run_stage(run, Stage::Analysis, move || {
                let analyzer = Arc::clone(&analyzer);
                let input = input.clone();
                async move { analyzer.analyze(&input).await.map_err(technical) }
            })
            .await?;
        let (analysis, attempts) = match step {
            ControlFlow::Continue(done) => done,
            ControlFlow::Break(conclusion) => return Ok(conclusion),
        };

        if !analysis.feasible {
            let reasoning = analysis.reasoning.clone();
            run.record.result.analysis = Some(analysis);
            self.stage_rejected(
                run,
                Stage::Analysis,
                attempts,
                format!("issue judged not feasible: {reasoning}"),
            );
            return Ok(Conclusion::NotFeasible(reasoning));
        }
        run.record.result.analysis = Some(analysis.clone());
        self.stage_succeeded(run, Stage::Analysis, attempts);

        // Resolution; an unsuccessful resolution leaves nothing to review, so it is retried.
        let resolver = Arc::clone(&self.collaborators.resolver);
        let input = issue.clone();
        let analyzed = analysis.clone();
        let step = self
            .run_stage(run, Stage::Resolution, move || {
                let resolver = Arc::clone(&resolver);
                let input = input.clone();
                let analyzed = analyzed.clone();
                async move {
                    let resolution = resolver.resolve(&analyzed, &input).await.map_err(technical)?;
                    if !resolution.success {
                        return Err(StageError::Failed(format!(
                            "resolver produced no usable solution: {}",
                            resolution.reasoning
                        )));
                    }
                    Ok(resolution)
                }
            })
            .await?;
        let (resolution, attempts) = match step {
            ControlFlow::Continue(done) => done,
            ControlFlow::Break(conclusion) => return Ok(conclusion),
        };
        run.record.result.resolution = Some(resolution.clone());
        self.stage_succeeded(run, Stage::Resolution, attempts);

        // Review
        let reviewer = Arc::clone(&self.collaborators.reviewer);
        let input = issue.clone();
        let solution = resolution.solution.clone();
        let step = self
            .run_stage(run, Stage::Review, move || {
                let reviewer = Arc::clone(&reviewer);
                let input = input.clone();
                let solution = solution.clone();
                async move { reviewer.review(&solution, &input).await.map_err(technical) }
            })
            .await?;
        let (review, attempts) = match step {
            ControlFlow::Continue(done) => done,
            ControlFlow::Break(conclusion) => return Ok(conclusion),
        };

        if !review.approved {
            let mut reason = format!("review not approved (score {:.2})", review.score);
            if !review.critical_issues.is_empty() {
                reason.push_str(": ");
                reason.push_str(&review.critical_issues.join("; "));
            }
            run.record.result.review = Some(review);
            let error = self.stage_rejected(run, Stage::Review, attempts, reason);
            return Ok(Conclusion::StageFailed(error));
        }
        run.record.result.review = Some(review.clone());
        self.stage_succeeded(run, Stage::Review, attempts);

        // PR generation
        let generator = Arc::clone(&self.collaborators.pr_generator);
        let input = issue.clone();
        let step = self
            .run_stage(run, Stage::PrGeneration, move || {
                let generator = Arc::clone(&generator);
                let input = input.clone();
                let resolution = resolution.clone();
                let review = review.clone();
                let analysis = analysis.clone();
                async move {
                    generator
                        .create_pull_request(&input, &resolution, &review, &analysis)
                        .await
                        .map_err(technical)
                }
            })
            .await?;
        let (pull_request, attempts) = match step {
            ControlFlow::Continue(done) => done,
            ControlFlow::Break(conclusion) => return Ok(conclusion),
        };
        run.record.result.pull_request = Some(pull_request.clone());
        self.stage_succeeded(run, Stage::PrGeneration, attempts);

        Ok(Conclusion::PullRequest(pull_request))
    }

    /// Enter `stage` and run it through the executor, bounded by what is
    /// left of the workflow budget.
    ///
    /// Executor failures are recorded here; a returned value still has to be
    /// judged by the caller.
    async fn run_stage<T, F, Fut>(
        &self,
        run: &mut WorkflowRun,
        stage: Stage,
        mut operation: F,
    ) -> Result<ControlFlow<Conclusion, (T, u32)>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, StageError>> + Send + 'static,
        T: Send + 'static,
    {
        let budget = self.config.max_workflow_time();
        let remaining = budget.saturating_sub(run.started.elapsed());
        if remaining.is_zero() {
            return Ok(ControlFlow::Break(Conclusion::Aborted(WorkflowError::new(
                ErrorKind::WorkflowTimeout,
                None,
                format!(
                    "workflow exceeded {}ms before {stage} could start",
                    budget.as_millis()
                ),
            ))));
        }

        self.transition(run, stage.state())?;

        let mut calls = 0u32;
        let attempt = self.executor.execute(
            stage,
            self.config.stage_timeout(stage),
            self.config.max_attempts(),
            || {
                calls += 1;
                operation()
            },
        );
        let outcome = tokio::time::timeout(remaining, attempt).await;

        match outcome {
            Ok(StageOutcome::Succeeded { value, attempts }) => {
                Ok(ControlFlow::Continue((value, attempts)))
            }
            Ok(StageOutcome::Failed { error, attempts }) => {
                let error = WorkflowError::new(error.kind(), Some(stage), error.to_string());
                run.record.record_stage_failure(stage, attempts, error.clone());
                run.registration.sync(&run.record);
                tracing::warn!(
                    issue = run.record.issue_number,
                    stage = %stage,
                    attempts,
                    consecutive_failures = run.record.consecutive_failures,
                    error = %error,
                    "Stage failed"
                );
                Ok(ControlFlow::Break(Conclusion::StageFailed(error)))
            }
            Err(_) => {
                run.record.attempt_counts.insert(stage, calls);
                tracing::warn!(
                    issue = run.record.issue_number,
                    stage = %stage,
                    attempts = calls,
                    "Workflow deadline reached while stage was in flight"
                );
                Ok(ControlFlow::Break(Conclusion::Aborted(WorkflowError::new(
                    ErrorKind::WorkflowTimeout,
                    None,
                    format!(
                        "workflow exceeded {}ms during {stage}",
                        budget.as_millis()
                    ),
                ))))
            }
        }
    }

    fn stage_succeeded(&self, run: &mut WorkflowRun, stage: Stage, attempts: u32) {
        run.record.record_stage_success(stage, attempts);
        run.registration.sync(&run.record);
        tracing::debug!(issue = run.record.issue_number, stage = %stage, attempts, "Stage succeeded");
    }

    /// Record a collaborator's negative judgment as a stage failure.
    fn stage_rejected(
        &self,
        run: &mut WorkflowRun,
        stage: Stage,
        attempts: u32,
        reason: String,
    ) -> WorkflowError {
        let error = WorkflowError::new(ErrorKind::BusinessRejection, Some(stage), reason);
        run.record.record_stage_failure(stage, attempts, error.clone());
        run.registration.sync(&run.record);
        tracing::info!(
            issue = run.record.issue_number,
            stage = %stage,
            consecutive_failures = run.record.consecutive_failures,
            reason = %error.message,
            "Stage rejected by collaborator"
        );
        error
    }

    fn transition(&self, run: &mut WorkflowRun, to: WorkflowState) -> Result<()> {
        let from = run.record.transition(to)?;
        // Sync before announcing so listeners never see a terminal workflow
        // still registered.
        run.registration.sync(&run.record);

        tracing::info!(
            issue = run.record.issue_number,
            from = %from,
            to = %to,
            "Workflow state transition"
        );
        let _ = self.events.send(TransitionEvent {
            issue_number: run.record.issue_number,
            from,
            to,
            at: Utc::now(),
        });
        Ok(())
    }

    fn finish(&self, mut run: WorkflowRun, conclusion: Conclusion) -> WorkflowResult {
        let threshold = self.config.human_intervention_threshold;
        let escalate = run.record.consecutive_failures >= threshold;

        let (state, outcome) = match conclusion {
            Conclusion::PullRequest(pr) => (
                WorkflowState::Completed,
                WorkflowOutcome::PullRequestCreated {
                    pr_number: pr.number,
                    url: pr.url,
                },
            ),
            Conclusion::NotFeasible(_) | Conclusion::StageFailed(_) if escalate => {
                let cause = run
                    .record
                    .last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                let error = WorkflowError::new(
                    ErrorKind::EscalationRequired,
                    run.record.last_error.as_ref().and_then(|e| e.stage),
                    format!(
                        "{} consecutive failures reached the threshold of {threshold}; last: {cause}",
                        run.record.consecutive_failures
                    ),
                );
                run.record.last_error = Some(error.clone());
                (WorkflowState::Escalated, WorkflowOutcome::Escalated { error })
            }
            Conclusion::NotFeasible(reasoning) => {
                (WorkflowState::Completed, WorkflowOutcome::NotFeasible { reasoning })
            }
            Conclusion::StageFailed(error) => {
                (WorkflowState::Failed, WorkflowOutcome::Failed { error })
            }
            Conclusion::Aborted(error) => {
                run.record.last_error = Some(error.clone());
                (WorkflowState::Failed, WorkflowOutcome::Failed { error })
            }
        };

        // The streak must be settled before the terminal transition releases
        // the registry entry and a resubmission can read it.
        self.settle_streak(&run.record, state);
        if let Err(e) = self.transition(&mut run, state) {
            tracing::error!(issue = run.record.issue_number, error = %e, "Failed to record terminal state");
        }
        self.count(&outcome);

        let execution_time = run.started.elapsed();
        let success = matches!(outcome, WorkflowOutcome::PullRequestCreated { .. });

        match &outcome {
            WorkflowOutcome::Escalated { error } => tracing::warn!(
                issue = run.record.issue_number,
                execution_ms = execution_time.as_millis() as u64,
                error = %error,
                "Workflow escalated for human intervention"
            ),
            WorkflowOutcome::Failed { error } => tracing::warn!(
                issue = run.record.issue_number,
                execution_ms = execution_time.as_millis() as u64,
                error = %error,
                "Workflow failed"
            ),
            _ => tracing::info!(
                issue = run.record.issue_number,
                execution_ms = execution_time.as_millis() as u64,
                outcome = ?outcome,
                "Workflow completed"
            ),
        }

        let WorkflowRun { record, .. } = run;
        WorkflowResult {
            issue_number: record.issue_number,
            success,
            final_state: record.state,
            pull_request: record.result.pull_request.clone(),
            outcome,
            execution_time_ms: execution_time.as_millis() as u64,
            attempt_counts: record.attempt_counts,
            consecutive_failures: record.consecutive_failures,
            results: record.result,
        }
    }

    /// Carry the failure streak into the next submission of the same issue.
    /// An escalated issue is handed to a human and starts over.
    fn settle_streak(&self, record: &WorkflowRecord, state: WorkflowState) {
        let count = if state == WorkflowState::Escalated {
            0
        } else {
            record.consecutive_failures
        };
        self.streaks().set(record.issue_number, count, Instant::now());
    }

    fn count(&self, outcome: &WorkflowOutcome) {
        match outcome {
            WorkflowOutcome::PullRequestCreated { .. } => self.stats.record_completed(),
            WorkflowOutcome::NotFeasible { .. } => self.stats.record_not_feasible(),
            WorkflowOutcome::Escalated { .. } => self.stats.record_escalated(),
            WorkflowOutcome::Failed { error } => {
                self.stats.record_failed();
                if error.kind == ErrorKind::WorkflowTimeout {
                    self.stats.record_workflow_timeout();
                }
            }
        }
    }

    fn streaks(&self) -> MutexGuard<'_, FailureStreaks> {
        self.failure_streaks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn technical(error: AppError) -> StageError {
    StageError::Failed(error.to_string())
}

fn internal_failure(error: &AppError) -> WorkflowError {
    WorkflowError::new(
        ErrorKind::Internal,
        None,
        format!("orchestrator internal error: {error}"),
    )
}
