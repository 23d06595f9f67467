//! Workflow Controller.
//!
//! Owns the lifecycle of workflows: which step runs next, what happens when a
//! step ends, and every user command (pause, resume, cancel, retry, skip,
//! edit, answer). One background driver task per active workflow runs steps
//! strictly one after another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{oneshot, watch};

use super::WorkflowEvent;
use crate::agent::{build_prompt, AgentBackend, AgentRequest, AgentRunner};
use crate::clarification::{
    ClarificationExchange, ClarificationResolver, ClarificationResponse, PendingClarification,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{
    ActivityEntry, CreateWorkflowInput, Step, StepStatus, StepType, Workflow, WorkflowStatus,
};
use crate::persistence::Persistence;
use crate::step::{extract_json_block, machine, StepEffect};
use crate::stream::{AgentPhase, Fanout, StreamChannel, StreamEvent, Subscription};

const CANCELLED: &str = "cancelled";
const CANCELLED_WHILE_WAITING: &str = "cancelled while awaiting clarification";
const INTERRUPTED: &str = "interrupted";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What `recover()` changed.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub failed_steps: Vec<String>,
    pub paused_workflows: Vec<String>,
}

/// Why the current run is being cancelled.
enum Interrupt {
    Cancel,
    Skip(oneshot::Sender<Step>),
}

#[derive(Default)]
struct RunSlot {
    step_id: Option<String>,
    channel: Option<StreamChannel>,
    pending: Option<PendingClarification>,
    /// Responses delivered by callers, by tool use id.
    answers: HashMap<String, ClarificationResponse>,
    interrupt: Option<Interrupt>,
}

/// In-memory state of a workflow the controller has touched.
struct ActiveWorkflow {
    id: String,
    /// Source of truth while the workflow is loaded; every change is
    /// persisted before the lock is released.
    record: tokio::sync::Mutex<Workflow>,
    slot: Mutex<RunSlot>,
    /// Replaced when a failed workflow is reopened, since a fan-out stays
    /// closed once it has carried a terminal event.
    hub: Mutex<Arc<Fanout<WorkflowEvent>>>,
    capacity: usize,
    /// `true` while no driver task is running.
    idle: watch::Sender<bool>,
}

impl ActiveWorkflow {
    fn new(workflow: Workflow, capacity: usize) -> Self {
        let hub = Fanout::new(capacity);
        if workflow.status.is_terminal() {
            hub.publish(WorkflowEvent::WorkflowStatus {
                status: workflow.status,
            });
        }
        let (idle, _) = watch::channel(true);
        Self {
            id: workflow.id.clone(),
            record: tokio::sync::Mutex::new(workflow),
            slot: Mutex::new(RunSlot::default()),
            hub: Mutex::new(Arc::new(hub)),
            capacity,
            idle,
        }
    }

    fn slot(&self) -> MutexGuard<'_, RunSlot> {
        lock(&self.slot)
    }

    fn hub(&self) -> Arc<Fanout<WorkflowEvent>> {
        lock(&self.hub).clone()
    }

    fn reopen_hub(&self) {
        *lock(&self.hub) = Arc::new(Fanout::new(self.capacity));
    }

    fn publish(&self, event: WorkflowEvent) {
        self.hub().publish(event);
    }

    fn is_driving(&self) -> bool {
        !*self.idle.borrow()
    }

    fn publish_step(&self, step: &Step) {
        self.publish(WorkflowEvent::StepStatus {
            step_id: step.id.clone(),
            step_number: step.step_number,
            status: step.status,
        });
    }

    fn publish_workflow(&self, status: WorkflowStatus) {
        self.publish(WorkflowEvent::WorkflowStatus { status });
    }
}

/// Marks the workflow idle if the driver task unwinds.
struct IdleGuard {
    active: Arc<ActiveWorkflow>,
    armed: bool,
}

impl IdleGuard {
    fn release(&mut self) {
        self.armed = false;
        self.active.idle.send_replace(true);
    }
}

impl Drop for IdleGuard {
    fn drop(&mut self) {
        if self.armed {
            self.active.idle.send_replace(true);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// How one agent run ended, as seen by the driver.
struct RunEnd {
    step: Step,
    terminal: Option<AgentPhase>,
    paused_at_end: bool,
    exchanges: Vec<ClarificationExchange>,
    interrupt: Option<Interrupt>,
}

struct ControllerInner {
    persistence: Arc<dyn Persistence>,
    runner: AgentRunner,
    resolver: ClarificationResolver,
    config: EngineConfig,
    active: RwLock<HashMap<String, Arc<ActiveWorkflow>>>,
}

#[derive(Clone)]
pub struct WorkflowController {
    inner: Arc<ControllerInner>,
}

impl WorkflowController {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        backend: Arc<dyn AgentBackend>,
        config: EngineConfig,
    ) -> Self {
        let runner = AgentRunner::new(backend, config.channel_capacity, config.cancel_grace());
        let resolver = ClarificationResolver::new(config.clarification_tool.clone());
        Self {
            inner: Arc::new(ControllerInner {
                persistence,
                runner,
                resolver,
                config,
                active: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn backend_name(&self) -> &str {
        self.inner.runner.backend_name()
    }

    // ===== Lifecycle =====

    pub async fn create(&self, input: CreateWorkflowInput) -> Result<Workflow, EngineError> {
        let steps = self
            .inner
            .config
            .step_sequence(input.workflow_type, input.step_types.clone())?;
        let workflow = Workflow::new(uuid::Uuid::new_v4().to_string(), input, steps);
        self.inner.persistence.save_workflow(&workflow).await?;
        tracing::info!(
            "[Controller] created workflow {} ({}, {} steps, {})",
            workflow.id,
            workflow.workflow_type.as_str(),
            workflow.total_steps,
            workflow.pause_behavior.as_str()
        );
        Ok(workflow)
    }

    /// `created -> running`. A no-op on running or terminal workflows.
    pub async fn start(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let active = self.active_for(workflow_id).await?;
        let mut wf = active.record.lock().await;
        match wf.status {
            WorkflowStatus::Created => {
                wf.transition(WorkflowStatus::Running)?;
                self.inner.persistence.save_workflow(&wf).await?;
                active.publish_workflow(wf.status);
                tracing::info!("[Controller] workflow {} started", wf.id);
                self.ensure_driver(&active);
            }
            WorkflowStatus::Running if !active.is_driving() => return Err(stranded(&wf)),
            WorkflowStatus::Running => {}
            status if status.is_terminal() => {}
            status => {
                return Err(EngineError::invalid_workflow_transition(
                    status.as_str(),
                    WorkflowStatus::Running.as_str(),
                ))
            }
        }
        Ok(wf.clone())
    }

    /// Stop before the next step. A step already in flight runs to its end.
    pub async fn pause(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let active = self.active_for(workflow_id).await?;
        let mut wf = active.record.lock().await;
        match wf.status {
            WorkflowStatus::Running => {
                wf.transition(WorkflowStatus::Paused)?;
                self.inner.persistence.save_workflow(&wf).await?;
                active.publish_workflow(wf.status);
                tracing::info!("[Controller] workflow {} paused", wf.id);
            }
            WorkflowStatus::Paused | WorkflowStatus::Editing => {}
            status if status.is_terminal() => {}
            status => {
                return Err(EngineError::invalid_workflow_transition(
                    status.as_str(),
                    WorkflowStatus::Paused.as_str(),
                ))
            }
        }
        Ok(wf.clone())
    }

    /// `paused -> running`, continuing with the next pending step.
    pub async fn resume(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let active = self.active_for(workflow_id).await?;
        let mut wf = active.record.lock().await;
        match wf.status {
            WorkflowStatus::Paused => {
                wf.transition(WorkflowStatus::Running)?;
                self.inner.persistence.save_workflow(&wf).await?;
                active.publish_workflow(wf.status);
                tracing::info!("[Controller] workflow {} resumed", wf.id);
                self.ensure_driver(&active);
            }
            WorkflowStatus::Running if !active.is_driving() => return Err(stranded(&wf)),
            WorkflowStatus::Running => {}
            status if status.is_terminal() => {}
            status => {
                return Err(EngineError::invalid_workflow_transition(
                    status.as_str(),
                    WorkflowStatus::Running.as_str(),
                ))
            }
        }
        Ok(wf.clone())
    }

    /// Cancel the workflow. An in-flight run is cancelled first and the
    /// workflow is marked cancelled once its channel has closed.
    pub async fn cancel(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let active = self.active_for(workflow_id).await?;
        {
            let mut wf = active.record.lock().await;
            if wf.status.is_terminal() {
                return Ok(wf.clone());
            }
            let channel = {
                let mut slot = active.slot();
                slot.interrupt = Some(Interrupt::Cancel);
                slot.channel.clone()
            };
            match channel {
                Some(channel) => channel.cancel(),
                None => {
                    // No live run here; a step another process left behind
                    // is failed along with the cancellation.
                    let left_behind = self
                        .inner
                        .persistence
                        .list_steps(&wf.id)
                        .await?
                        .into_iter()
                        .find(|s| {
                            s.step_number == wf.current_step_number
                                && matches!(s.status, StepStatus::Running | StepStatus::Paused)
                        });
                    wf.transition(WorkflowStatus::Cancelled)?;
                    match left_behind {
                        Some(mut step) => {
                            let reason = if step.status == StepStatus::Paused {
                                CANCELLED_WHILE_WAITING
                            } else {
                                CANCELLED
                            };
                            machine::fail(&mut step, reason)?;
                            self.inner.persistence.commit(&step, &wf).await?;
                            active.publish_step(&step);
                        }
                        None => self.inner.persistence.save_workflow(&wf).await?,
                    }
                    active.publish_workflow(wf.status);
                    tracing::info!("[Controller] workflow {} cancelled", wf.id);
                }
            }
        }
        self.wait_idle(&active).await;
        let wf = active.record.lock().await.clone();
        Ok(wf)
    }

    /// Derive a new workflow from an existing one: same request, same step
    /// plan, fresh steps.
    pub async fn rerun(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let source = self.get_workflow(workflow_id).await?;
        self.create(CreateWorkflowInput {
            feature_name: source.feature_name,
            feature_request: source.feature_request,
            workflow_type: source.workflow_type,
            pause_behavior: source.pause_behavior,
            step_types: Some(source.step_types),
            parent_workflow_id: Some(source.id),
        })
        .await
    }

    /// Wait until no step of the workflow is running and return it.
    pub async fn wait_until_idle(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let active = self.active_for(workflow_id).await?;
        self.wait_idle(&active).await;
        let wf = active.record.lock().await.clone();
        Ok(wf)
    }

    // ===== Step commands =====

    /// Re-run the workflow's failed current step. Reopens a failed workflow.
    pub async fn retry_step(&self, step_id: &str) -> Result<Step, EngineError> {
        let workflow_id = self.get_step(step_id).await?.workflow_id;
        let active = self.active_for(&workflow_id).await?;
        let mut wf = active.record.lock().await;
        let mut step = self.get_step(step_id).await?;

        if step.step_number != wf.current_step_number {
            return Err(EngineError::invalid_step_transition(
                step.status.as_str(),
                format!("pending (only step {} can be retried)", wf.current_step_number),
            ));
        }
        match wf.status {
            WorkflowStatus::Failed | WorkflowStatus::Running | WorkflowStatus::Paused => {}
            status => {
                return Err(EngineError::invalid_workflow_transition(
                    status.as_str(),
                    WorkflowStatus::Running.as_str(),
                ))
            }
        }
        machine::retry(&mut step)?;
        if wf.status == WorkflowStatus::Failed {
            wf.reopen_for_retry()?;
            active.reopen_hub();
        }
        self.inner.persistence.commit(&step, &wf).await?;
        active.publish_step(&step);
        active.publish_workflow(wf.status);
        tracing::info!(
            "[Controller] retrying step {} of workflow {} (attempt {})",
            step.step_number,
            wf.id,
            step.retry_count + 1
        );
        if wf.status == WorkflowStatus::Running {
            self.ensure_driver(&active);
        }
        Ok(step)
    }

    /// Skip a pending step, or a step paused on a clarification.
    pub async fn skip_step(&self, step_id: &str) -> Result<Step, EngineError> {
        let step = self.get_step(step_id).await?;
        let active = self.active_for(&step.workflow_id).await?;

        if step.status == StepStatus::Paused {
            let (tx, rx) = oneshot::channel();
            let channel = {
                let mut slot = active.slot();
                let running = slot.step_id.as_deref() == Some(step.id.as_str());
                match slot.channel.clone() {
                    Some(channel) if running => {
                        slot.interrupt = Some(Interrupt::Skip(tx));
                        Some(channel)
                    }
                    _ => None,
                }
            };
            if let Some(channel) = channel {
                channel.cancel();
                return rx.await.map_err(|_| {
                    EngineError::Protocol(format!(
                        "step {} finished before it could be skipped",
                        step.id
                    ))
                });
            }
        }

        let mut wf = active.record.lock().await;
        if wf.status.is_terminal() {
            return Err(EngineError::invalid_workflow_transition(
                wf.status.as_str(),
                "skip step",
            ));
        }
        // The driver starts steps under this lock; reload so a step it has
        // already picked up is seen as running.
        let mut step = self.get_step(step_id).await?;
        let owned_by_driver = active.slot().step_id.as_deref() == Some(step.id.as_str());
        if owned_by_driver {
            return Err(EngineError::invalid_step_transition(
                step.status.as_str(),
                StepStatus::Skipped.as_str(),
            ));
        }
        machine::skip(&mut step)?;
        tracing::info!("[Controller] step {} skipped", step.id);
        if self.advance_after_locked(&active, &mut wf, &step).await? == Flow::Continue {
            self.ensure_driver(&active);
        }
        Ok(step)
    }

    /// Replace a completed step's output in one call.
    pub async fn edit_step_output(&self, step_id: &str, output_text: String) -> Result<Step, EngineError> {
        let workflow_id = self.get_step(step_id).await?.workflow_id;
        let active = self.active_for(&workflow_id).await?;
        let _wf = active.record.lock().await;
        let mut step = self.get_step(step_id).await?;
        machine::edit_output(&mut step, output_text)?;
        self.inner.persistence.save_step(&step).await?;
        active.publish_step(&step);
        tracing::info!("[Controller] step {} output edited", step.id);
        Ok(step)
    }

    /// Open a completed step for editing; a paused workflow moves to `editing`.
    pub async fn begin_step_edit(&self, step_id: &str) -> Result<Step, EngineError> {
        let mut step = self.get_step(step_id).await?;
        let active = self.active_for(&step.workflow_id).await?;
        let mut wf = active.record.lock().await;
        machine::begin_edit(&mut step)?;
        if wf.status == WorkflowStatus::Paused {
            wf.transition(WorkflowStatus::Editing)?;
        }
        self.inner.persistence.commit(&step, &wf).await?;
        active.publish_step(&step);
        active.publish_workflow(wf.status);
        Ok(step)
    }

    pub async fn finish_step_edit(&self, step_id: &str, output_text: String) -> Result<Step, EngineError> {
        self.end_step_edit(step_id, Some(output_text)).await
    }

    pub async fn discard_step_edit(&self, step_id: &str) -> Result<Step, EngineError> {
        self.end_step_edit(step_id, None).await
    }

    async fn end_step_edit(&self, step_id: &str, output_text: Option<String>) -> Result<Step, EngineError> {
        let mut step = self.get_step(step_id).await?;
        let active = self.active_for(&step.workflow_id).await?;
        let mut wf = active.record.lock().await;
        match output_text {
            Some(text) => machine::finish_edit(&mut step, text)?,
            None => machine::discard_edit(&mut step)?,
        }
        if wf.status == WorkflowStatus::Editing {
            let steps = self.inner.persistence.list_steps(&wf.id).await?;
            let others_editing = steps
                .iter()
                .any(|s| s.id != step.id && s.status == StepStatus::Editing);
            if !others_editing {
                wf.transition(WorkflowStatus::Paused)?;
            }
        }
        self.inner.persistence.commit(&step, &wf).await?;
        active.publish_step(&step);
        active.publish_workflow(wf.status);
        Ok(step)
    }

    // ===== Clarification =====

    /// The clarification the workflow is currently blocked on, if any.
    pub async fn pending_clarification(
        &self,
        workflow_id: &str,
    ) -> Result<Option<PendingClarification>, EngineError> {
        let active = self.active_for(workflow_id).await?;
        let pending = active.slot().pending.clone();
        Ok(pending)
    }

    /// Answer (or skip) the pending clarification. A second answer for the
    /// same question is a protocol error.
    pub async fn answer_clarification(
        &self,
        workflow_id: &str,
        response: ClarificationResponse,
    ) -> Result<(), EngineError> {
        let active = self.active_for(workflow_id).await?;
        let (pending, channel) = {
            let mut slot = active.slot();
            let channel = match (&slot.pending, &slot.channel) {
                (Some(_), Some(channel)) => channel.clone(),
                _ => {
                    return Err(EngineError::Protocol(format!(
                        "workflow {} has no pending clarification",
                        workflow_id
                    )))
                }
            };
            let Some(pending) = slot.pending.take() else {
                return Err(EngineError::Internal("pending clarification vanished".into()));
            };
            slot.answers
                .insert(pending.tool_use_id.clone(), response.clone());
            (pending, channel)
        };

        if let Err(e) = channel.send_result(&pending.tool_use_id, response.to_payload()) {
            let mut slot = active.slot();
            slot.answers.remove(&pending.tool_use_id);
            if !channel.is_closed() && slot.step_id.as_deref() == Some(pending.step_id.as_str()) {
                slot.pending = Some(pending);
            }
            return Err(e);
        }
        tracing::info!(
            "[Controller] clarification {} on step {} {}",
            pending.tool_use_id,
            pending.step_id,
            if response.is_skipped() { "skipped" } else { "answered" }
        );
        Ok(())
    }

    /// Deliver a raw tool result to the workflow's active run. Results for
    /// the pending clarification go through [`Self::answer_clarification`].
    pub async fn send_tool_result(
        &self,
        workflow_id: &str,
        tool_use_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), EngineError> {
        let active = self.active_for(workflow_id).await?;
        let (is_clarification, channel) = {
            let slot = active.slot();
            (
                slot.pending
                    .as_ref()
                    .is_some_and(|p| p.tool_use_id == tool_use_id),
                slot.channel.clone(),
            )
        };
        if is_clarification {
            let response = ClarificationResponse::from_payload(&payload)?;
            return self.answer_clarification(workflow_id, response).await;
        }
        match channel {
            Some(channel) => channel.send_result(tool_use_id, payload),
            None => Err(EngineError::Protocol(format!(
                "workflow {} has no active run",
                workflow_id
            ))),
        }
    }

    // ===== Observation =====

    /// Events of every step of the workflow from now on. Ends after the
    /// workflow reaches a terminal status.
    pub async fn subscribe(&self, workflow_id: &str) -> Result<Subscription<WorkflowEvent>, EngineError> {
        let active = self.active_for(workflow_id).await?;
        Ok(active.hub().subscribe())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let active = {
            let map = self.inner.active.read().unwrap_or_else(|p| p.into_inner());
            map.get(workflow_id).cloned()
        };
        if let Some(active) = active {
            let wf = active.record.lock().await.clone();
            return Ok(wf);
        }
        self.inner
            .persistence
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))
    }

    pub async fn get_step(&self, step_id: &str) -> Result<Step, EngineError> {
        self.inner
            .persistence
            .load_step(step_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("step {}", step_id)))
    }

    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>, EngineError> {
        self.inner.persistence.list_workflows(status).await
    }

    pub async fn list_steps(&self, workflow_id: &str) -> Result<Vec<Step>, EngineError> {
        self.inner.persistence.list_steps(workflow_id).await
    }

    pub async fn list_activity(&self, step_id: &str) -> Result<Vec<ActivityEntry>, EngineError> {
        self.inner.persistence.list_activity(step_id).await
    }

    // ===== Recovery =====

    /// Reconcile state left by a process that died mid-run: steps still
    /// marked running or paused fail as interrupted (failing their
    /// workflow), and running workflows without a live driver are paused.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();
        let persistence = &self.inner.persistence;

        for status in [StepStatus::Running, StepStatus::Paused] {
            for stale in persistence.list_steps_by_status(status).await? {
                let active = self.active_for(&stale.workflow_id).await?;
                if active.is_driving() {
                    continue;
                }
                let mut wf = active.record.lock().await;
                let mut step = stale;
                machine::fail(&mut step, INTERRUPTED)?;
                if wf.status.can_transition_to(WorkflowStatus::Failed) {
                    wf.fail(failure_message(&step, INTERRUPTED))?;
                }
                persistence.commit(&step, &wf).await?;
                active.publish_step(&step);
                active.publish_workflow(wf.status);
                tracing::warn!(
                    "[Controller] step {} of workflow {} was interrupted",
                    step.step_number,
                    wf.id
                );
                report.failed_steps.push(step.id);
            }
        }

        for workflow in persistence.list_workflows(Some(WorkflowStatus::Running)).await? {
            let active = self.active_for(&workflow.id).await?;
            if active.is_driving() {
                continue;
            }
            let mut wf = active.record.lock().await;
            if wf.status != WorkflowStatus::Running {
                continue;
            }
            wf.transition(WorkflowStatus::Paused)?;
            persistence.save_workflow(&wf).await?;
            active.publish_workflow(wf.status);
            report.paused_workflows.push(wf.id.clone());
        }

        tracing::info!(
            "[Controller] recovery: {} step(s) failed, {} workflow(s) paused",
            report.failed_steps.len(),
            report.paused_workflows.len()
        );
        Ok(report)
    }

    // ===== Driver =====

    async fn active_for(&self, workflow_id: &str) -> Result<Arc<ActiveWorkflow>, EngineError> {
        {
            let map = self.inner.active.read().unwrap_or_else(|p| p.into_inner());
            if let Some(active) = map.get(workflow_id) {
                return Ok(active.clone());
            }
        }
        let workflow = self
            .inner
            .persistence
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?;
        let capacity = self.inner.config.channel_capacity;
        let mut map = self.inner.active.write().unwrap_or_else(|p| p.into_inner());
        if let Some(active) = map.get(workflow_id) {
            return Ok(active.clone());
        }
        let before = map.len();
        map.retain(|_, active| !evictable(active));
        if map.len() < before {
            tracing::debug!("[Controller] released {} finished workflow(s)", before - map.len());
        }
        let active = Arc::new(ActiveWorkflow::new(workflow, capacity));
        map.insert(workflow_id.to_string(), active.clone());
        Ok(active)
    }

    /// Whether the workflow is currently held in memory.
    pub fn is_loaded(&self, workflow_id: &str) -> bool {
        self.inner
            .active
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(workflow_id)
    }

    /// Spawn a driver unless one is already running. Callers hold the
    /// workflow record lock so this cannot race the driver's exit check.
    fn ensure_driver(&self, active: &Arc<ActiveWorkflow>) {
        let spawn = active.idle.send_if_modified(|idle| {
            if *idle {
                *idle = false;
                true
            } else {
                false
            }
        });
        if spawn {
            let this = self.clone();
            let active = active.clone();
            tokio::spawn(async move { this.drive(active).await });
        }
    }

    async fn wait_idle(&self, active: &ActiveWorkflow) {
        let mut rx = active.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    async fn drive(self, active: Arc<ActiveWorkflow>) {
        let mut guard = IdleGuard {
            active: active.clone(),
            armed: true,
        };
        tracing::debug!("[Controller] driver for {} started", active.id);
        loop {
            match self.advance(&active).await {
                Ok(Flow::Continue) => continue,
                Ok(Flow::Stop) => {
                    let wf = active.record.lock().await;
                    if wf.status == WorkflowStatus::Running {
                        // Resumed while the last step was finishing.
                        continue;
                    }
                    guard.release();
                    break;
                }
                Err(e) => {
                    tracing::error!("[Controller] workflow {} driver error: {}", active.id, e);
                    let mut wf = active.record.lock().await;
                    if wf.status.can_transition_to(WorkflowStatus::Failed) && wf.fail(e.to_string()).is_ok() {
                        if let Err(save_err) = self.inner.persistence.save_workflow(&wf).await {
                            tracing::warn!(
                                "[Controller] could not persist failure of {}: {}",
                                wf.id,
                                save_err
                            );
                        }
                        active.publish_workflow(wf.status);
                    }
                    guard.release();
                    break;
                }
            }
        }
        tracing::debug!("[Controller] driver for {} stopped", active.id);
    }

    /// Start the next step and run it to its end.
    async fn advance(&self, active: &Arc<ActiveWorkflow>) -> Result<Flow, EngineError> {
        let persistence = &self.inner.persistence;
        let (workflow, mut step) = {
            let mut wf = active.record.lock().await;
            if wf.status != WorkflowStatus::Running {
                return Ok(Flow::Stop);
            }
            let steps = persistence.list_steps(&wf.id).await?;
            let current = steps
                .iter()
                .find(|s| s.step_number == wf.current_step_number)
                .cloned();

            let step = match current {
                Some(step) if step.status == StepStatus::Pending => step,
                Some(step) if !allows_advance(step.status) => {
                    return Err(EngineError::Internal(format!(
                        "step {} is {} but has no run",
                        step.step_number,
                        step.status.as_str()
                    )));
                }
                _ => {
                    if !wf.has_more_steps() {
                        wf.transition(WorkflowStatus::Completed)?;
                        persistence.save_workflow(&wf).await?;
                        active.publish_workflow(wf.status);
                        tracing::info!("[Controller] workflow {} completed", wf.id);
                        return Ok(Flow::Stop);
                    }
                    let number = wf.current_step_number + 1;
                    match steps.iter().find(|s| s.step_number == number) {
                        Some(existing) if existing.status == StepStatus::Pending => existing.clone(),
                        Some(existing) => {
                            return Err(EngineError::Internal(format!(
                                "step {} is already {}",
                                number,
                                existing.status.as_str()
                            )));
                        }
                        None => new_step(&wf, number)?,
                    }
                }
            };

            let prior: Vec<Step> = steps
                .into_iter()
                .filter(|s| s.step_number < step.step_number)
                .collect();
            let prompt = build_prompt(
                &wf,
                step.step_type,
                &prior,
                &self.inner.config.clarification_tool,
            );
            let mut step = step;
            machine::start(&mut step, Some(prompt))?;
            wf.current_step_number = step.step_number;
            wf.updated_at = Utc::now();
            persistence.commit(&step, &wf).await?;
            (wf.clone(), step)
        };

        active.publish_step(&step);
        tracing::info!(
            "[Controller] workflow {} step {}/{} ({}) started",
            workflow.id,
            step.step_number,
            workflow.total_steps,
            step.step_type.as_str()
        );

        let end = self.run_step(active, &workflow, &mut step).await;
        self.settle(active, end).await
    }

    /// Run the agent for `step`, applying its events until the run ends.
    async fn run_step(&self, active: &ActiveWorkflow, workflow: &Workflow, step: &mut Step) -> RunEnd {
        let request = AgentRequest {
            workflow_id: workflow.id.clone(),
            step_id: step.id.clone(),
            step_number: step.step_number,
            step_type: step.step_type,
            prompt: step.input_text.clone().unwrap_or_default(),
            max_turns: self.inner.config.max_turns,
            clarification_tool: self.inner.config.clarification_tool.clone(),
        };
        let mut run = self.inner.runner.run(request);
        {
            let mut slot = active.slot();
            slot.step_id = Some(step.id.clone());
            slot.channel = Some(run.channel.clone());
            if slot.interrupt.is_some() {
                run.channel.cancel();
            }
        }

        let waits = step.step_type == StepType::Clarification
            && workflow.pause_behavior.waits_for_clarification();
        let mut exchanges: Vec<ClarificationExchange> = Vec::new();
        let mut terminal = None;
        let mut paused_at_end = false;

        while let Some(event) = run.events.recv().await {
            self.record_activity(step, &event).await;
            active.publish(WorkflowEvent::Agent {
                step_id: step.id.clone(),
                step_number: step.step_number,
                event: event.clone(),
            });

            if let Some(exchange) = self.inner.resolver.detect(&event) {
                exchanges.push(exchange);
            } else if let Some(id) = event.tool_use_id() {
                if let Some(exchange) = exchanges.iter_mut().find(|x| x.tool_use_id == id) {
                    self.inner.resolver.observe_update(exchange, &event);
                }
            }

            if let StreamEvent::PhaseChange {
                phase: AgentPhase::AwaitingInput { tool_use_id },
            } = &event
            {
                self.on_awaiting_input(active, step, &run.channel, tool_use_id, &mut exchanges, waits)
                    .await;
                continue;
            }

            let before = step.status;
            match machine::apply_event(step, &event) {
                Ok(StepEffect::Updated) if step.status != before => {
                    if let Err(e) = self.inner.persistence.save_step(step).await {
                        tracing::warn!("[Controller] could not save step {}: {}", step.id, e);
                    }
                    active.publish_step(step);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("[Controller] step {}: {}", step.id, e),
            }
            if let StreamEvent::PhaseChange { phase } = &event {
                if phase.is_terminal() {
                    paused_at_end = before == StepStatus::Paused;
                    terminal = Some(phase.clone());
                    break;
                }
            }
        }

        let channel_id = run.channel.id().to_string();
        run.join().await;
        tracing::debug!("[Controller] channel {} closed", channel_id);

        let (answers, interrupt) = {
            let mut slot = active.slot();
            slot.step_id = None;
            slot.channel = None;
            slot.pending = None;
            (std::mem::take(&mut slot.answers), slot.interrupt.take())
        };
        for exchange in exchanges.iter_mut() {
            if exchange.response.is_none() {
                if let Some(response) = answers.get(&exchange.tool_use_id) {
                    let _ = exchange.resolve(response.clone());
                }
            }
        }

        RunEnd {
            step: step.clone(),
            terminal,
            paused_at_end,
            exchanges,
            interrupt,
        }
    }

    async fn on_awaiting_input(
        &self,
        active: &ActiveWorkflow,
        step: &mut Step,
        channel: &StreamChannel,
        tool_use_id: &str,
        exchanges: &mut [ClarificationExchange],
        waits: bool,
    ) {
        let Some(exchange) = exchanges.iter_mut().find(|x| x.tool_use_id == tool_use_id) else {
            tracing::warn!(
                "[Controller] step {} is waiting on tool {} with no caller; resolving as skipped",
                step.id,
                tool_use_id
            );
            if let Err(e) = channel.send_result(tool_use_id, ClarificationResponse::Skipped.to_payload()) {
                tracing::warn!("[Controller] {}", e);
            }
            return;
        };

        if !waits {
            tracing::info!(
                "[Controller] step {} asked for clarification in a continuous workflow; skipping",
                step.id
            );
            let _ = exchange.resolve(ClarificationResponse::Skipped);
            if let Err(e) = channel.send_result(tool_use_id, ClarificationResponse::Skipped.to_payload()) {
                tracing::warn!("[Controller] {}", e);
            }
            return;
        }

        if let Err(e) = machine::pause_for_clarification(step) {
            tracing::warn!("[Controller] step {}: {}", step.id, e);
            return;
        }
        if let Err(e) = self.inner.persistence.save_step(step).await {
            tracing::warn!("[Controller] could not save step {}: {}", step.id, e);
        }
        active.slot().pending = Some(PendingClarification {
            workflow_id: step.workflow_id.clone(),
            step_id: step.id.clone(),
            tool_use_id: tool_use_id.to_string(),
            request: exchange.request.clone(),
        });
        active.publish_step(step);
        tracing::info!(
            "[Controller] step {} awaiting clarification ({} question(s))",
            step.id,
            exchange.request.questions.len()
        );
    }

    /// Decide what a finished run means for the step and the workflow.
    async fn settle(&self, active: &Arc<ActiveWorkflow>, end: RunEnd) -> Result<Flow, EngineError> {
        let RunEnd {
            mut step,
            terminal,
            paused_at_end,
            exchanges,
            interrupt,
        } = end;

        if matches!(terminal, Some(AgentPhase::Cancelled)) {
            if let Some(Interrupt::Skip(ack)) = interrupt {
                if step.status == StepStatus::Paused {
                    machine::skip(&mut step)?;
                    tracing::info!("[Controller] step {} skipped", step.id);
                    let flow = self.advance_after(active, &step).await?;
                    let _ = ack.send(step);
                    return Ok(flow);
                }
            }
            let reason = if paused_at_end { CANCELLED_WHILE_WAITING } else { CANCELLED };
            return self.finish_cancelled(active, step, reason).await;
        }

        let cancel_requested = matches!(interrupt, Some(Interrupt::Cancel));

        if step.status == StepStatus::Completed {
            if !exchanges.is_empty() {
                step.output_structured = self
                    .inner
                    .resolver
                    .fold(&exchanges, step.output_structured.as_ref());
            } else if step.output_structured.is_none() {
                step.output_structured = step.output_text.as_deref().and_then(extract_json_block);
            }
            tracing::info!(
                "[Controller] step {} ({}) completed in {}ms",
                step.step_number,
                step.step_type.as_str(),
                step.duration_ms.unwrap_or(0)
            );
            if cancel_requested {
                return self.finish_cancelled(active, step, CANCELLED).await;
            }
            return self.advance_after(active, &step).await;
        }

        if step.status != StepStatus::Failed {
            let message = match &terminal {
                Some(AgentPhase::Completed { .. }) => "agent completed while the step was not running",
                _ => "agent stream ended unexpectedly",
            };
            machine::fail(&mut step, message)?;
        }
        if cancel_requested {
            return self.finish_cancelled(active, step, CANCELLED).await;
        }

        let error = step.error_message.clone().unwrap_or_default();
        if step.retry_count < self.inner.config.max_auto_retries {
            tracing::warn!(
                "[Controller] step {} failed ({}); retrying automatically",
                step.step_number,
                error
            );
            machine::retry(&mut step)?;
            self.inner.persistence.save_step(&step).await?;
            active.publish_step(&step);
            return Ok(Flow::Continue);
        }

        let mut wf = active.record.lock().await;
        if wf.status.can_transition_to(WorkflowStatus::Failed) {
            wf.fail(failure_message(&step, &error))?;
        }
        self.inner.persistence.commit(&step, &wf).await?;
        active.publish_step(&step);
        active.publish_workflow(wf.status);
        tracing::warn!(
            "[Controller] workflow {} failed at step {}: {}",
            wf.id,
            step.step_number,
            error
        );
        Ok(Flow::Stop)
    }

    async fn finish_cancelled(
        &self,
        active: &Arc<ActiveWorkflow>,
        mut step: Step,
        reason: &str,
    ) -> Result<Flow, EngineError> {
        if !step.status.is_terminal() {
            machine::fail(&mut step, reason)?;
        }
        let mut wf = active.record.lock().await;
        if wf.status.can_transition_to(WorkflowStatus::Cancelled) {
            wf.transition(WorkflowStatus::Cancelled)?;
        }
        self.inner.persistence.commit(&step, &wf).await?;
        active.publish_step(&step);
        active.publish_workflow(wf.status);
        tracing::info!(
            "[Controller] workflow {} cancelled at step {} ({})",
            wf.id,
            step.step_number,
            reason
        );
        Ok(Flow::Stop)
    }

    /// Persist a finished (completed or skipped) step and move the workflow
    /// on: complete it, pause it with the next step pending, or continue.
    async fn advance_after(&self, active: &Arc<ActiveWorkflow>, step: &Step) -> Result<Flow, EngineError> {
        let mut wf = active.record.lock().await;
        self.advance_after_locked(active, &mut wf, step).await
    }

    async fn advance_after_locked(
        &self,
        active: &Arc<ActiveWorkflow>,
        wf: &mut Workflow,
        step: &Step,
    ) -> Result<Flow, EngineError> {
        let persistence = &self.inner.persistence;
        wf.current_step_number = wf.current_step_number.max(step.step_number);
        wf.updated_at = Utc::now();

        let mut next = None;
        let flow = if !wf.has_more_steps() {
            if wf.status.can_transition_to(WorkflowStatus::Completed) {
                wf.transition(WorkflowStatus::Completed)?;
                tracing::info!("[Controller] workflow {} completed", wf.id);
            }
            Flow::Stop
        } else if wf.status == WorkflowStatus::Paused
            || (wf.status == WorkflowStatus::Running && wf.pause_behavior.pauses_after(step.step_type))
        {
            if wf.status == WorkflowStatus::Running {
                wf.transition(WorkflowStatus::Paused)?;
                tracing::info!(
                    "[Controller] workflow {} paused after step {} ({})",
                    wf.id,
                    step.step_number,
                    step.step_type.as_str()
                );
            }
            next = Some(wf.current_step_number + 1);
            Flow::Stop
        } else if wf.status == WorkflowStatus::Running {
            Flow::Continue
        } else {
            Flow::Stop
        };

        persistence.commit(step, wf).await?;
        active.publish_step(step);
        active.publish_workflow(wf.status);

        if let Some(number) = next {
            let exists = persistence
                .list_steps(&wf.id)
                .await?
                .iter()
                .any(|s| s.step_number == number);
            if !exists {
                let pending = new_step(wf, number)?;
                persistence.save_step(&pending).await?;
                active.publish_step(&pending);
            }
        }
        Ok(flow)
    }

    async fn record_activity(&self, step: &Step, event: &StreamEvent) {
        let entry = ActivityEntry {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: step.workflow_id.clone(),
            step_id: step.id.clone(),
            event_type: event.kind().to_string(),
            tool_use_id: event.tool_use_id().map(str::to_string),
            payload: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.inner.persistence.append_activity(&entry).await {
            tracing::warn!("[Controller] could not record activity for {}: {}", step.id, e);
        }
    }
}

/// Finished, idle, and referenced only by the map; it can be reloaded from
/// storage on next use.
fn evictable(active: &Arc<ActiveWorkflow>) -> bool {
    Arc::strong_count(active) == 1
        && !active.is_driving()
        && active
            .record
            .try_lock()
            .map(|wf| wf.status.is_terminal())
            .unwrap_or(false)
}

/// A workflow persisted as running that no driver in this process owns,
/// typically left behind by a process that exited mid-step.
fn stranded(workflow: &Workflow) -> EngineError {
    tracing::warn!(
        "[Controller] workflow {} is marked running but has no live driver; run recover() first",
        workflow.id
    );
    EngineError::Protocol(format!(
        "workflow {} is marked running but nothing is driving it; recover it first",
        workflow.id
    ))
}

/// Statuses after which the driver may move to the next step.
fn allows_advance(status: StepStatus) -> bool {
    status.is_done() || status == StepStatus::Editing
}

fn new_step(workflow: &Workflow, number: u32) -> Result<Step, EngineError> {
    let step_type = workflow.step_type_at(number).ok_or_else(|| {
        EngineError::Internal(format!(
            "workflow {} has no step {} in its plan",
            workflow.id, number
        ))
    })?;
    Ok(Step::new(
        uuid::Uuid::new_v4().to_string(),
        workflow.id.clone(),
        number,
        step_type,
    ))
}

fn failure_message(step: &Step, error: &str) -> String {
    format!(
        "Step {} ({}) failed: {}",
        step.step_number,
        step.step_type.as_str(),
        error
    )
}
