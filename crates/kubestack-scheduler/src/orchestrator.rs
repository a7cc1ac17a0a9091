//! Stack orchestrator - converges deployment units in dependency order.

use kubestack_core::{
    OutputStore, Plan, Reconciler, ResourceChange, Result, RunId, Stack, StackOutputs,
    StackSet, StackStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Event emitted during a run.
#[derive(Debug, Clone)]
pub enum StackEvent {
    StatusChanged {
        stack: String,
        from: StackStatus,
        to: StackStatus,
    },
    PlanReady {
        stack: String,
        plan: Plan,
    },
    NodeApplied {
        stack: String,
        change: ResourceChange,
    },
    StackFailed {
        stack: String,
        message: String,
    },
    RunCompleted {
        run_id: RunId,
        success: bool,
    },
}

/// Result of a deploy or destroy run.
#[derive(Debug)]
pub struct RunResult {
    pub run_id: RunId,
    pub success: bool,
    /// Final status of every stack in the run, in run order.
    pub statuses: Vec<(String, StackStatus)>,
    /// Outputs of the stacks that converged.
    pub outputs: BTreeMap<String, StackOutputs>,
    /// Failure message per failed stack.
    pub errors: BTreeMap<String, String>,
}

impl RunResult {
    pub fn status(&self, stack: &str) -> Option<StackStatus> {
        self.statuses
            .iter()
            .find(|(name, _)| name == stack)
            .map(|(_, status)| *status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Deploy,
    Destroy,
}

/// Runs stacks one at a time, upstream first for deploys and downstream
/// first for destroys. The first failure ends the run; stacks not reached
/// stay PENDING.
pub struct StackOrchestrator {
    reconciler: Arc<dyn Reconciler>,
}

impl StackOrchestrator {
    pub fn new(reconciler: Arc<dyn Reconciler>) -> Self {
        Self { reconciler }
    }

    /// Deploy `target` and everything it depends on, returning a channel of
    /// events and a handle to get the final result.
    pub fn deploy(
        &self,
        set: &StackSet,
        target: &str,
    ) -> Result<(mpsc::Receiver<StackEvent>, tokio::task::JoinHandle<RunResult>)> {
        let stacks = Self::with_dependencies(set, set.deploy_order(target)?)?;
        Ok(self.spawn(RunKind::Deploy, stacks))
    }

    /// Destroy `target` and everything that depends on it, dependents first.
    pub fn destroy(
        &self,
        set: &StackSet,
        target: &str,
    ) -> Result<(mpsc::Receiver<StackEvent>, tokio::task::JoinHandle<RunResult>)> {
        let stacks = Self::with_dependencies(set, set.destroy_order(target)?)?;
        Ok(self.spawn(RunKind::Destroy, stacks))
    }

    fn with_dependencies(set: &StackSet, order: Vec<&Stack>) -> Result<Vec<(Stack, Vec<String>)>> {
        order
            .into_iter()
            .map(|stack| {
                let deps = set
                    .dependencies(stack.name())?
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                Ok((stack.clone(), deps))
            })
            .collect()
    }

    fn spawn(
        &self,
        kind: RunKind,
        stacks: Vec<(Stack, Vec<String>)>,
    ) -> (mpsc::Receiver<StackEvent>, tokio::task::JoinHandle<RunResult>) {
        let (tx, rx) = mpsc::channel(100);
        let reconciler = self.reconciler.clone();
        let handle = tokio::spawn(async move { Self::run_inner(reconciler, kind, stacks, tx).await });
        (rx, handle)
    }

    async fn run_inner(
        reconciler: Arc<dyn Reconciler>,
        kind: RunKind,
        stacks: Vec<(Stack, Vec<String>)>,
        tx: mpsc::Sender<StackEvent>,
    ) -> RunResult {
        let run_id = RunId::new();
        info!(run_id = %run_id, ?kind, stacks = stacks.len(), "Starting run");

        let mut statuses: HashMap<String, StackStatus> = stacks
            .iter()
            .map(|(s, _)| (s.name().to_string(), StackStatus::Pending))
            .collect();
        let mut outputs = OutputStore::new();
        let mut converged_outputs = BTreeMap::new();
        let mut errors = BTreeMap::new();

        for (stack, deps) in &stacks {
            if kind == RunKind::Deploy {
                let blocked: Vec<&String> = deps
                    .iter()
                    .filter(|d| statuses.get(*d) != Some(&StackStatus::Converged))
                    .collect();
                if !blocked.is_empty() {
                    info!(stack = %stack.name(), ?blocked, "Upstream stacks not converged, leaving pending");
                    continue;
                }
            }

            let mut unit = Unit {
                stack: stack.name(),
                status: StackStatus::Pending,
                tx: &tx,
            };
            let outcome = match kind {
                RunKind::Deploy => {
                    Self::deploy_stack(reconciler.as_ref(), stack, &outputs, &mut unit).await
                }
                RunKind::Destroy => Self::destroy_stack(reconciler.as_ref(), stack, &mut unit)
                    .await
                    .map(|()| StackOutputs::new()),
            };

            match outcome {
                Ok(stack_outputs) => {
                    info!(stack = %stack.name(), "Stack converged");
                    if kind == RunKind::Deploy {
                        outputs.insert(stack.name(), stack_outputs.clone());
                        converged_outputs.insert(stack.name().to_string(), stack_outputs);
                    }
                }
                Err(e) => {
                    error!(stack = %stack.name(), error = %e, "Stack failed");
                    unit.set(StackStatus::Failed).await;
                    let _ = tx
                        .send(StackEvent::StackFailed {
                            stack: stack.name().to_string(),
                            message: e.to_string(),
                        })
                        .await;
                    errors.insert(stack.name().to_string(), e.to_string());
                }
            }
            statuses.insert(stack.name().to_string(), unit.status);
            if unit.status == StackStatus::Failed {
                break;
            }
        }

        let success = statuses.values().all(|s| *s == StackStatus::Converged);
        let _ = tx.send(StackEvent::RunCompleted { run_id, success }).await;
        info!(run_id = %run_id, success, "Run completed");

        RunResult {
            run_id,
            success,
            statuses: stacks
                .iter()
                .map(|(s, _)| {
                    let status = statuses
                        .get(s.name())
                        .copied()
                        .unwrap_or(StackStatus::Pending);
                    (s.name().to_string(), status)
                })
                .collect(),
            outputs: converged_outputs,
            errors,
        }
    }

    /// Plan, apply and collect the outputs of one stack.
    async fn deploy_stack(
        reconciler: &dyn Reconciler,
        stack: &Stack,
        outputs: &OutputStore,
        unit: &mut Unit<'_>,
    ) -> Result<StackOutputs> {
        unit.advance(StackStatus::Planning).await?;
        let resolved = stack.resolve(outputs)?;
        let plan = reconciler.plan(&resolved).await?;
        info!(stack = %stack.name(), summary = %plan.summary(), "Plan ready");
        unit.send(StackEvent::PlanReady {
            stack: stack.name().to_string(),
            plan: plan.clone(),
        })
        .await;

        unit.advance(StackStatus::Applying).await?;
        let report = reconciler.apply(&resolved, &plan).await?;
        for change in report.applied {
            unit.send(StackEvent::NodeApplied {
                stack: stack.name().to_string(),
                change,
            })
            .await;
        }
        let stack_outputs = resolved.collect_outputs(&report.attributes)?;
        unit.advance(StackStatus::Converged).await?;
        Ok(stack_outputs)
    }

    /// Delete every resource recorded for one stack.
    async fn destroy_stack(reconciler: &dyn Reconciler, stack: &Stack, unit: &mut Unit<'_>) -> Result<()> {
        unit.advance(StackStatus::Planning).await?;
        unit.advance(StackStatus::Applying).await?;
        for change in reconciler.destroy(stack.name()).await? {
            unit.send(StackEvent::NodeApplied {
                stack: stack.name().to_string(),
                change,
            })
            .await;
        }
        unit.advance(StackStatus::Converged).await?;
        Ok(())
    }
}

/// Status of the stack being run, reported on every change.
struct Unit<'a> {
    stack: &'a str,
    status: StackStatus,
    tx: &'a mpsc::Sender<StackEvent>,
}

impl Unit<'_> {
    async fn send(&self, event: StackEvent) {
        let _ = self.tx.send(event).await;
    }

    async fn advance(&mut self, next: StackStatus) -> Result<()> {
        let from = self.status;
        self.status = from.transition(self.stack, next)?;
        self.send(StackEvent::StatusChanged {
            stack: self.stack.to_string(),
            from,
            to: next,
        })
        .await;
        Ok(())
    }

    async fn set(&mut self, next: StackStatus) {
        if let Err(e) = self.advance(next).await {
            error!(stack = %self.stack, error = %e, "Invalid status change");
            self.status = next;
        }
    }
}
