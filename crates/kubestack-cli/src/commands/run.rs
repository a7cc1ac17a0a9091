//! Deploy, destroy and plan commands.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use kubestack_core::{ChangeAction, Plan, StackStatus};
use kubestack_reconciler::ReconcilerConfig;
use kubestack_scheduler::{RunResult, StackEvent, StackOrchestrator};

use super::load;

/// Deploy `name` and its upstream stacks.
pub async fn deploy_unit(path: &Path, config: &ReconcilerConfig, name: &str) -> Result<()> {
    let file = load(path)?;
    let reconciler = config.build().await.context("Failed to set up reconciler")?;
    let orchestrator = StackOrchestrator::new(Arc::new(reconciler));

    info!(stack = %name, dry_run = config.dry_run, "Starting deploy");
    println!("Deploying {}{}", name, dry_run_marker(config));
    let (rx, handle) = orchestrator.deploy(&file.stacks, name)?;
    let result = follow(rx, handle).await?;

    if !result.outputs.is_empty() {
        println!("\n--- Outputs ---");
        for (stack, outputs) in &result.outputs {
            for (output, value) in outputs {
                println!("  {}.{} = {}", stack, output, value);
            }
        }
    }
    finish(&result, "Deploy")
}

/// Destroy `name` and every stack depending on it.
pub async fn destroy_unit(path: &Path, config: &ReconcilerConfig, name: &str) -> Result<()> {
    let file = load(path)?;
    let reconciler = config.build().await.context("Failed to set up reconciler")?;
    let orchestrator = StackOrchestrator::new(Arc::new(reconciler));

    info!(stack = %name, dry_run = config.dry_run, "Starting destroy");
    println!("Destroying {}{}", name, dry_run_marker(config));
    let (rx, handle) = orchestrator.destroy(&file.stacks, name)?;
    let result = follow(rx, handle).await?;
    finish(&result, "Destroy")
}

/// Print the plan of `name` and its upstream stacks without applying it.
///
/// Values bound from upstream outputs are taken from the recorded state of
/// the producing stacks. Until an upstream stack has been applied, nodes
/// bound to it are planned by declaration only.
pub async fn plan(path: &Path, config: &ReconcilerConfig, name: &str) -> Result<()> {
    let file = load(path)?;
    let reconciler = config.build().await.context("Failed to set up reconciler")?;

    let plans = reconciler
        .plan_unit(&file.stacks, name)
        .await
        .with_context(|| format!("Failed to plan stack: {}", name))?;
    for plan in &plans {
        print!("{}", render_plan(plan));
    }
    Ok(())
}

/// Print events as they arrive and return the final result.
async fn follow(
    mut rx: mpsc::Receiver<StackEvent>,
    handle: JoinHandle<RunResult>,
) -> Result<RunResult> {
    while let Some(event) = rx.recv().await {
        match event {
            StackEvent::StatusChanged { stack, to, .. } => match to {
                StackStatus::Planning => println!("\n▶ Stack '{}' planning", stack),
                StackStatus::Applying => println!("  applying"),
                StackStatus::Converged => println!("✓ Stack '{}' converged", stack),
                StackStatus::Failed => println!("✗ Stack '{}' failed", stack),
                StackStatus::Pending => {}
            },
            StackEvent::PlanReady { plan, .. } => {
                println!("  {}", plan.summary());
            }
            StackEvent::NodeApplied { change, .. } => {
                println!("  {} {} [{}]", marker(change.action), change.node, change.kind);
            }
            StackEvent::StackFailed { message, .. } => {
                println!("  error: {}", message);
            }
            StackEvent::RunCompleted { run_id, success } => {
                let outcome = if success { "completed" } else { "failed" };
                println!("\n--- Run {} {} ---", run_id, outcome);
            }
        }
    }
    handle.await.context("Run task failed")
}

fn finish(result: &RunResult, what: &str) -> Result<()> {
    println!("\n--- Stack Summary ---");
    for (stack, status) in &result.statuses {
        println!("  {} - {}", stack, status);
    }
    if result.success {
        println!("\n✓ {} succeeded!", what);
        Ok(())
    } else {
        anyhow::bail!("{} failed", what);
    }
}

fn dry_run_marker(config: &ReconcilerConfig) -> &'static str {
    if config.dry_run { " (dry run)" } else { "" }
}

fn marker(action: ChangeAction) -> &'static str {
    match action {
        ChangeAction::Create => "+",
        ChangeAction::Update => "~",
        ChangeAction::Delete => "-",
        ChangeAction::NoOp => " ",
    }
}

fn render_plan(plan: &Plan) -> String {
    let mut out = format!("{}: {}\n", plan.stack, plan.summary());
    for change in &plan.changes {
        out.push_str(&format!(
            "  {} {} [{}] {}\n",
            marker(change.action),
            change.node,
            change.kind,
            change.action
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubestack_core::{ResourceChange, ResourceKind};

    #[test]
    fn test_render_plan() {
        let plan = Plan {
            stack: "FastApiService".to_string(),
            changes: vec![
                ResourceChange {
                    node: "Deployment".to_string(),
                    kind: ResourceKind::RawManifest,
                    action: ChangeAction::NoOp,
                },
                ResourceChange {
                    node: "Record".to_string(),
                    kind: ResourceKind::DnsRecord,
                    action: ChangeAction::Create,
                },
            ],
        };
        assert_eq!(
            render_plan(&plan),
            "FastApiService: 1 to add, 0 to change, 0 to destroy, 1 unchanged\n    Deployment [raw-manifest] no-op\n  + Record [dns-record] create\n"
        );
    }
}
