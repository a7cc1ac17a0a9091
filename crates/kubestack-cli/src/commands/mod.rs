//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use std::path::Path;

use kubestack_config::{StackFile, load_stack_file};
use kubestack_core::Stack;

/// Load the stack file, naming it in any error.
pub fn load(path: &Path) -> Result<StackFile> {
    load_stack_file(path)
        .with_context(|| format!("Failed to load stack file: {}", path.display()))
}

pub fn validate(path: &Path) -> Result<()> {
    let file = load(path)?;
    let nodes: usize = file.stacks.topological_order().map(|s| s.graph().len()).sum();
    println!(
        "Configuration is valid: {} stacks, {} nodes ({} / {})",
        file.stacks.len(),
        nodes,
        file.environment.account,
        file.environment.region
    );
    Ok(())
}

pub fn graph(path: &Path, name: Option<&str>) -> Result<()> {
    let file = load(path)?;
    let stacks: Vec<&Stack> = match name {
        Some(name) => vec![file.stacks.stack(name)?],
        None => file.stacks.topological_order().collect(),
    };

    for stack in stacks {
        let deps = file.stacks.dependencies(stack.name())?;
        if deps.is_empty() {
            println!("{}", stack.name());
        } else {
            println!("{} (after {})", stack.name(), deps.join(", "));
        }
        print!("{}", render_nodes(stack));
        for (output, def) in stack.outputs() {
            let node = stack.graph().node(def.node).map(|n| n.name()).unwrap_or("?");
            println!("  => {} = {}.{}", output, node, def.attribute);
        }
    }
    Ok(())
}

/// One line per node in apply order, with its direct dependencies.
fn render_nodes(stack: &Stack) -> String {
    let graph = stack.graph();
    let mut out = String::new();
    for (position, id) in graph.topological_order().enumerate() {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let deps: Vec<&str> = graph
            .dependencies(id)
            .filter_map(|d| graph.node(d).map(|n| n.name()))
            .collect();
        out.push_str(&format!("  {}. {} [{}]", position + 1, node.name(), node.kind()));
        if !deps.is_empty() {
            out.push_str(&format!(" <- {}", deps.join(", ")));
        }
        out.push('\n');
    }
    out
}
