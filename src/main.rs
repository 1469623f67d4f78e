mod echo;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use trellis_core::config::Manifest;
use trellis_core::types::ProjectId;
use trellis_engine::{Dag, Engine, FanOut, HandlerRegistry, ProfileRegistry};
use trellis_memory::MemoryHub;

use crate::echo::EchoRuntime;

#[derive(Parser)]
#[command(name = "trellis", version, about = "DAG task engine with budgeted, tiered memory")]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a manifest without running anything
    Validate {
        /// Path to the manifest
        manifest: PathBuf,
    },
    /// Run one task through the DAG and print the concluded task as JSON
    Run {
        /// Path to the manifest
        manifest: PathBuf,
        /// Task input (JSON; plain text is taken as a string)
        #[arg(short, long, default_value = "null")]
        input: String,
        /// Project id shared with other tasks
        #[arg(short, long, default_value = "default", env = "TRELLIS_PROJECT")]
        project: String,
        /// Run N clones of the task instead of the task itself
        #[arg(long, conflicts_with = "subtasks")]
        clones: Option<usize>,
        /// Run one subtask per element of this JSON array
        #[arg(long)]
        subtasks: Option<String>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "trellis=debug,trellis_engine=debug,trellis_memory=debug,warn"
    } else {
        "trellis=info,trellis_engine=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "trellis", &mut std::io::stdout());
            Ok(())
        }
        Commands::Validate { manifest } => validate(&manifest),
        Commands::Run {
            manifest,
            input,
            project,
            clones,
            subtasks,
        } => {
            let fan = match (clones, subtasks) {
                (Some(n), _) => Some(FanOut::Clones(n)),
                (None, Some(raw)) => {
                    let items: Vec<serde_json::Value> =
                        serde_json::from_str(&raw).context("--subtasks must be a JSON array")?;
                    Some(FanOut::Subtasks(items))
                }
                (None, None) => None,
            };
            run(&manifest, parse_input(&input), ProjectId::from_str(&project), fan).await
        }
    }
}

fn load(path: &Path) -> anyhow::Result<Manifest> {
    Manifest::load(path).with_context(|| format!("loading manifest {}", path.display()))
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let manifest = load(path)?;
    let profiles = ProfileRegistry::from_manifest(&manifest)?;
    let dag = Dag::from_manifest(&manifest, &profiles, &HandlerRegistry::with_builtins())?;
    info!(
        nodes = dag.len(),
        profiles = profiles.len(),
        entry = dag.entry(),
        "Manifest is valid"
    );
    println!(
        "{}: ok ({} nodes, {} profiles, entry '{}')",
        path.display(),
        dag.len(),
        profiles.len(),
        dag.entry()
    );
    Ok(())
}

/// JSON when it parses, a plain string otherwise.
fn parse_input(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

async fn run(
    path: &Path,
    input: serde_json::Value,
    project: ProjectId,
    fan: Option<FanOut>,
) -> anyhow::Result<()> {
    let manifest = load(path)?;
    let engine = Arc::new(Engine::from_manifest(
        &manifest,
        Arc::new(EchoRuntime),
        Arc::new(MemoryHub::new()),
    )?);

    let mut events = engine.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(task_id = %event.task_id(), event = ?event, "Engine event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let id = engine.submit(project, input).await;
    let mut worker = {
        let engine = Arc::clone(&engine);
        let id = id.clone();
        tokio::spawn(async move {
            match fan {
                Some(fan) => engine.fan_out(&id, fan).await.map(|_| ()),
                None => engine.run(&id).await.map(|_| ()),
            }
        })
    };

    tokio::select! {
        result = &mut worker => result??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling running tasks");
            engine.shutdown();
            worker.await??;
        }
    }

    let task = engine.snapshot(&id).await?;
    let mut children = Vec::with_capacity(task.children.len());
    for child in &task.children {
        children.push(engine.snapshot(child).await?);
    }

    let report = serde_json::json!({
        "task": task,
        "children": children,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
