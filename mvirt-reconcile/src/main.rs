//! mvirt-reconcile: plan or apply a stack against a store snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_reconcile::{CancelToken, Concurrency, MemoryStore, Reconciler, Stack};

/// mvirt stack reconciler
#[derive(Parser, Debug)]
#[command(name = "mvirt-reconcile", version, about)]
struct Args {
    /// Stack descriptor (JSON)
    #[arg(long)]
    stack: PathBuf,

    /// Store snapshot (JSON), created if missing
    #[arg(long, default_value = "mvirt-state.json")]
    state: PathBuf,

    /// Run managers concurrently
    #[arg(long)]
    parallel: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the actions a pass would take
    Plan,
    /// Run a pass and write the resulting state back
    Apply,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_reconcile=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let stack = Stack::from_file(&args.stack).await?;
    let store = Arc::new(MemoryStore::load(&args.state).await?);
    let concurrency = if args.parallel {
        Concurrency::Parallel
    } else {
        Concurrency::Sequential
    };
    let reconciler = Reconciler::with_default_managers(store.clone())
        .concurrency(concurrency)
        .build();
    info!(
        "Stack {}/{} with managers {:?}",
        stack.namespace,
        stack.name,
        reconciler.manager_names()
    );

    match args.command {
        Command::Plan => {
            let mut failed = false;
            for plan in reconciler.plan(&stack).await {
                match plan.actions {
                    Ok(actions) if actions.is_empty() => println!("{}: up to date", plan.manager),
                    Ok(actions) => {
                        for action in actions {
                            println!("{}: {}", plan.manager, action);
                        }
                    }
                    Err(e) => {
                        failed = true;
                        println!("{}: error: {}", plan.manager, e);
                    }
                }
            }
            if failed {
                bail!("Planning failed for stack {}", stack.name);
            }
        }
        Command::Apply => {
            let (cancel_handle, cancel) = CancelToken::pair();
            let pass = reconciler.reconcile(&stack, &cancel);
            tokio::pin!(pass);

            let finished = tokio::select! {
                outcome = &mut pass => Some(outcome),
                _ = tokio::signal::ctrl_c() => None,
            };
            let outcome = match finished {
                Some(outcome) => outcome,
                None => {
                    info!("Interrupted, finishing in-flight calls");
                    cancel_handle.cancel();
                    pass.await
                }
            };

            store.save(&args.state).await?;
            println!("{}", outcome);
            for failure in &outcome.failures {
                error!("{}", failure);
            }
            if !outcome.is_success() {
                bail!("Stack {} did not converge", stack.name);
            }
        }
    }

    Ok(())
}
