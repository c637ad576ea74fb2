/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Workload steps that ship with the binary.

use crate::{
    config::ShellStep,
    worker::{Context, Worker, WorkloadStep, DEFAULT_WORKLOAD},
};
use anyhow::{anyhow, Context as _};
use std::{
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::process::Command;
use tracing::trace;

const DUMMY_SLEEP: Duration = Duration::from_millis(10);

pub fn register_builtin(worker: &mut dyn Worker) {
    worker.add_workload_step(WorkloadStep::new(
        DEFAULT_WORKLOAD,
        "Sleeps briefly and succeeds",
        |_| async {
            tokio::time::sleep(DUMMY_SLEEP).await;
            Ok(())
        },
    ));

    let calls = Arc::new(AtomicU64::new(0));
    worker.add_workload_step(WorkloadStep::new(
        "dummy-with-errors",
        "Sleeps briefly and fails every other call",
        move |_| {
            let call = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                tokio::time::sleep(DUMMY_SLEEP).await;
                match call % 2 {
                    0 => Ok(()),
                    _ => Err(anyhow!("Dummy failure on call {}", call)),
                }
            }
        },
    ));
}

pub fn register_shell_steps(worker: &mut dyn Worker, steps: &[ShellStep]) -> anyhow::Result<()> {
    for step in steps {
        // reject commands that cannot be split before anything runs
        let words = shlex::split(&step.command)
            .filter(|words| !words.is_empty())
            .ok_or(anyhow!(
                "Command of step {} is not POSIX compliant: {}",
                step.name,
                step.command
            ))?;

        let description = step
            .description
            .clone()
            .unwrap_or_else(|| step.command.clone());
        let words = Arc::new(words);
        worker.add_workload_step(WorkloadStep::new(&step.name, &description, move |ctx| {
            run_command(words.clone(), ctx)
        }));
    }
    Ok(())
}

/// Runs a command to completion, exporting the context as `LOADLAB_*` variables.
async fn run_command(words: Arc<Vec<String>>, ctx: Context) -> anyhow::Result<()> {
    let (program, args) = words
        .split_first()
        .context("Shell step has an empty command")?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env("LOADLAB_WORKER_INDEX", ctx.worker_index.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in ctx.values.iter() {
        cmd.env(env_name(key), value);
    }

    let output = cmd
        .output()
        .await
        .context(format!("Failed to spawn {}", program))?;
    trace!(program = %program, status = %output.status, "shell step finished");

    if output.status.success() {
        Ok(())
    } else {
        Err(anyhow!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

fn env_name(key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| match c.is_ascii_alphanumeric() {
            true => c.to_ascii_uppercase(),
            false => '_',
        })
        .collect();
    format!("LOADLAB_{}", key)
}
