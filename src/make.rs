//! One-shot `make` mode: install dependencies, compile every enabled
//! target once (postprocess included), print the deduplicated error
//! reports, and exit.

use std::path::{Path, PathBuf};

use anyhow::Result;
use rustc_hash::FxHashSet;

use crate::compile::{self, PrioritizedOutputs};
use crate::postprocess::worker::WorkerPool;
use crate::project::{CompilationMode, RunMode, Status};
use crate::{clock, config, errors, log, logger};

/// Returns the process exit code: 0 on success, 1 when any compile or
/// configuration error surfaced.
pub fn run_make(
    config_path: &Path,
    enabled: Option<FxHashSet<String>>,
    mode: CompilationMode,
) -> Result<i32> {
    let mut project = config::load_project(config_path, enabled.as_ref())?;
    for (_, _, state) in project.outputs_mut() {
        state.compilation_mode = mode;
    }

    let manifests: Vec<PathBuf> = project.elm_jsons.iter().map(|e| e.path.clone()).collect();
    if !compile::install_dependencies(&manifests) {
        return Ok(1);
    }

    let pool = WorkerPool::new();
    let (part_tx, part_rx) = crossbeam::channel::unbounded();
    let no_priorities = PrioritizedOutputs::default();

    std::thread::scope(|scope| {
        let mut in_flight = 0usize;
        loop {
            let actions =
                compile::get_output_actions(&mut project, RunMode::Make, true, &no_priorities);
            for action in actions.actions {
                let job = compile::begin_action(&mut project, action, RunMode::Make);
                let tx = part_tx.clone();
                let pool = &pool;
                scope.spawn(move || {
                    let _ = tx.send(compile::perform(job, pool));
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }
            let Ok(part) = part_rx.recv() else {
                break;
            };
            in_flight -= 1;
            compile::apply_outcome(&mut project, part, clock::now_ms());
        }
    });
    pool.terminate();

    let fancy = logger::fancy();
    let mut rendered: Vec<String> = project
        .elm_json_errors
        .iter()
        .map(|entry| errors::render_config_error(&entry.output_name, &entry.error, fancy))
        .collect();
    for (_, output, state) in project.outputs() {
        match &state.status {
            Status::Error(error) => {
                rendered.push(errors::render_output_error(output.original(), error, fancy));
            }
            Status::Success { .. } => {
                log!("make"; "{}: compiled", output.original());
            }
            _ => {}
        }
    }

    let deduped = errors::dedup_rendered(rendered);
    for report in &deduped {
        logger::line(report);
        logger::line("");
    }
    if deduped.is_empty() {
        Ok(0)
    } else {
        logger::line(&errors::error_count_line(deduped.len(), fancy));
        Ok(1)
    }
}
