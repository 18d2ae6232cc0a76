//! Streaming daemon loop.
//!
//! A reader thread turns the input stream into lines on a bounded channel.
//! The main loop forwards lines to the worker pool and, between lines, polls
//! the signal flags: SIGHUP reloads the rule document, SIGINT/SIGTERM stop
//! intake and drain everything already queued. EOF drains the same way.

use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, bounded};

use super::signals::SignalFlags;
use crate::core::config::PipelineConfig;
use crate::core::errors::{CfnError, Result};
use crate::pipeline::{Funnel, FunnelWorkers, Job, WorkerReport};
use crate::policy::ReloadOutcome;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

enum Input {
    Line { number: u64, line: String },
    Failed(std::io::Error),
}

/// Run until EOF or a shutdown signal, then drain and report.
pub fn run<R>(
    funnel: Arc<Funnel>,
    input: R,
    pipeline: &PipelineConfig,
    signals: &SignalFlags,
) -> Result<WorkerReport>
where
    R: BufRead + Send + 'static,
{
    let workers = FunnelWorkers::start(Arc::clone(&funnel), pipeline.workers, pipeline.queue_depth)?;
    let (tx, rx) = bounded::<Input>(pipeline.queue_depth.max(1));

    // Not joined: a reader blocked on stdin must not hold up shutdown.
    thread::Builder::new()
        .name("cfn-reader".to_string())
        .spawn(move || {
            for (idx, line) in input.lines().enumerate() {
                let msg = match line {
                    Ok(line) => Input::Line {
                        number: idx as u64 + 1,
                        line,
                    },
                    Err(e) => Input::Failed(e),
                };
                let failed = matches!(msg, Input::Failed(_));
                if tx.send(msg).is_err() || failed {
                    break;
                }
            }
        })
        .map_err(|e| CfnError::Runtime {
            details: format!("failed to spawn input reader: {e}"),
        })?;

    log::info!(
        "daemon started: {} workers, queue depth {}, rules generation {}",
        pipeline.workers,
        pipeline.queue_depth,
        funnel.rules().snapshot().generation()
    );

    loop {
        if signals.take_reload() {
            reload_rules(&funnel);
        }
        if signals.shutdown_requested() {
            log::info!("shutdown requested; draining {} queued unit(s)", workers.queued());
            break;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Input::Line { number, line }) => {
                if line.trim().is_empty() {
                    continue;
                }
                workers.submit(Job::Line {
                    line,
                    fallback_id: format!("input-line-{number}"),
                })?;
            }
            Ok(Input::Failed(e)) => {
                log::error!("input stream failed: {e}; draining");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::info!("input closed; draining");
                break;
            }
        }
    }

    let report = workers.shutdown();
    let stats = funnel.counters().snapshot();
    log::info!(
        "daemon stopped: {} processed, {} failed, escalation ratio {:.3}",
        report.processed,
        report.failed,
        stats.escalation_ratio()
    );
    Ok(report)
}

fn reload_rules(funnel: &Funnel) {
    let store = funnel.rules();
    let Some(source) = store.source() else {
        log::warn!("reload requested but no rules_path is configured");
        return;
    };
    match store.reload() {
        Ok(ReloadOutcome::Swapped { generation }) => {
            log::info!("reloaded {} as generation {generation}", source.display());
        }
        Ok(ReloadOutcome::Unchanged { generation }) => {
            log::info!("{} unchanged; generation {generation} stays live", source.display());
        }
        Err(e) => {
            log::error!(
                "rule reload rejected: {e}; generation {} stays live",
                store.snapshot().generation()
            );
        }
    }
}
