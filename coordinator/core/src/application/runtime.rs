// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Coordinator Runtime - Application Layer
//!
//! Boots the coordinator and owns its long-running tasks:
//!
//! ```text
//! collector ─▶ new_action ─▶ dispatcher ─▶ command_ready ─▶ [batch] send_commands
//!     │
//!     └──────▶ command_returned ─▶ [batch] return_commands ─▶ command_done ─▶ [batch] update_actions
//!
//! heartbeat listener ─▶ detect_dup ─▶ dup killer
//! results listener, self heartbeat, janitor, queue cleanup
//! ```
//!
//! Every task shares one [`CancellationToken`]. A fatal error anywhere is
//! reported on the terminate channel; [`CoordinatorRuntime::wait_for_termination`]
//! returns its reason so the caller can shut down.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::aggregator::Aggregator;
use crate::application::batch::{run_batches, BatchSettings};
use crate::application::collector::Collector;
use crate::application::context::{ChannelReceivers, CoordinatorContext};
use crate::application::dispatcher::Dispatcher;
use crate::application::error::{CoordinatorError, ErrorKind};
use crate::application::janitor::Janitor;
use crate::application::listeners::{HeartbeatListener, ResultsListener, SelfHeartbeat};
use crate::domain::investigator::Investigator;
use crate::infrastructure::broker::{Exchange, HEARTBEAT_QUEUE, RESULTS_QUEUE};

pub struct CoordinatorRuntime {
    ctx: Arc<CoordinatorContext>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    terminate: mpsc::UnboundedReceiver<String>,
}

impl CoordinatorRuntime {
    /// Registers the scheduler investigator, declares the coordinator queues
    /// and spawns every task.
    pub async fn start(
        ctx: Arc<CoordinatorContext>,
        receivers: ChannelReceivers,
        scheduler_investigator: Option<Investigator>,
    ) -> Result<Self, CoordinatorError> {
        if let Some(investigator) = scheduler_investigator {
            register_investigator(&ctx, &investigator).await?;
        }
        declare_queues(&ctx).await?;

        let cancel = CancellationToken::new();
        let ChannelReceivers {
            new_action,
            command_ready,
            command_returned,
            command_done,
            detect_dup,
            terminate,
        } = receivers;
        let settings = BatchSettings::from(&ctx.config.batching);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(Dispatcher::new(ctx.clone()).run(new_action, cancel.clone())));

        let dispatcher = Arc::new(Dispatcher::new(ctx.clone()));

        tasks.push(tokio::spawn({
            let dispatcher = dispatcher.clone();
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            async move {
                run_batches(
                    "command_ready",
                    command_ready,
                    settings,
                    cancel,
                    |command| command.id,
                    |commands| {
                        let dispatcher = dispatcher.clone();
                        let ctx = ctx.clone();
                        async move {
                            match dispatcher.send_commands(commands).await {
                                Ok(_) => {}
                                Err(e) if e.kind() == ErrorKind::Fatal => ctx.request_termination(e.to_string()),
                                Err(e) => error!(error = %e, "failed to send commands"),
                            }
                        }
                    },
                )
                .await
            }
        }));

        let aggregator = Arc::new(Aggregator::new(ctx.clone()));
        tasks.push(tokio::spawn({
            let aggregator = aggregator.clone();
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            async move {
                run_batches(
                    "command_returned",
                    command_returned,
                    settings,
                    cancel,
                    |path| path.clone(),
                    |paths| {
                        let aggregator = aggregator.clone();
                        let ctx = ctx.clone();
                        async move {
                            for action_id in aggregator.return_commands(paths).await {
                                if ctx.channels.command_done.send(action_id).await.is_err() {
                                    warn!("command done channel closed");
                                    break;
                                }
                            }
                        }
                    },
                )
                .await
            }
        }));

        tasks.push(tokio::spawn({
            let cancel = cancel.clone();
            async move {
                run_batches(
                    "command_done",
                    command_done,
                    settings,
                    cancel,
                    |id| *id,
                    |ids| {
                        let aggregator = aggregator.clone();
                        async move { aggregator.update_actions(ids).await }
                    },
                )
                .await
            }
        }));

        tasks.push(HeartbeatListener::new(ctx.clone()).start(cancel.clone()).await?);
        tasks.push(ResultsListener::new(ctx.clone()).start(cancel.clone()).await?);
        tasks.push(SelfHeartbeat::new(ctx.clone()).start(cancel.clone()));

        tasks.push(Arc::new(Collector::new(ctx.clone())).start(cancel.clone()));

        let janitor = Arc::new(Janitor::new(ctx.clone()));
        tasks.push(janitor.clone().start_periodic(cancel.clone()));
        tasks.push(janitor.clone().start_queue_cleanup(cancel.clone()));
        tasks.push(janitor.start_dup_killer(detect_dup, cancel.clone()));

        info!(name = %ctx.name, tasks = tasks.len(), "coordinator started");
        Ok(Self {
            ctx,
            cancel,
            tasks,
            terminate,
        })
    }

    pub fn context(&self) -> &Arc<CoordinatorContext> {
        &self.ctx
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves with the reason of the first termination request.
    pub async fn wait_for_termination(&mut self) -> String {
        self.terminate
            .recv()
            .await
            .unwrap_or_else(|| "terminate channel closed".to_string())
    }

    /// Cancels every task, waits for them to drain and closes the broker.
    pub async fn shutdown(self) {
        info!("shutting down coordinator");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "coordinator task ended abnormally");
            }
        }
        if let Err(e) = self.ctx.broker.close().await {
            warn!(error = %e, "failed to close broker connection");
        }
        info!("coordinator stopped");
    }
}

async fn register_investigator(ctx: &CoordinatorContext, investigator: &Investigator) -> Result<(), CoordinatorError> {
    let investigators = &ctx.repos.investigators;
    if investigators
        .investigator_by_fingerprint(&investigator.fingerprint)
        .await?
        .is_some()
    {
        return Ok(());
    }
    investigators.insert_investigator(investigator).await?;
    info!(
        name = %investigator.name,
        fingerprint = %investigator.fingerprint,
        "registered scheduler investigator"
    );
    Ok(())
}

async fn declare_queues(ctx: &CoordinatorContext) -> Result<(), CoordinatorError> {
    for queue in [HEARTBEAT_QUEUE, RESULTS_QUEUE] {
        ctx.broker.declare_queue(queue, Exchange::ToSchedulers, queue).await?;
    }
    Ok(())
}
