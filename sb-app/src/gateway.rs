//! Event gateway: routes the unified account feed into the core.
//!
//! User-authored messages feed the inbound aggregator; account-originated
//! sends (our own replies and operator interventions alike) feed the
//! manual-message correlator, which sorts out which is which.

use anyhow::Result;
use sb_core::{InboundAggregator, ManualCorrelator};
use sb_transport::{InboundEvent, InboundEventKind, TargetKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    aggregator: InboundAggregator,
    correlator: ManualCorrelator,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>,
}

impl Gateway {
    pub fn new(
        aggregator: InboundAggregator,
        correlator: ManualCorrelator,
        inbound_rx: mpsc::Receiver<InboundEvent>,
    ) -> Self {
        Self {
            aggregator,
            correlator,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway shutdown requested");
                }
                result = self.run_loop() => {
                    if let Err(error) = result {
                        tracing::error!(%error, "gateway loop exited");
                    }
                }
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self) -> Result<()> {
        loop {
            let event = {
                let mut rx = self.inbound_rx.lock().await;
                rx.recv().await
            };
            let Some(event) = event else {
                return Ok(());
            };
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: InboundEvent) {
        if event.kind != InboundEventKind::Message {
            return;
        }
        if event.target != TargetKind::Direct {
            tracing::debug!(
                conversation = %event.conversation,
                target = ?event.target,
                "non-direct target, skipping"
            );
            return;
        }

        if event.sender_is_self {
            self.correlator.on_outgoing_event(&event);
            return;
        }

        if event.content.trim().is_empty() {
            return;
        }
        self.aggregator
            .on_message(&event.conversation, event.content, event.message_id);
    }
}
