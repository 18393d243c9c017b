//! The processing pipeline.
//!
//! Inputs push into one bounded channel. A single ingestion worker owns the receiving side
//! and the output buffer: it runs the parser chain, then the filter chain, buffers the
//! survivors and flushes them to every output when the buffer is full or the flush ticker
//! fires. Because only that worker touches the buffer, events reach outputs in exactly the
//! order the worker received them.

use crate::event::Event;
use crate::metrics::{
    EVENTS_DROPPED_TOTAL, EVENTS_INGESTED_TOTAL, FLUSH_DURATION, OUTPUT_ERRORS_TOTAL,
    PARSE_FAILURES_TOTAL,
};
use crate::plugin::{Filter, Input, Output, Parser, Plugin};
use anyhow::{bail, Result};
use futures_util::FutureExt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BUFFER_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Buffered events that force a flush.
    pub buffer_size: usize,
    pub flush_interval: Duration,
    /// Capacity of the ingestion channel shared by all inputs.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Stopped,
}

pub struct Engine {
    config: EngineConfig,
    inputs: Vec<Arc<dyn Input>>,
    parsers: Vec<Arc<dyn Parser>>,
    filters: Vec<Arc<dyn Filter>>,
    outputs: Vec<Arc<dyn Output>>,
    cancel_token: CancellationToken,
    tracker: TaskTracker,
    state: EngineState,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            inputs: Vec::new(),
            parsers: Vec::new(),
            filters: Vec::new(),
            outputs: Vec::new(),
            cancel_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            state: EngineState::Created,
        }
    }

    pub fn add_input(&mut self, input: Arc<dyn Input>) {
        self.inputs.push(input);
    }

    /// Parsers run in registration order; the first success wins.
    pub fn add_parser(&mut self, parser: Arc<dyn Parser>) {
        self.parsers.push(parser);
    }

    /// Filters run in registration order; the first drop ends the chain.
    pub fn add_filter(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn add_output(&mut self, output: Arc<dyn Output>) {
        self.outputs.push(output);
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token cancelled by [`stop`](Self::stop); other agent tasks can hang off it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Spawns one task per input plus the ingestion worker. Must run inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.state != EngineState::Created {
            bail!("engine cannot be started from state {:?}", self.state);
        }
        if self.outputs.is_empty() {
            warn!("engine starting without outputs; events will be discarded");
        }

        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity.max(1));

        for input in &self.inputs {
            let input = input.clone();
            let event_tx = event_tx.clone();
            let cancel_token = self.cancel_token.child_token();
            self.tracker.spawn(async move {
                let name = input.name().to_string();
                debug!(input = %name, tag = input.tag(), "input starting");
                match input.start(cancel_token, event_tx).await {
                    Ok(()) => debug!(input = %name, "input stopped"),
                    Err(err) => error!(input = %name, error = %format!("{err:#}"), "input stopped with error"),
                }
            });
        }
        drop(event_tx);

        let worker = IngestWorker {
            parsers: self.parsers.clone(),
            filters: self.filters.clone(),
            outputs: self.outputs.clone(),
            buffer: Vec::with_capacity(self.config.buffer_size),
            buffer_size: self.config.buffer_size.max(1),
        };
        self.tracker.spawn(worker.run(
            event_rx,
            self.config.flush_interval,
            self.cancel_token.clone(),
        ));

        self.state = EngineState::Running;
        info!(
            inputs = self.inputs.len(),
            parsers = self.parsers.len(),
            filters = self.filters.len(),
            outputs = self.outputs.len(),
            buffer_size = self.config.buffer_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "engine started"
        );
        Ok(())
    }

    /// Cancels every task, waits for all of them, then releases plugins.
    ///
    /// The ingestion worker performs the final flush of its buffer before it exits; this only
    /// asks outputs to push out whatever they buffer themselves.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state != EngineState::Running {
            bail!("engine cannot be stopped from state {:?}", self.state);
        }

        info!("stopping engine");
        self.cancel_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        for input in &self.inputs {
            exit_plugin(input.as_ref()).await;
        }
        for parser in &self.parsers {
            exit_plugin(parser.as_ref()).await;
        }
        for filter in &self.filters {
            exit_plugin(filter.as_ref()).await;
        }
        for output in &self.outputs {
            if let Err(err) = output.flush().await {
                OUTPUT_ERRORS_TOTAL
                    .with_label_values(&[output.name(), "flush"])
                    .inc();
                error!(output = output.name(), error = %format!("{err:#}"), "final output flush failed");
            }
            exit_plugin(output.as_ref()).await;
        }

        self.state = EngineState::Stopped;
        info!("engine stopped");
        Ok(())
    }
}

async fn exit_plugin<P: Plugin + ?Sized>(plugin: &P) {
    if let Err(err) = plugin.exit().await {
        warn!(plugin = plugin.name(), error = %format!("{err:#}"), "plugin exit failed");
    }
}

struct IngestWorker {
    parsers: Vec<Arc<dyn Parser>>,
    filters: Vec<Arc<dyn Filter>>,
    outputs: Vec<Arc<dyn Output>>,
    buffer: Vec<Event>,
    buffer_size: usize,
}

impl IngestWorker {
    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<Event>,
        flush_interval: Duration,
        cancel_token: CancellationToken,
    ) {
        let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                maybe_event = event_rx.recv() => match maybe_event {
                    Some(event) => self.ingest(event).await,
                    None => {
                        debug!("all inputs closed the pipeline channel");
                        break;
                    }
                },
                _ = ticker.tick() => self.flush().await,
            }
        }

        // Refuse new sends but keep whatever inputs already handed over.
        event_rx.close();
        while let Some(event) = event_rx.recv().await {
            self.ingest(event).await;
        }
        self.flush().await;
        debug!("ingestion worker stopped");
    }

    async fn ingest(&mut self, event: Event) {
        EVENTS_INGESTED_TOTAL.inc();
        if let Some(event) = self.process(event) {
            self.buffer.push(event);
            if self.buffer.len() >= self.buffer_size {
                self.flush().await;
            }
        }
    }

    fn process(&self, mut event: Event) -> Option<Event> {
        let mut parsed = false;
        for parser in &self.parsers {
            match panic::catch_unwind(AssertUnwindSafe(|| parser.process(&mut event))) {
                Ok(true) => {
                    parsed = true;
                    break;
                }
                Ok(false) => {}
                Err(_) => error!(parser = parser.name(), "parser panicked; trying the next one"),
            }
        }
        if !parsed && !self.parsers.is_empty() {
            PARSE_FAILURES_TOTAL.inc();
        }

        let tag = event.metadata.tag.clone();
        for filter in &self.filters {
            if !filter.match_tag(&tag) {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| filter.process(event))) {
                Ok(Ok(Some(next))) => event = next,
                Ok(Ok(None)) => {
                    EVENTS_DROPPED_TOTAL.with_label_values(&["filtered"]).inc();
                    return None;
                }
                Ok(Err(err)) => {
                    EVENTS_DROPPED_TOTAL.with_label_values(&["filter_error"]).inc();
                    warn!(filter = filter.name(), error = %format!("{err:#}"), "filter failed; dropping event");
                    return None;
                }
                Err(_) => {
                    EVENTS_DROPPED_TOTAL.with_label_values(&["filter_error"]).inc();
                    error!(filter = filter.name(), "filter panicked; dropping event");
                    return None;
                }
            }
        }

        Some(event)
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let timer = FLUSH_DURATION.start_timer();
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.buffer_size));

        for output in &self.outputs {
            match AssertUnwindSafe(output.write(&batch)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    OUTPUT_ERRORS_TOTAL
                        .with_label_values(&[output.name(), "write"])
                        .inc();
                    error!(
                        output = output.name(),
                        events = batch.len(),
                        error = %format!("{err:#}"),
                        "output write failed; batch dropped for this output"
                    );
                }
                Err(_) => {
                    OUTPUT_ERRORS_TOTAL
                        .with_label_values(&[output.name(), "write"])
                        .inc();
                    error!(output = output.name(), events = batch.len(), "output panicked during write");
                }
            }
        }

        timer.observe_duration();
        debug!(events = batch.len(), "flushed batch");
    }
}
