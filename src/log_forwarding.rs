// tracing layer that forwards WARN and ERROR events to the collector as LogEvents.
//
// Events with `suppress_forwarding = true` come from the transport's own failure path;
// they are forwarded with `LogScope::Transport`, which `Collector::log` refuses to send.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::collector::Collector;
use crate::models::{LogEvent, LogLevel};
use crate::transport::Channel;

pub const SUPPRESS_FIELD: &str = "suppress_forwarding";

const QUEUE_CAPACITY: usize = 1024;

/// Where a log event originated, as far as forwarding is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogScope {
    Application,
    /// Logged while reporting a transport failure; sending it would loop.
    Transport,
}

pub struct LogForwardingLayer {
    tx: mpsc::Sender<(LogEvent, LogScope)>,
}

impl LogForwardingLayer {
    /// Returns the layer and the receiving end for `spawn_forwarder`.
    pub fn new() -> (Self, mpsc::Receiver<(LogEvent, LogScope)>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx }, rx)
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: Vec<(String, String)>,
    suppress: bool,
}

impl Visit for EventVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == SUPPRESS_FIELD {
            self.suppress = value;
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut rendered = String::new();
        let _ = write!(rendered, "{:?}", value);
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.push((field.name().to_string(), rendered));
        }
    }
}

impl<S: Subscriber> Layer<S> for LogForwardingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Level orders by verbosity: ERROR < WARN < INFO
        if *metadata.level() > Level::WARN {
            return;
        }
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        let scope = if visitor.suppress {
            LogScope::Transport
        } else {
            LogScope::Application
        };
        let log_event = LogEvent {
            timestamp: crate::db::now_millis(),
            level: LogLevel::from(*metadata.level()),
            logger_name: metadata.target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        };
        // full queue means the collector is not keeping up; drop rather than block the caller
        let _ = self.tx.try_send((log_event, scope));
    }
}

/// Drains forwarded events into `collector` until the layer is dropped.
pub fn spawn_forwarder<C: Channel>(
    collector: Arc<Collector<C>>,
    mut rx: mpsc::Receiver<(LogEvent, LogScope)>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((event, scope)) = rx.recv().await {
            collector.log(event, scope);
        }
    })
}
