//! tracing 层 - 把 tracing 事件转换为 LogEvent 送入回退日志

use shared::{ErrorClass, LogEvent, Severity};
use std::fmt::{self, Write as _};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::FallbackLogger;

/// Events from the logger's own modules are skipped to avoid feedback
const SELF_TARGET: &str = "orb_client::logger";

/// Forwards tracing events to a [`FallbackLogger`].
///
/// Never blocks the emitting thread: if the queue is full the event is
/// dropped and counted.
#[derive(Debug, Clone)]
pub struct FallbackLayer {
    logger: FallbackLogger,
    min_level: Level,
}

impl FallbackLayer {
    pub fn new(logger: FallbackLogger) -> Self {
        Self {
            logger,
            min_level: Level::INFO,
        }
    }

    /// Forward only events at `level` or more severe
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }
}

fn severity_of(level: &Level) -> Severity {
    match *level {
        Level::ERROR => Severity::Failed,
        Level::WARN => Severity::Warn,
        Level::INFO => Severity::Info,
        _ => Severity::Trace,
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for FallbackLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // Level 越详细值越大
        if *meta.level() > self.min_level || meta.target().starts_with(SELF_TARGET) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut log_event = LogEvent::new(severity_of(meta.level()), visitor.message + &visitor.fields)
            .with_process(self.logger.config().process_name.clone())
            .with_location(meta.file().unwrap_or(meta.target()), meta.line().unwrap_or(0));
        if *meta.level() == Level::ERROR {
            log_event = log_event.with_class(ErrorClass::Internal);
        }
        self.logger.try_log(log_event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ObjectRefCache;
    use crate::config::{LoggerConfig, ResolverConfig};
    use crate::memory::{InMemoryLogCollector, InMemoryNameServer, MemoryFactory};
    use crate::resolver::Resolver;
    use crate::rpc::LOG_COLLECTOR_INTERFACE;
    use shared::EndpointId;
    use std::sync::Arc;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_forwards_events_above_min_level() {
        let tmp = tempfile::TempDir::new().unwrap();
        let resolver = Arc::new(Resolver::new(
            ResolverConfig::default(),
            Arc::new(ObjectRefCache::new()),
            Arc::new(MemoryFactory::new(Arc::new(InMemoryNameServer::new()))),
        ));
        let collector = Arc::new(InMemoryLogCollector::new(EndpointId::new_instance(
            LOG_COLLECTOR_INTERFACE,
            "host",
            1,
        )));
        let logger = FallbackLogger::new(
            LoggerConfig::new("layer", tmp.path()),
            resolver,
            Arc::new(MemoryFactory::new(collector)),
        );

        let subscriber = tracing_subscriber::registry().with(logger.layer().with_min_level(Level::WARN));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(path = "/a/b", "bind failed");
            tracing::error!("broken");
            tracing::info!("too chatty");
            tracing::warn!(target: "orb_client::logger::worker", "own diagnostics");
        });

        assert_eq!(logger.queued(), 2);
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(severity_of(&Level::ERROR), Severity::Failed);
        assert_eq!(severity_of(&Level::WARN), Severity::Warn);
        assert_eq!(severity_of(&Level::DEBUG), Severity::Trace);
    }
}
