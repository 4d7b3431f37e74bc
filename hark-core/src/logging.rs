//! Process-wide log sink.
//!
//! The engine logs through `tracing`. By default (`Ambient`) events go to
//! whatever subscriber the host installed. A caller can instead route every
//! engine event to a plain callback, or silence the engine entirely:
//!
//! ```no_run
//! use std::sync::Arc;
//! use hark_core::logging::{set_log_sink, LogLevel};
//!
//! set_log_sink(Some(Arc::new(|level: LogLevel, msg: &str| {
//!     eprintln!("[{level:?}] {msg}");
//! })));
//! ```
//!
//! The slot is global. Set it before starting concurrent runs; runs already
//! in flight keep the mode they started with.
//!
//! Caller callbacks (progress, abort, new segment) run under the host's own
//! dispatcher, so their events never reach the engine sink.

use std::cell::RefCell;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::field::{Field, Visit};
use tracing::subscriber::NoSubscriber;
use tracing::{dispatcher, Dispatch, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Severity passed to a custom sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// `TRACE` events are not forwarded.
    fn from_tracing(level: &Level) -> Option<Self> {
        match *level {
            Level::ERROR => Some(LogLevel::Error),
            Level::WARN => Some(LogLevel::Warn),
            Level::INFO => Some(LogLevel::Info),
            Level::DEBUG => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

#[derive(Clone)]
enum SinkMode {
    Ambient,
    Custom(LogCallback),
    Disabled,
}

static SINK: RwLock<SinkMode> = parking_lot::const_rwlock(SinkMode::Ambient);

/// Route engine logs to `callback`, or discard them with `None`.
pub fn set_log_sink(callback: Option<LogCallback>) {
    *SINK.write() = match callback {
        Some(cb) => SinkMode::Custom(cb),
        None => SinkMode::Disabled,
    };
}

/// Go back to the host's `tracing` subscriber.
pub fn reset_log_sink() {
    *SINK.write() = SinkMode::Ambient;
}

thread_local! {
    /// Dispatcher that was current when the outermost `scoped` call began.
    static HOST: RefCell<Option<Dispatch>> = const { RefCell::new(None) };
}

struct HostGuard;

impl Drop for HostGuard {
    fn drop(&mut self) {
        let _ = HOST.try_with(|h| h.borrow_mut().take());
    }
}

/// Run `f` with the dispatcher chosen by the current sink mode.
///
/// Nested calls reuse the dispatcher of the outermost one.
pub fn scoped<T>(f: impl FnOnce() -> T) -> T {
    if HOST.with(|h| h.borrow().is_some()) {
        return f();
    }
    let mode = SINK.read().clone();
    let engine = match mode {
        SinkMode::Ambient => return f(),
        SinkMode::Disabled => Dispatch::new(NoSubscriber::default()),
        SinkMode::Custom(callback) => {
            Dispatch::new(Registry::default().with(SinkLayer { callback }))
        }
    };
    let host = dispatcher::get_default(Dispatch::clone);
    HOST.with(|h| *h.borrow_mut() = Some(host));
    let _guard = HostGuard;
    dispatcher::with_default(&engine, f)
}

/// Run caller-supplied code under the dispatcher that was current before
/// the engine took over.
pub(crate) fn host<T>(f: impl FnOnce() -> T) -> T {
    match HOST.with(|h| h.borrow().clone()) {
        Some(outer) => dispatcher::with_default(&outer, f),
        None => f(),
    }
}

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default
/// `hark_core=info`). Does nothing if a global subscriber already exists.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hark_core=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Forwards each event as one line: the message, then `key=value` fields.
pub struct SinkLayer {
    callback: LogCallback,
}

impl SinkLayer {
    pub fn new(callback: LogCallback) -> Self {
        Self { callback }
    }
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(level) = LogLevel::from_tracing(event.metadata().level()) else {
            return;
        };
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        (self.callback)(level, &visitor.finish());
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tracing::{debug, info, trace, warn};

    /// The sink is process-wide; tests that switch it take this lock.
    static SERIAL: Mutex<()> = parking_lot::const_mutex(());

    type Captured = Arc<Mutex<Vec<(LogLevel, String)>>>;

    fn capture() -> (Captured, LogCallback) {
        let lines: Captured = Arc::default();
        let sink = Arc::clone(&lines);
        let cb: LogCallback = Arc::new(move |level, msg: &str| {
            sink.lock().push((level, msg.to_string()));
        });
        (lines, cb)
    }

    #[test]
    fn custom_sink_receives_engine_events() {
        let _guard = SERIAL.lock();
        let (lines, cb) = capture();
        set_log_sink(Some(cb));
        scoped(|| {
            info!(frames = 3, "sink check alpha");
            warn!("sink check beta");
            trace!("sink check gamma");
        });
        reset_log_sink();

        let lines = lines.lock();
        assert!(lines.contains(&(LogLevel::Info, "sink check alpha frames=3".to_string())));
        assert!(lines.contains(&(LogLevel::Warn, "sink check beta".to_string())));
        assert!(!lines.iter().any(|(_, m)| m.contains("gamma")));
    }

    #[test]
    fn disabled_sink_swallows_everything() {
        let _guard = SERIAL.lock();
        let (outer, cb) = capture();
        let host = Registry::default().with(SinkLayer::new(cb));
        tracing::subscriber::with_default(host, || {
            set_log_sink(None);
            scoped(|| debug!("should vanish"));
            reset_log_sink();
            scoped(|| debug!("should arrive"));
        });
        let outer = outer.lock();
        assert_eq!(outer.len(), 1);
        assert_eq!(outer[0], (LogLevel::Debug, "should arrive".to_string()));
    }

    #[test]
    fn caller_code_logs_to_the_host_subscriber() {
        let _guard = SERIAL.lock();
        let (engine_lines, cb) = capture();
        let (host_lines, host_cb) = capture();
        let host_subscriber = Registry::default().with(SinkLayer::new(host_cb));
        tracing::subscriber::with_default(host_subscriber, || {
            set_log_sink(Some(cb));
            scoped(|| {
                info!("host split engine one");
                host(|| info!("host split caller"));
                scoped(|| info!("host split engine two"));
            });
            reset_log_sink();
        });

        let engine_lines: Vec<String> = engine_lines
            .lock()
            .iter()
            .map(|(_, m)| m.clone())
            .filter(|m| m.starts_with("host split"))
            .collect();
        let host_lines: Vec<String> = host_lines.lock().iter().map(|(_, m)| m.clone()).collect();
        assert_eq!(
            engine_lines,
            vec!["host split engine one".to_string(), "host split engine two".to_string()]
        );
        assert_eq!(host_lines, vec!["host split caller".to_string()]);
    }

    #[test]
    fn scoped_returns_the_closure_value() {
        assert_eq!(scoped(|| 41 + 1), 42);
    }

    #[test]
    fn levels_map_from_tracing() {
        assert_eq!(LogLevel::from_tracing(&Level::ERROR), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_tracing(&Level::DEBUG), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_tracing(&Level::TRACE), None);
    }
}
