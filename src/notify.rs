use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// User-facing notification sink. Fire-and-forget: the core never waits on
/// or reads back anything it reports here.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, message: &str, severity: Severity);
}

/// Notifier that writes to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => info!(target: "tandem::notify", "{}", message),
            Severity::Warning => warn!(target: "tandem::notify", "{}", message),
            Severity::Error => error!(target: "tandem::notify", "{}", message),
        }
    }
}
