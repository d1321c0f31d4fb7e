//! services/api/src/adapters/notifier.rs

use session_reliability_core::ports::{NotificationLevel, Notifier};
use tracing::{error, info, warn};

/// Forwards user-facing notifications to the log, tagged for the client log shipper.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NotificationLevel, message: &str) {
        match level {
            NotificationLevel::Success => info!(target: "notification", kind = "success", "{message}"),
            NotificationLevel::Info => info!(target: "notification", kind = "info", "{message}"),
            NotificationLevel::Warning => warn!(target: "notification", kind = "warning", "{message}"),
            NotificationLevel::Error => error!(target: "notification", kind = "error", "{message}"),
        }
    }
}
