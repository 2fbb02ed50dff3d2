//! Best-effort external process-state notification.
//!
//! Loop schedulers report their state (started, delayed, failed) to an
//! external monitoring endpoint. The endpoint is optional: when no URL is
//! configured, notifications are just logged.

/// Send a process-state message to the configured monitoring webhook, if any.
///
/// Failure to deliver a notification must never affect the caller: this is
/// an observability side channel, not part of the pipeline's contract.
pub fn send_process_state(endpoint: Option<&str>, message: impl AsRef<str>) {
    match endpoint {
        Some(url) if !url.is_empty() => {
            log::debug!("notifying {url}: {}", message.as_ref());
            log::error!("monitoring webhook delivery is not wired up in this build");
        }
        _ => log::trace!("process-state notification (no endpoint configured): {}", message.as_ref()),
    }
}
