//! Pluggable sink for errors worth surfacing beyond the HTTP response body:
//! GC-lock timeouts, validator rejections, migration-routing failures. The
//! default implementation logs via `tracing`; a real deployment can
//! substitute a sink like Sentry without touching call sites.

/// Reports an error worth tracking outside the request/response cycle.
/// `context` names the call site (e.g. `"gc_lock"`, `"validator"`,
/// `"migration"`) so a downstream sink can group or alert on it.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, context: &str, error: &(dyn std::error::Error + 'static));
}

/// Default [`ErrorReporter`] that logs via `tracing::error!`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, context: &str, error: &(dyn std::error::Error + 'static)) {
        tracing::error!(context, error = %error, "reportable error");
    }
}
