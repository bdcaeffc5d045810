use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to `default_directive`.
/// Returns `false` when another global subscriber was installed first.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();
    if installed {
        debug!("tracing initialised (fallback '{default_directive}')");
    }
    installed
}

/// Logs the outcome of an optimization the way every entry point reports it.
pub(crate) fn report_fit(context: &str, minimum: f64, converged: bool, status: &str) {
    if converged {
        debug!("{context}: F = {minimum:.6} ({status})");
    } else {
        warn!("{context}: not converged ({status}), F = {minimum:.6}");
    }
}
