use console::Term;
use permaudit::CancelFlag;

/// Exit status for a forced quit, matching the shell's SIGINT convention.
pub(crate) const FORCE_QUIT_EXIT_CODE: i32 = 130;

/// Set up the Ctrl+C handler for graceful cancellation.
///
/// The first Ctrl+C raises `cancel`: no new requests are issued and the run
/// returns once in-flight requests finish. A second Ctrl+C exits immediately.
pub(crate) fn setup_shutdown_handler(cancel: CancelFlag) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }

        let is_tty = Term::stderr().is_term();
        if is_tty {
            eprintln!("\n\nCancelling, waiting for in-flight requests...");
            eprintln!("Press Ctrl+C again to force quit.");
        } else {
            tracing::warn!("Cancellation requested, waiting for in-flight requests");
        }

        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }

        if is_tty {
            eprintln!("Force quit!");
        }
        std::process::exit(FORCE_QUIT_EXIT_CODE);
    });
}
