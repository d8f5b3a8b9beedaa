//! Terminal notification surfaces

use lectern_http::{Navigator, Notice, Notifier, Severity};

/// Prints notices to stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notice: Notice) {
        let label = match notice.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        eprintln!("[{label}] {}", notice.message);
    }
}

/// There is no login screen to go back to; tell the user how to sign in
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn redirect_to_login(&self) {
        eprintln!("Run `lectern login` to sign in again.");
    }
}
