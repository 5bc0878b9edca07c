use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use hna_core::errors::Error;
use hna_core::lock::TimeoutLock;

/// Guards mutation of global kernel tables (iptables, ipset).
/// Namespace-scoped commands do not take this lock.
pub static TABLE_LOCK: TimeoutLock = TimeoutLock::new(Duration::from_secs(180), "tables");

/// Run a command to completion and capture combined stdout+stderr.
///
/// A non-zero exit is treated as success when the combined output
/// contains any substring in `tolerated` — the idempotence contract
/// for `iptables`/`ipset`/`ip` invocations that may already hold the
/// requested state.
pub fn exec<S: AsRef<str>>(tolerated: &[&str], argv: &[S]) -> Result<String> {
    let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();

    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::Parse("exec: Empty command".to_string()))?;

    #[cfg(any(test, feature = "mock"))]
    if let Some(response) = mock::intercept(&argv) {
        if response.exit_code == 0
            || tolerated.iter().any(|t| response.output.contains(t))
        {
            return Ok(response.output);
        }
        return Err(Error::Write(format!(
            "exec: Command failed ({}): {} - {}",
            response.exit_code,
            argv.join(" "),
            response.output.trim(),
        ))
        .into());
    }

    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run: {}", argv.join(" ")))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        return Ok(combined);
    }

    if tolerated.iter().any(|t| combined.contains(t)) {
        debug!(
            command = %argv.join(" "),
            output = %combined.trim(),
            "exec: Tolerated command failure",
        );
        return Ok(combined);
    }

    Err(Error::Write(format!(
        "exec: Command failed ({}): {} - {}",
        output.status.code().unwrap_or(-1),
        argv.join(" "),
        combined.trim(),
    ))
    .into())
}

/// Test mock: a thread-local handler intercepts every `exec` call,
/// recording the argv vector and returning a canned response.
#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use std::cell::RefCell;
    use std::sync::{Arc, Mutex};

    /// Canned outcome for one intercepted command.
    pub struct MockResponse {
        pub exit_code: i32,
        pub output: String,
    }

    impl MockResponse {
        pub fn ok(output: &str) -> Self {
            Self {
                exit_code: 0,
                output: output.to_string(),
            }
        }

        pub fn empty() -> Self {
            Self::ok("")
        }

        pub fn fail(exit_code: i32, output: &str) -> Self {
            Self {
                exit_code,
                output: output.to_string(),
            }
        }
    }

    type Handler = Box<dyn Fn(&[String]) -> MockResponse>;

    thread_local! {
        static HANDLER: RefCell<Option<Handler>> = const { RefCell::new(None) };
    }

    /// Guard that clears the mock handler on drop.
    pub struct MockGuard;

    impl Drop for MockGuard {
        fn drop(&mut self) {
            HANDLER.with(|h| *h.borrow_mut() = None);
        }
    }

    /// Commands recorded by [`record`], in issue order.
    pub type CommandLog = Arc<Mutex<Vec<Vec<String>>>>;

    /// Install a handler for the current thread.
    pub fn install<F>(handler: F) -> MockGuard
    where
        F: Fn(&[String]) -> MockResponse + 'static,
    {
        HANDLER.with(|h| *h.borrow_mut() = Some(Box::new(handler)));
        MockGuard
    }

    /// Install a recording handler that succeeds silently on every
    /// command and captures the argv vectors.
    pub fn record() -> (MockGuard, CommandLog) {
        let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
        let log_ref = log.clone();
        let guard = install(move |argv| {
            log_ref.lock().unwrap().push(argv.to_vec());
            MockResponse::empty()
        });
        (guard, log)
    }

    pub(crate) fn intercept(argv: &[String]) -> Option<MockResponse> {
        HANDLER.with(|h| h.borrow().as_ref().map(|f| f(argv)))
    }
}
