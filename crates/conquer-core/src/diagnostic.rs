//! Boxed, human-readable fatal diagnostics.
//!
//! CI log scrapers key off this layout, so the rendering is byte-exact:
//!
//! ```text
//!
//!
//!     ================================================================================
//!
//!     [ERROR] [CONQUER] COULD NOT CONNECT:
//!
//!     Unable to connect to server, giving up.
//!     Please try again and contact support if the error persists.
//!
//!     [Client-Name = rust-official]
//!     [Timestamp = 2000-01-01T00:00:00]
//!
//!     ================================================================================
//!
//!
//! ```

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};

use crate::error::ServerError;

const RULE_WIDTH: usize = 80;
const INDENT: &str = "    ";

/// A fatal error about to be shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub title: String,
    pub body: String,
    /// Key/value lines in display order. `Timestamp` is added at render time.
    pub meta: Vec<(String, String)>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            meta: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.meta.push((key.into(), value.to_string()));
        self
    }

    /// Value of a metadata key, if present.
    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Render with the current UTC time as timestamp.
    #[must_use]
    pub fn render(&self) -> String {
        self.render_at(Utc::now())
    }

    /// Render with an explicit timestamp.
    #[must_use]
    pub fn render_at(&self, now: DateTime<Utc>) -> String {
        let mut meta = self.meta.clone();
        let timestamp = iso_timestamp(now);
        match meta.iter_mut().find(|(k, _)| k == "Timestamp") {
            Some(entry) => entry.1 = timestamp,
            None => meta.push(("Timestamp".to_string(), timestamp)),
        }
        let meta_lines = meta
            .iter()
            .map(|(key, value)| format!("[{key} = {value}]"))
            .collect::<Vec<_>>()
            .join("\n");

        let rule = "=".repeat(RULE_WIDTH);
        let text = format!(
            "\n\n{rule}\n\n[ERROR] [CONQUER] {}\n\n{}\n\n{meta_lines}\n\n{rule}\n\n",
            self.title, self.body
        );
        indent(&text)
    }
}

impl From<&ServerError> for Diagnostic {
    fn from(err: &ServerError) -> Self {
        Self {
            title: err.title.clone(),
            body: err.body.clone(),
            meta: err.meta.clone(),
        }
    }
}

/// Prefix every line that is not blank, keeping line endings.
fn indent(text: &str) -> String {
    text.split_inclusive('\n')
        .map(|line| {
            if line.trim().is_empty() {
                line.to_string()
            } else {
                format!("{INDENT}{line}")
            }
        })
        .collect()
}

/// `YYYY-MM-DDTHH:MM:SS[.ffffff]`, microseconds only when non-zero, no zone suffix.
#[must_use]
pub fn iso_timestamp(now: DateTime<Utc>) -> String {
    let naive = now.naive_utc();
    let micros = naive.nanosecond() / 1_000;
    if micros == 0 {
        naive.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        format!("{}.{micros:06}", naive.format("%Y-%m-%dT%H:%M:%S"))
    }
}

/// What happens after a fatal diagnostic has been produced.
pub trait FatalHandler: Send + Sync {
    fn abort(&self, diagnostic: &Diagnostic);
}

/// Logs the boxed diagnostic and exits the process with status 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitProcess;

impl FatalHandler for ExitProcess {
    fn abort(&self, diagnostic: &Diagnostic) {
        tracing::error!("{}", diagnostic.render());
        std::process::exit(1);
    }
}

/// Default handler used by the client and scheduler.
#[must_use]
pub fn exit_process() -> Arc<dyn FatalHandler> {
    Arc::new(ExitProcess)
}
