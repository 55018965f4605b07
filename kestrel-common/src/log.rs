//! Hierarchical engine log names and severities.
//!
//! Every storage engine carries a [`LogName`]: the dotted path of the
//! engine within the assembled stack (for example `STORE.BACK.BODY.INFO`).
//! The path is built while the stack is assembled: a parent hands each child
//! a [`LogName::child`] of its own name. The backend is whatever tracing
//! subscriber the host installs; see [`crate::logging::init`] for the
//! broker's default.

use std::fmt;

/// A dotted, hierarchical engine name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogName {
    segments: Vec<String>,
}

impl LogName {
    /// Start a new name hierarchy.
    #[must_use]
    pub fn root(segment: impl Into<String>) -> Self {
        Self {
            segments: vec![segment.into()],
        }
    }

    /// Derive a child name one level below this one.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// The path segments, outermost first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Parse a dotted path like `STORE.BACK.BODY`. Returns `None` when the
    /// path has no segments.
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        let segments: Vec<String> = path
            .split('.')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(String::from)
            .collect();
        if segments.is_empty() {
            None
        } else {
            Some(Self { segments })
        }
    }

    /// Whether this name equals `ancestor` or lies beneath it in the
    /// hierarchy.
    #[must_use]
    pub fn is_within(&self, ancestor: &Self) -> bool {
        self.segments.len() >= ancestor.segments.len()
            && self.segments[..ancestor.segments.len()] == ancestor.segments[..]
    }
}

impl fmt::Display for LogName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// Log severities recognised by the storage subsystem.
///
/// The two highest levels have no direct tracing counterpart; they are
/// emitted as `ERROR` events carrying a `severity` field so an operator can
/// route them separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Alert,
    Emergency,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Alert => "alert",
            Self::Emergency => "emergency",
        }
    }

    /// Emit `message` at this severity, attributed to `name`.
    pub fn emit(self, name: &LogName, message: &str) {
        match self {
            Self::Debug => tracing::debug!(target: "kestrel", engine = %name, "{message}"),
            Self::Info => tracing::info!(target: "kestrel", engine = %name, "{message}"),
            Self::Warning => tracing::warn!(target: "kestrel", engine = %name, "{message}"),
            Self::Error => tracing::error!(target: "kestrel", engine = %name, "{message}"),
            Self::Alert | Self::Emergency => {
                tracing::error!(
                    target: "kestrel",
                    engine = %name,
                    severity = self.as_str(),
                    "{message}"
                );
            }
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a severity name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSeverity(String);

impl fmt::Display for UnknownSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown severity {:?}", self.0)
    }
}

impl std::error::Error for UnknownSeverity {}

impl std::str::FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "alert" => Ok(Self::Alert),
            "emergency" => Ok(Self::Emergency),
            _ => Err(UnknownSeverity(name.to_string())),
        }
    }
}

/// Shorthand for [`Severity::Alert`] emission.
pub fn alert(name: &LogName, message: &str) {
    Severity::Alert.emit(name, message);
}

/// Shorthand for [`Severity::Emergency`] emission.
pub fn emergency(name: &LogName, message: &str) {
    Severity::Emergency.emit(name, message);
}
