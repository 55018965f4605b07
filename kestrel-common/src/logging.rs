//! Logging bootstrap for the broker.
//!
//! Engines attribute every event to their [`LogName`] path, and the
//! subscriber installed here filters on that hierarchy: `KESTREL_LOG`
//! takes either a severity floor (`debug`, `info`, `warning`, `error`,
//! `alert`, `emergency`) or a scoped form like `STORE.BACK=debug`, which
//! keeps only events from engines at or below that path. The backend
//! itself stays external; a host that wants different rendering installs
//! its own subscriber and skips [`init`].

use std::str::FromStr;

use tracing::{
    Event, Metadata,
    field::{Field, Visit},
    metadata::LevelFilter,
};
use tracing_subscriber::{
    Layer,
    layer::{Context, Filter, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::log::{LogName, Severity, UnknownSeverity};

/// Environment variable read by [`EngineFilter::from_env`].
pub const LOG_ENV: &str = "KESTREL_LOG";

/// Event filter over the engine-name hierarchy.
///
/// Two knobs: a severity floor, and an optional scope restricting output to
/// one engine subtree. Events that carry no `engine` attribution (startup,
/// assembly) always pass the scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFilter {
    floor: Severity,
    scope: Option<LogName>,
}

impl EngineFilter {
    /// Filter everything at or above `floor`, from every engine.
    #[must_use]
    pub const fn at(floor: Severity) -> Self {
        Self { floor, scope: None }
    }

    /// Restrict output to `scope` and the engines beneath it.
    #[must_use]
    pub fn scoped(floor: Severity, scope: LogName) -> Self {
        Self {
            floor,
            scope: Some(scope),
        }
    }

    /// Filter from the `KESTREL_LOG` environment variable; unset or
    /// unparsable falls back to the build default.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(LOG_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }

    /// Whether events attributed to `engine` pass this filter's scope.
    #[must_use]
    pub fn covers(&self, engine: &LogName) -> bool {
        self.scope
            .as_ref()
            .map_or(true, |scope| engine.is_within(scope))
    }

    /// Severity floors above `error` cannot be told apart at the metadata
    /// gate (alert and emergency travel as `ERROR` events carrying a
    /// `severity` field), so they are enforced here, per event.
    fn passes_floor(&self, explicit: Option<Severity>) -> bool {
        if self.floor <= Severity::Error {
            return true;
        }
        explicit.is_some_and(|severity| severity >= self.floor)
    }

    const fn level_floor(&self) -> LevelFilter {
        match self.floor {
            Severity::Debug => LevelFilter::DEBUG,
            Severity::Info => LevelFilter::INFO,
            Severity::Warning => LevelFilter::WARN,
            Severity::Error | Severity::Alert | Severity::Emergency => LevelFilter::ERROR,
        }
    }
}

impl Default for EngineFilter {
    fn default() -> Self {
        Self::at(if cfg!(debug_assertions) {
            Severity::Debug
        } else {
            Severity::Info
        })
    }
}

impl FromStr for EngineFilter {
    type Err = UnknownSeverity;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once('=') {
            Some((path, severity)) => Ok(Self {
                floor: severity.parse()?,
                scope: LogName::from_path(path),
            }),
            None => Ok(Self::at(raw.parse()?)),
        }
    }
}

/// Pulls the `engine` and `severity` attributions out of an event.
#[derive(Default)]
struct EventFields {
    engine: Option<String>,
    severity: Option<String>,
}

impl EventFields {
    fn capture(&mut self, field: &Field, value: String) {
        match field.name() {
            "engine" => self.engine = Some(value),
            "severity" => self.severity = Some(value),
            _ => {}
        }
    }
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.capture(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.capture(field, value.to_string());
    }
}

impl<S> Filter<S> for EngineFilter {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        meta.target().starts_with("kestrel") && *meta.level() <= self.level_floor()
    }

    fn event_enabled(&self, event: &Event<'_>, _cx: &Context<'_, S>) -> bool {
        if self.scope.is_none() && self.floor <= Severity::Error {
            return true;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        let in_scope = fields
            .engine
            .as_deref()
            .and_then(LogName::from_path)
            .map_or(true, |engine| self.covers(&engine));
        in_scope
            && self.passes_floor(
                fields
                    .severity
                    .as_deref()
                    .and_then(|raw| raw.parse().ok()),
            )
    }

    fn max_level_hint(&self) -> Option<LevelFilter> {
        Some(self.level_floor())
    }
}

/// Install the broker's default subscriber, filtered per `KESTREL_LOG`.
///
/// # Panics
/// Panics if a global subscriber is already installed.
pub fn init() {
    init_with(EngineFilter::from_env());
}

/// Install the broker's subscriber with an explicit filter.
///
/// # Panics
/// Panics if a global subscriber is already installed.
pub fn init_with(filter: EngineFilter) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_filter(filter),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_severity_floor() {
        let filter: EngineFilter = "warning".parse().expect("valid floor");
        assert_eq!(filter, EngineFilter::at(Severity::Warning));
    }

    #[test]
    fn test_parse_scoped_filter() {
        let filter: EngineFilter = "STORE.BACK=debug".parse().expect("valid scope");
        assert_eq!(
            filter,
            EngineFilter::scoped(Severity::Debug, LogName::root("STORE").child("BACK"))
        );
    }

    #[test]
    fn test_unknown_severity_is_rejected() {
        assert!("loud".parse::<EngineFilter>().is_err());
        assert!("STORE=loud".parse::<EngineFilter>().is_err());
    }

    #[test]
    fn test_scope_covers_the_subtree_only() {
        let filter: EngineFilter = "STORE.BACK=debug".parse().expect("valid scope");
        let back = LogName::root("STORE").child("BACK");

        assert!(filter.covers(&back));
        assert!(filter.covers(&back.child("BODY").child("INFO")));
        assert!(!filter.covers(&LogName::root("STORE")));
        assert!(!filter.covers(&LogName::root("STORE").child("FRONT")));
    }

    #[test]
    fn test_unscoped_filter_covers_everything() {
        let filter = EngineFilter::at(Severity::Info);
        assert!(filter.covers(&LogName::root("ANYTHING")));
    }

    #[test]
    fn test_floors_above_error_need_the_severity_field() {
        let filter = EngineFilter::at(Severity::Alert);

        // A plain error event carries no severity field and is dropped
        assert!(!filter.passes_floor(None));
        assert!(filter.passes_floor(Some(Severity::Alert)));
        assert!(filter.passes_floor(Some(Severity::Emergency)));

        let emergency_only = EngineFilter::at(Severity::Emergency);
        assert!(!emergency_only.passes_floor(Some(Severity::Alert)));

        // At or below error the metadata gate has already decided
        assert!(EngineFilter::at(Severity::Error).passes_floor(None));
    }
}
