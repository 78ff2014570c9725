//! Error taxonomy and stable process exit codes.
//!
//! Components propagate `anyhow::Error` everywhere; this module adds the
//! typed [`EngineError`] the driver downcasts against so a failure maps to
//! a stable exit code instead of always falling back to "generic failure".
//! [`MapError`], the currency every async map returns, carries the same
//! category so it survives being folded into an `anyhow::Error` at a map
//! boundary instead of being flattened to a bare message.

use std::fmt;

/// The five error categories of the taxonomy, independent of how a
/// particular failure happened to be represented (`EngineError` or
/// `MapError`) by the time it reaches the driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Resolution,
    Io,
    Integrity,
    Concurrency,
}

impl ErrorCategory {
    pub fn exit_code(self) -> ExitCode {
        match self {
            ErrorCategory::Config => ExitCode::ConfigError,
            ErrorCategory::Resolution => ExitCode::ConfigError,
            ErrorCategory::Io => ExitCode::FetchError,
            ErrorCategory::Integrity => ExitCode::FetchError,
            ErrorCategory::Concurrency => ExitCode::GenericFailure,
        }
    }

    /// Lower rank wins when several categories are observed for one
    /// aggregate failure (e.g. `setup::materialize_all` collecting one
    /// error per failed repository): the earlier a category appears in
    /// spec's own taxonomy listing, the more fundamental the problem it
    /// names, so it is reported over a category appearing later.
    fn rank(self) -> u8 {
        match self {
            ErrorCategory::Config => 0,
            ErrorCategory::Resolution => 1,
            ErrorCategory::Io => 2,
            ErrorCategory::Integrity => 3,
            ErrorCategory::Concurrency => 4,
        }
    }

    /// The most severe category among `categories`, by `rank`. Panics if
    /// `categories` is empty; callers only call this over a known-nonempty
    /// collection of observed failures.
    pub fn most_severe(categories: impl IntoIterator<Item = ErrorCategory>) -> ErrorCategory {
        categories
            .into_iter()
            .min_by_key(|c| c.rank())
            .expect("most_severe called with no categories")
    }
}

/// The five error categories.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("resolution error: {0}")]
    Resolution(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("internal error: {0}")]
    Concurrency(String),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Config(_) => ErrorCategory::Config,
            EngineError::Resolution(_) => ErrorCategory::Resolution,
            EngineError::Io(_) => ErrorCategory::Io,
            EngineError::Integrity(_) => ErrorCategory::Integrity,
            EngineError::Concurrency(_) => ErrorCategory::Concurrency,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        self.category().exit_code()
    }
}

/// A map-continuation error: a message, whether the failure is fatal, and
/// the category it belongs to.
///
/// Non-fatal failures are the compute function's own business to retry or
/// downgrade to a warning; see `src/asyncmap.rs` for how this interacts
/// with the `OnceCell`-backed cache. `category` defaults to `Io` for the
/// many call sites that are plain filesystem/network/subprocess failures;
/// call sites that originate from a categorized `EngineError` (the
/// resolver, configuration parsing) carry that category through instead,
/// either via `with_category` or by converting an `anyhow::Error` whose
/// chain already contains one.
#[derive(Debug, Clone)]
pub struct MapError {
    pub message: String,
    pub fatal: bool,
    pub category: ErrorCategory,
}

impl MapError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
            category: ErrorCategory::Io,
        }
    }

    pub fn non_fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
            category: ErrorCategory::Io,
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for MapError {}

impl From<anyhow::Error> for MapError {
    /// Flattens `e` to a message, but first walks its context chain for an
    /// `EngineError` so the category a lower layer (e.g. the resolver's
    /// cycle/not-found errors) already assigned survives instead of being
    /// lost to a generic default.
    fn from(e: anyhow::Error) -> Self {
        let category = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<EngineError>())
            .map(EngineError::category)
            .unwrap_or(ErrorCategory::Io);

        Self {
            message: format!("{:#}", e),
            fatal: true,
            category,
        }
    }
}

/// Stable exit codes, each code stable across versions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    ArgParseError = 1,
    ConfigError = 2,
    FetchError = 3,
    GenericFailure = 4,
    UnknownSubcommand = 5,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Given a failure observed by the driver, determine the exit code to use.
/// Downcasts to [`EngineError`] or [`MapError`] when possible (whichever is
/// found first walking the chain), otherwise falls back to `GenericFailure`
/// for any otherwise-unclassified `anyhow::Error`.
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    for cause in err.chain() {
        if let Some(engine_err) = cause.downcast_ref::<EngineError>() {
            return engine_err.exit_code();
        }
        if let Some(map_err) = cause.downcast_ref::<MapError>() {
            return map_err.category.exit_code();
        }
    }
    ExitCode::GenericFailure
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_maps_to_config_exit_code() {
        let err = anyhow::Error::new(EngineError::Config("bad field".into()));
        assert_eq!(exit_code_for(&err), ExitCode::ConfigError);
    }

    #[test]
    fn wrapped_integrity_error_is_found_through_context_chain() {
        let err = anyhow::Error::new(EngineError::Integrity("hash mismatch".into()))
            .context("while fetching archive");
        assert_eq!(exit_code_for(&err), ExitCode::FetchError);
    }

    #[test]
    fn unclassified_error_is_generic_failure() {
        let err = anyhow::anyhow!("something went wrong");
        assert_eq!(exit_code_for(&err), ExitCode::GenericFailure);
    }

    #[test]
    fn map_error_category_is_found_through_context_chain() {
        let err: anyhow::Error = MapError::fatal("bad thing").with_category(ErrorCategory::Integrity).into();
        let err = err.context("while materializing repository 'a'");
        assert_eq!(exit_code_for(&err), ExitCode::FetchError);
    }

    #[test]
    fn anyhow_error_from_engine_error_preserves_category_as_map_error() {
        let anyhow_err: anyhow::Error = EngineError::Config("cycle".into()).into();
        let map_err = MapError::from(anyhow_err);
        assert_eq!(map_err.category, ErrorCategory::Config);
        assert!(map_err.fatal);
    }

    #[test]
    fn most_severe_prefers_config_over_io() {
        let worst = ErrorCategory::most_severe([ErrorCategory::Io, ErrorCategory::Config, ErrorCategory::Integrity]);
        assert_eq!(worst, ErrorCategory::Config);
    }
}
