//! Logging configuration and initialization.
//!
//! Logs always go to stderr so stdout carries only responses. `RUST_LOG`
//! takes precedence over the presets.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Logging preset levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogPreset {
    /// Warnings plus startup info.
    #[default]
    Production,
    /// `-d/--debug`.
    Debug,
    /// `OPENCODE_DEV_DEBUG`: everything, including provider stream chatter.
    Trace,
}

impl LogPreset {
    /// Pick the preset from the debug flag and the environment lookup.
    pub fn from_flags<F>(debug: bool, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let dev_debug = env("OPENCODE_DEV_DEBUG")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        if dev_debug {
            LogPreset::Trace
        } else if debug {
            LogPreset::Debug
        } else {
            LogPreset::Production
        }
    }

    fn directives(self) -> Vec<&'static str> {
        match self {
            LogPreset::Production => vec![
                "warn",
                "opencode::startup=info",
                "opencode::flow=info",
                "opencode::lsp=warn",
            ],
            LogPreset::Debug => vec!["warn", "opencode=debug", "opencode::pubsub=info"],
            LogPreset::Trace => vec!["info", "opencode=trace"],
        }
    }

    /// Build an EnvFilter, preferring `RUST_LOG` when set.
    pub fn build_filter(self) -> EnvFilter {
        if let Ok(env_filter) = EnvFilter::try_from_default_env() {
            return env_filter;
        }
        EnvFilter::try_new(self.directives().join(",")).unwrap_or_else(|_| EnvFilter::new("warn"))
    }
}

/// Initialize the tracing subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init(preset: LogPreset) {
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(preset != LogPreset::Production)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    let _ = tracing_subscriber::registry()
        .with(preset.build_filter())
        .with(layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_priority() {
        assert_eq!(LogPreset::from_flags(false, |_| None), LogPreset::Production);
        assert_eq!(LogPreset::from_flags(true, |_| None), LogPreset::Debug);
        assert_eq!(
            LogPreset::from_flags(false, |k| (k == "OPENCODE_DEV_DEBUG").then(|| "true".into())),
            LogPreset::Trace
        );
        assert_eq!(
            LogPreset::from_flags(true, |k| (k == "OPENCODE_DEV_DEBUG").then(|| "0".into())),
            LogPreset::Debug
        );
    }

    #[test]
    fn test_preset_directives_parse() {
        for preset in [LogPreset::Production, LogPreset::Debug, LogPreset::Trace] {
            assert!(EnvFilter::try_new(preset.directives().join(",")).is_ok());
        }
    }
}
