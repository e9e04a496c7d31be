//! Tracing setup for the library and the CLI.
//!
//! One `tracing-subscriber` registry writing to stderr, filtered by `RUST_LOG`
//! when set and by the configured level otherwise. Three renderings:
//! `pretty` for interactive use, `compact` for captured output, `json` for log
//! collectors.
//!
//! # Example
//! ```no_run
//! use cellsim::{config::CellSimConfig, logging::{self, OutputFormat, TracingConfig}};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CellSimConfig::load()?;
//! let tracing_config = TracingConfig::from_config(&config)?.with_format(OutputFormat::Json);
//! logging::init(tracing_config)?;
//! tracing::info!(port = "/dev/ttyACM0", "connected");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::CellSimConfig;
use crate::error::{CellSimError, CellSimResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// How events are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured
    Pretty,
    /// One line per event, no colour
    Compact,
    /// One JSON object per event
    Json,
}

impl OutputFormat {
    /// Parse `pretty`, `compact` or `json` (any case).
    pub fn parse(format: &str) -> Result<Self, String> {
        match format.to_ascii_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "unknown log format '{}' (expected pretty, compact or json)",
                format
            )),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level used when `RUST_LOG` is not set
    pub level: Level,
    /// Rendering
    pub format: OutputFormat,
    /// Also log span open/close (shows per-command timing)
    pub span_events: bool,
    /// Colour in pretty output
    pub ansi: bool,
}

impl TracingConfig {
    /// Settings from the `[logging]` section.
    ///
    /// # Errors
    ///
    /// `CellSimError::Configuration` for an unknown level or format.
    pub fn from_config(config: &CellSimConfig) -> CellSimResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.logging.level).map_err(CellSimError::Configuration)?,
            format: OutputFormat::parse(&config.logging.format)
                .map_err(CellSimError::Configuration)?,
            span_events: false,
            ansi: true,
        })
    }

    /// Override the rendering.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Enable or disable colour.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }
}

/// Install the global subscriber.
///
/// Does nothing if a global subscriber is already installed (tests install
/// their own).
///
/// # Errors
///
/// `CellSimError::Configuration` if the subscriber cannot be installed.
pub fn init(config: TracingConfig) -> CellSimResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level).into())
        .from_env_lossy();

    let spans = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(spans);

    let layer: BoxedLayer = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .or_else(|e| {
            // Lost a race with another initialiser
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(CellSimError::Configuration(format!(
                    "cannot install tracing: {}",
                    e
                )))
            }
        })
}

/// Parse a level name (`trace` .. `error`, any case).
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    level.parse::<Level>().map_err(|_| {
        format!(
            "unknown log level '{}' (expected trace, debug, info, warn or error)",
            level
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("WARN"), Ok(Level::WARN));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(OutputFormat::parse("JSON"), Ok(OutputFormat::Json));
        assert_eq!(OutputFormat::parse("compact"), Ok(OutputFormat::Compact));
        assert!(OutputFormat::parse("xml").is_err());
    }

    #[test]
    fn test_overrides_apply_on_top_of_config() {
        let mut config = CellSimConfig::default();
        config.logging.level = "debug".into();

        let tracing_config = TracingConfig::from_config(&config)
            .unwrap()
            .with_format(OutputFormat::Compact)
            .with_span_events(true)
            .with_ansi(false);
        assert_eq!(tracing_config.level, Level::DEBUG);
        assert_eq!(tracing_config.format, OutputFormat::Compact);
        assert!(tracing_config.span_events);
        assert!(!tracing_config.ansi);

        config.logging.format = "xml".into();
        assert!(matches!(
            TracingConfig::from_config(&config),
            Err(CellSimError::Configuration(_))
        ));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let mut config = CellSimConfig::default();
        config.logging.level = "warn".into();
        let tracing_config = TracingConfig::from_config(&config).unwrap();

        assert!(init(tracing_config.clone()).is_ok());
        assert!(init(tracing_config).is_ok());
    }
}
