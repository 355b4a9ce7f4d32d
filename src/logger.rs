//! Tracing subscriber setup for the node binary and tests

use std::str::FromStr;
use std::sync::OnceLock;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt, fmt::time::ChronoLocal, layer::SubscriberExt, registry::LookupSpan,
    util::SubscriberInitExt, EnvFilter, Layer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    /// Compact plus file/line and a host/memory banner.
    Detailed,
    /// Requires the `json` feature; falls back to compact without it.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "detailed" => Ok(LogFormat::Detailed),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

impl LogFormat {
    /// Format actually installed once cargo features are taken into account.
    pub fn effective(self) -> LogFormat {
        if self == LogFormat::Json && !cfg!(feature = "json") {
            LogFormat::Compact
        } else {
            self
        }
    }
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Resident memory of this process, e.g. `"12.3M"`.
pub fn get_memory_usage() -> String {
    use sysinfo::{Pid, System};

    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_process(pid);
    system
        .process(pid)
        .map(|process| format!("{:.1}M", process.memory() as f64 / (1024.0 * 1024.0)))
        .unwrap_or_else(|| "N/A".to_string())
}

pub fn get_hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    })
}

fn text_layer<S>(detailed: bool) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_timer(ChronoLocal::rfc_3339())
        .with_target(false)
        .with_file(detailed)
        .with_line_number(detailed)
        .compact()
}

#[cfg(feature = "json")]
fn json_layer<S>() -> Option<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    Some(
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true),
    )
}

#[cfg(not(feature = "json"))]
fn json_layer() -> Option<tracing_subscriber::layer::Identity> {
    None
}

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default.
///
/// Exactly one of the text or JSON layers is active; the other slot is
/// `None`.
pub fn init_logger(requested: LogFormat) {
    let format = requested.effective();
    let text = match format {
        LogFormat::Json => None,
        LogFormat::Compact => Some(text_layer(false)),
        LogFormat::Detailed => Some(text_layer(true)),
    };
    let json = match format {
        LogFormat::Json => json_layer(),
        _ => None,
    };

    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(text)
        .with(json)
        .init();

    if format != requested {
        tracing::warn!(?requested, "Log format needs the `json` feature; using compact");
    }
    if format == LogFormat::Detailed {
        crate::log_with_context!(info, "Logger initialized (detailed format)");
    }
}

#[cfg(test)]
pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("error"))
        .with_test_writer()
        .with_ansi(false)
        .try_init();
}

/// Emits an event stamped with the host name and resident memory.
#[macro_export]
macro_rules! log_with_context {
    ($level:ident, $($arg:tt)*) => {
        tracing::$level!(
            host = %$crate::logger::get_hostname(),
            rss = %$crate::logger::get_memory_usage(),
            $($arg)*
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("compact".parse::<LogFormat>(), Ok(LogFormat::Compact));
        assert_eq!(" Detailed ".parse::<LogFormat>(), Ok(LogFormat::Detailed));
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_effective_format() {
        assert_eq!(LogFormat::Detailed.effective(), LogFormat::Detailed);
        let json = LogFormat::Json.effective();
        if cfg!(feature = "json") {
            assert_eq!(json, LogFormat::Json);
        } else {
            assert_eq!(json, LogFormat::Compact);
        }
    }

    #[test]
    fn test_host_context_is_never_empty() {
        init_test_logger();
        assert!(!get_hostname().is_empty());
        assert_eq!(get_hostname(), get_hostname());
        let rss = get_memory_usage();
        assert!(rss.ends_with('M') || rss == "N/A");
        crate::log_with_context!(debug, "context stamped");
    }
}
