use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt;
use tracing_subscriber::Registry;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

// Crate names use underscores here: that is how they show up as tracing targets.
const DEFAULT_CRATE_NAMES: [&str; 7] = [
    "sketchdb_blockstore",
    "sketchdb_cache",
    "sketchdb_config",
    "sketchdb_distance",
    "sketchdb_error",
    "sketchdb_index",
    "sketchdb_tracing",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FilterLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for FilterLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterLevel::Trace => f.write_str("trace"),
            FilterLevel::Debug => f.write_str("debug"),
            FilterLevel::Info => f.write_str("info"),
            FilterLevel::Warn => f.write_str("warn"),
            FilterLevel::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TracingFilter {
    pub crate_name: String,
    pub filter_level: FilterLevel,
}

pub(crate) fn global_filter_directive(custom_filters: &[TracingFilter]) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(DEFAULT_CRATE_NAMES.iter().map(|s| format!("{s}=info")));
    directives.extend(
        custom_filters
            .iter()
            .map(|custom_filter| format!("{}={}", custom_filter.crate_name, custom_filter.filter_level)),
    );
    directives.join(",")
}

/// `RUST_LOG` wins over the built-in directive when it is set.
pub fn init_global_filter_layer(
    custom_filters: &[TracingFilter],
) -> Box<dyn Layer<Registry> + Send + Sync> {
    let directive =
        std::env::var("RUST_LOG").unwrap_or_else(|_| global_filter_directive(custom_filters));
    EnvFilter::new(directive).boxed()
}

pub fn init_stdout_layer() -> Box<dyn Layer<Registry> + Send + Sync> {
    fmt::layer().with_target(true).boxed()
}

pub fn init_tracing(layers: Vec<Box<dyn Layer<Registry> + Send + Sync>>) {
    let Some(layers) = layers.into_iter().reduce(|a, b| Box::new(a.and_then(b))) else {
        return;
    };
    let subscriber = tracing_subscriber::registry().with(layers);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Global tracing subscriber already set");
        return;
    }
    tracing::info!("Global tracing subscriber set");
}

pub fn init_panic_tracing_hook() {
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();

        let payload = if let Some(s) = payload.downcast_ref::<&str>() {
            Some(&**s)
        } else {
            payload.downcast_ref::<String>().map(|s| s.as_str())
        };

        tracing::error!(
            panic.payload = payload,
            panic.location = panic_info.location().map(|l| l.to_string()),
            "A panic occurred"
        );

        prev_hook(panic_info);
    }));
}

/// Filter + stdout formatting + panic hook. What an embedding binary or a
/// benchmark calls once at startup.
pub fn init_stdout_tracing(custom_filters: &[TracingFilter]) {
    let layers = vec![
        // The filter applies to all subsequent layers.
        init_global_filter_layer(custom_filters),
        init_stdout_layer(),
    ];
    init_tracing(layers);
    init_panic_tracing_hook();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_lists_workspace_crates() {
        let directive = global_filter_directive(&[]);
        assert!(directive.starts_with("warn,"));
        for name in DEFAULT_CRATE_NAMES {
            assert!(directive.contains(&format!("{name}=info")));
        }
    }

    #[test]
    fn test_custom_filters_are_appended() {
        let directive = global_filter_directive(&[TracingFilter {
            crate_name: "sketchdb_index".to_string(),
            filter_level: FilterLevel::Trace,
        }]);
        assert!(directive.ends_with("sketchdb_index=trace"));
    }

    #[test]
    fn test_filter_level_deserializes_snake_case() {
        let filter: TracingFilter =
            serde_json::from_str(r#"{"crate_name": "x", "filter_level": "debug"}"#).unwrap();
        assert_eq!(filter.filter_level, FilterLevel::Debug);
    }
}
