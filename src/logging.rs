use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` when set, otherwise a level for this crate
/// picked by the `-v` count, with HTTP plumbing kept quiet.
fn build_env_filter(verbosity: u8) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let directives = [
        format!("jobtrack={}", level),
        "warn".to_string(),
        "hyper=warn".to_string(),
        "reqwest=warn".to_string(),
    ]
    .join(",");
    EnvFilter::try_new(&directives)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", directives, e))
}

/// Installs a stderr subscriber. Stdout stays reserved for command output.
pub fn init_logging(verbosity: u8) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(verbosity)?)
        .with_writer(std::io::stderr)
        .with_target(verbosity > 1)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_builds_for_every_verbosity() {
        for v in 0..5 {
            assert!(build_env_filter(v).is_ok());
        }
    }
}
