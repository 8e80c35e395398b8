use anyhow::{Context, Result};
use blackboard_core::BlackboardConfig;
use std::path::Path;

/// Config from `path`, or the defaults when no path was given
pub fn load_config(path: Option<&Path>) -> Result<BlackboardConfig> {
    match path {
        Some(path) => BlackboardConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(BlackboardConfig::default()),
    }
}

pub fn print_default_config() -> Result<()> {
    print!("{}", BlackboardConfig::default().to_yaml()?);
    Ok(())
}

pub fn check_config(path: &Path) -> Result<()> {
    let config = load_config(Some(path))?;
    let interval = match config.snapshot_interval() {
        Some(interval) => format!("every {}ms", interval.as_millis()),
        None => "disabled".to_string(),
    };
    println!("{}: ok", path.display());
    println!(
        "  snapshots: {} ({:?} mode)",
        interval, config.snapshot.mode
    );
    println!(
        "  addresses: debounce {}ms, cache {}",
        config.addresses.debounce_ms, config.addresses.cache_capacity
    );
    if let Some(rounds) = config.max_rule_rounds {
        println!("  rule rounds: at most {}", rounds);
    }
    Ok(())
}
