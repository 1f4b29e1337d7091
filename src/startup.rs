// Startup module - banner and startup logging
//
// Prints a short banner to stdout before structured logging takes over, and
// logs the effective configuration so a pod's first log lines answer the
// usual questions: which model, which deployment, which timeouts.

use crate::config::{Config, VERSION};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const MAGENTA: &str = "\x1b[35m";
}

/// Print the startup banner
pub fn print_startup(config: &Config) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}coldfront{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}Scale-to-zero proxy for OpenAI-compatible inference backends{RESET}");
    println!();

    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("  {DIM}Config:{RESET} {}", path.display());
        } else {
            println!("  {DIM}Config:{RESET} {DIM}(env + defaults){RESET}");
        }
    }

    println!(
        "  {MAGENTA}▸{RESET} {} / {} -> {BOLD}{}{RESET}",
        config.namespace, config.deployment, config.backend_url
    );
    println!("  {MAGENTA}▸{RESET} Listening on port {BOLD}{}{RESET}", config.port);
    println!();
}

/// Log the effective configuration at startup
pub fn log_startup(config: &Config) {
    tracing::info!(
        version = VERSION,
        namespace = %config.namespace,
        deployment = %config.deployment,
        backend_url = %config.backend_url,
        "coldfront starting"
    );
    tracing::info!(
        model_id = %config.model.model_id,
        served_name = config.model.served_name.as_deref().unwrap_or("-"),
        tensor_parallel_size = config.model.tensor_parallel_size,
        max_model_len = config.model.max_model_len,
        "model configuration loaded"
    );
    tracing::info!(
        idle_timeout_secs = config.idle_timeout.as_secs(),
        warm_timeout_secs = config.warm_timeout.as_secs(),
        schedule_timeout_secs = config.schedule_timeout.as_secs(),
        "scale-to-zero timeouts"
    );
}
