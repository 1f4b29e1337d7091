// CLI module - command-line argument parsing and handlers
//
// The binary normally just runs the proxy; subcommands cover configuration
// inspection:
// - config --show: Display effective configuration
// - config --path: Show config file path

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};

/// coldfront - scale-to-zero proxy for OpenAI-compatible inference backends
#[derive(Parser)]
#[command(name = "coldfront")]
#[command(version = VERSION)]
#[command(about = "Autoscaling, protocol-translating inference proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle CLI commands. Returns true if a command was handled (exit after).
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { show, path }) => {
            if path {
                handle_config_path();
            } else if show {
                handle_config_show();
            } else {
                println!("Usage: coldfront config [--show|--path]");
                println!();
                println!("Options:");
                println!("  --show    Display effective configuration");
                println!("  --path    Show config file path");
            }
            true
        }
        None => false, // No subcommand, run the proxy
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => {
            eprintln!("Error: Could not determine config path");
            std::process::exit(1);
        }
    }
}

fn handle_config_show() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };

    println!("# Effective configuration (env > file > defaults)");
    println!();
    println!("namespace = {:?}", config.namespace);
    println!("deployment = {:?}", config.deployment);
    println!(
        "config_map_name = {:?}",
        config.config_map_name.as_deref().unwrap_or("")
    );
    println!("idle_timeout = \"{}s\"", config.idle_timeout.as_secs());
    println!("warm_timeout = \"{}s\"", config.warm_timeout.as_secs());
    println!("port = \"{}\"", config.port);
    println!("backend_url = {:?}", config.backend_url);
    println!();
    println!("[model]");
    println!("model_id = {:?}", config.model.model_id);
    println!(
        "served_name = {:?}",
        config.model.served_name.as_deref().unwrap_or("")
    );
    if let Some(tp) = config.model.tensor_parallel_size {
        println!("tensor_parallel_size = {}", tp);
    }
    if let Some(len) = config.model.max_model_len {
        println!("max_model_len = {}", len);
    }
    if let Some(dtype) = &config.model.dtype {
        println!("dtype = {:?}", dtype);
    }
    if let Some(parser) = &config.model.tool_call_parser {
        println!("tool_call_parser = {:?}", parser);
    }
    for (key, value) in &config.model.extra {
        println!("{} = {:?}", key, value);
    }

    println!();
    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("# Source: {}", path.display());
        } else {
            println!("# Source: environment + defaults (no config file)");
        }
    }
}
