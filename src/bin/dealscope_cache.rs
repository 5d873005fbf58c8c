//! dealscope-cache: 结果缓存目录的检查与维护工具
//!
//! Usage:
//!   dealscope-cache stats                     Show tier sizes and counters
//!   dealscope-cache keys                      List cached keys
//!   dealscope-cache get <key>                 Print one cached payload
//!   dealscope-cache sweep                     Remove expired entries
//!   dealscope-cache invalidate <regex>        Remove entries whose key or tag matches
//!
//! Every command accepts `--dir <path>` and `--config <file>`.

use anyhow::{bail, Context};
use dealscope::cache::{Matcher, TieredCache};
use dealscope::config::{DealscopeConfig, ENV_CACHE_DIR};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "stats" => cmd_stats(&args[2..]),
        "keys" => cmd_keys(&args[2..]),
        "get" => cmd_get(&args[2..]),
        "sweep" => cmd_sweep(&args[2..]),
        "invalidate" => cmd_invalidate(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("dealscope-cache {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"dealscope-cache: 结果缓存维护工具

USAGE:
    dealscope-cache <COMMAND> [OPTIONS]

COMMANDS:
    stats                       Show tier sizes, hit/miss counters and capacities
    keys                        List every cached key
    get <key>                   Print the cached payload for <key>
    sweep                       Remove expired entries from both tiers
    invalidate <regex>          Remove entries whose key or tag matches <regex>
    invalidate --tag <tag>      Remove entries stored with <tag>
    invalidate --prefix <text>  Remove entries whose key starts with <text>
    version                     Show version information
    help                        Show this help message

OPTIONS:
    --dir <path>                Cache directory (overrides config and environment)
    --config <file>             YAML configuration file

ENVIRONMENT:
    DEALSCOPE_CACHE_DIR         Cache directory
    RUST_LOG                    Log filter (default: info)"#
    );
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Positional arguments, skipping `--flag value` pairs.
fn positionals(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg.starts_with("--") {
            iter.next();
        } else {
            out.push(arg.as_str());
        }
    }
    out
}

fn open_cache(args: &[String]) -> anyhow::Result<TieredCache<serde_json::Value>> {
    let config_path = flag_value(args, "--config").map(PathBuf::from);
    let mut config = DealscopeConfig::load(config_path.as_deref()).context("loading configuration")?;
    if let Some(dir) = flag_value(args, "--dir") {
        config.cache.cache_dir = Some(PathBuf::from(dir));
    }
    let Some(dir) = config.cache.cache_dir.clone() else {
        bail!("no cache directory; use --dir, a config file, or {ENV_CACHE_DIR}");
    };
    let cache = TieredCache::open(config.cache)
        .with_context(|| format!("opening cache at {}", dir.display()))?;
    Ok(cache)
}

fn cmd_stats(args: &[String]) -> anyhow::Result<()> {
    let cache = open_cache(args)?;
    let stats = cache.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn cmd_keys(args: &[String]) -> anyhow::Result<()> {
    let cache = open_cache(args)?;
    let keys = cache.keys();
    for key in &keys {
        println!("{key}");
    }
    eprintln!("{} key(s)", keys.len());
    Ok(())
}

fn cmd_get(args: &[String]) -> anyhow::Result<()> {
    let Some(key) = positionals(args).first().copied() else {
        bail!("usage: dealscope-cache get <key>");
    };
    let cache = open_cache(args)?;
    match cache.get(key) {
        Some(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        None => bail!("no cached entry for {key:?}"),
    }
}

fn cmd_sweep(args: &[String]) -> anyhow::Result<()> {
    let cache = open_cache(args)?;
    // Opening already sweeps; a second pass catches entries that expired since.
    let removed = cache.sweep();
    println!("removed {removed} expired entr{}", if removed == 1 { "y" } else { "ies" });
    println!("{} entries remain", cache.len());
    Ok(())
}

fn cmd_invalidate(args: &[String]) -> anyhow::Result<()> {
    let matcher = if let Some(tag) = flag_value(args, "--tag") {
        Matcher::tag(tag)
    } else if let Some(prefix) = flag_value(args, "--prefix") {
        Matcher::prefix(prefix)
    } else {
        let Some(pattern) = positionals(args).first().copied() else {
            bail!("usage: dealscope-cache invalidate <regex> | --tag <tag> | --prefix <text>");
        };
        Matcher::pattern(pattern)?
    };
    let cache = open_cache(args)?;
    let removed = cache.invalidate(&matcher);
    println!("invalidated {removed} entr{}", if removed == 1 { "y" } else { "ies" });
    Ok(())
}
