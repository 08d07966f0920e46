mod cli;
mod config;
mod storage;

use std::io::{self, Write};

use clap::Parser;
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vaultpref_prefs::PreferenceContext;

use crate::cli::{Command, ConfigCommand};

const HEALTH_PROBE_KEY: &str = "health/probe";

// Plain `fn main`: the preference pool owns its own runtime, and a runtime
// cannot be dropped from inside another one's async context.
fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let mut config = config::load()?;
    if let Some(store) = cli.store {
        config.name = store;
    }

    match cli.command {
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        Command::Config(ConfigCommand::Path) => println!("{}", config::default_path()?.display()),
        command => {
            let ctx = storage::open_context(&config)?;
            execute(&ctx, command, &mut io::stdout().lock())?;
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info; logs go to stderr so values can be piped.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("vaultpref {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

/// Runs a store command against `ctx`, writing results to `out`.
fn execute(ctx: &PreferenceContext, command: Command, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Get { key, default } => {
            match ctx.nullable_string(&key, default, false).get()? {
                Some(value) => writeln!(out, "{value}")?,
                None => color_eyre::eyre::bail!("`{key}` is not set"),
            }
        }
        Command::Put { key, value, queued } => {
            let pref = ctx.nullable_string(&key, None, false);
            if queued {
                pref.put_async(Some(value)).wait();
                if !ctx.store().contains(&key)? {
                    color_eyre::eyre::bail!("queued write for `{key}` did not land");
                }
            } else {
                pref.put(Some(value))?;
            }
        }
        Command::Remove { key } => ctx.nullable_string(&key, None, false).put(None)?,
        Command::Contains { key } => writeln!(out, "{}", ctx.store().contains(&key)?)?,
        Command::Clear => {
            ctx.clear()?;
            info!(store = %ctx.store().name(), "store cleared");
        }
        Command::Health => {
            run_store_health(ctx)?;
            writeln!(out, "Storage: ok ({})", ctx.store().integrity_tag())?;
        }
        Command::Version | Command::Config(_) => {}
    }
    Ok(())
}

/// Write, read back and delete a probe entry.
fn run_store_health(ctx: &PreferenceContext) -> Result<()> {
    let probe = ctx.nullable_string(HEALTH_PROBE_KEY, None, false);
    probe.put(Some("ok".to_string()))?;
    let round_trip = probe.get()?;
    probe.put(None)?;

    if round_trip.as_deref() != Some("ok") {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Config, CryptoConfig, KeyKind},
        storage,
    };

    fn fixed_key_context() -> PreferenceContext {
        let config = Config {
            crypto: CryptoConfig {
                key: KeyKind::Fixed,
                password: Some("0123456789abcdef".into()),
                ..CryptoConfig::default()
            },
            pool_threads: Some(2),
            ..Config::default()
        };
        storage::test_context(&config).expect("test context")
    }

    fn run(ctx: &PreferenceContext, args: &[&str]) -> Result<String> {
        let mut argv = vec!["vaultpref"];
        argv.extend_from_slice(args);
        let cli = cli::Cli::try_parse_from(argv)?;
        let mut out = Vec::new();
        execute(ctx, cli.command, &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn health_check_with_test_store_succeeds() {
        let ctx = storage::test_context(&Config::default()).expect("test context");
        run_store_health(&ctx).expect("health check should succeed");
        assert!(!ctx.store().contains(HEALTH_PROBE_KEY).expect("contains"));
    }

    #[test]
    fn put_get_remove_round_trip() {
        let ctx = fixed_key_context();
        run(&ctx, &["put", "theme", "dark"]).expect("put");
        assert_eq!(run(&ctx, &["get", "theme"]).expect("get"), "dark\n");
        assert_eq!(run(&ctx, &["contains", "theme"]).expect("contains"), "true\n");

        run(&ctx, &["remove", "theme"]).expect("remove");
        assert_eq!(run(&ctx, &["contains", "theme"]).expect("contains"), "false\n");
        assert!(run(&ctx, &["get", "theme"]).is_err());
        assert_eq!(
            run(&ctx, &["get", "theme", "--default", "light"]).expect("get default"),
            "light\n"
        );
    }

    #[test]
    fn async_put_is_visible_after_return() {
        let ctx = fixed_key_context();
        run(&ctx, &["put", "k", "queued", "--async"]).expect("put");
        assert_eq!(run(&ctx, &["get", "k"]).expect("get"), "queued\n");
    }

    #[test]
    fn clear_leaves_an_empty_store() {
        let ctx = fixed_key_context();
        run(&ctx, &["put", "a", "1"]).expect("put");
        run(&ctx, &["put", "b", "2"]).expect("put");
        run(&ctx, &["clear"]).expect("clear");
        assert_eq!(run(&ctx, &["contains", "a"]).expect("contains"), "false\n");
        assert!(run(&ctx, &["health"]).expect("health").starts_with("Storage: ok"));
    }
}
