#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use synapse::config::{self, Config};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// Host management agent driven by commands received over an AMQP broker.
#[derive(Parser, Debug)]
#[command(name = "synapse-agent")]
#[command(author)]
#[command(version)]
#[command(about = "Host management agent driven over an AMQP broker.", long_about = None)]
struct Cli {
    /// Config file (default: $SYNAPSE_CONFIG, then /etc/synapse-agent/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the broker and start serving commands
    #[command(long_about = "\
Connect to the broker and start serving commands.

Runs until SIGINT or SIGTERM. Exits non-zero when the broker refuses the
agent (revoked credentials, deleted vhost) or connection attempts run out.

Examples:
  synapse-agent run
  synapse-agent run --vhost hosts --disable hosts
  synapse-agent --config ./agent.toml run --uuid 5f1c9a2e")]
    Run {
        /// Override the agent identity (and default queue name)
        #[arg(long)]
        uuid: Option<String>,

        /// Override the broker virtual host
        #[arg(long)]
        vhost: Option<String>,

        /// Comma-separated resources to disable
        #[arg(long, value_delimiter = ',')]
        disable: Vec<String>,
    },

    /// Print the effective configuration as TOML
    PrintConfig,

    /// Show the last health snapshot written by the running agent
    Status,

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `synapse-agent`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(synapse-agent completions bash)
  synapse-agent completions zsh > ~/.zfunc/_synapse-agent
  synapse-agent completions fish > ~/.config/fish/completions/synapse-agent.fish")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Completions must remain stdout-only and should not load config or initialize logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    let config_path = config::resolve_config_path(cli.config.clone());
    let mut config = Config::load_or_init(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // RUST_LOG wins over [log] level.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level.as_str())),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    match cli.command {
        Commands::Run {
            uuid,
            vhost,
            disable,
        } => {
            apply_run_overrides(&mut config, uuid, vhost, disable);
            config.validate()?;
            synapse::daemon::run(config).await
        }
        Commands::PrintConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Status => {
            let path = synapse::daemon::state_file_path(&config);
            let state = synapse::daemon::read_state(&path)?;
            print_status(&state);
            Ok(())
        }
        Commands::Completions { .. } => unreachable!(),
    }
}

fn apply_run_overrides(
    config: &mut Config,
    uuid: Option<String>,
    vhost: Option<String>,
    disable: Vec<String>,
) {
    if let Some(uuid) = uuid.filter(|v| !v.trim().is_empty()) {
        config.broker.uuid = uuid;
    }
    if let Some(vhost) = vhost.filter(|v| !v.trim().is_empty()) {
        config.broker.vhost = vhost;
    }
    for name in disable {
        let name = name.trim().to_string();
        if !name.is_empty() && !config.controller.ignored_resources.contains(&name) {
            config.controller.ignored_resources.push(name);
        }
    }
}

fn print_status(state: &serde_json::Value) {
    let field = |key: &str| {
        state
            .get(key)
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
            .unwrap_or_else(|| "-".into())
    };
    println!("pid:      {}", field("pid"));
    println!("uptime:   {}s", field("uptime_seconds"));
    println!("written:  {}", field("written_at"));

    let Some(components) = state.get("components").and_then(serde_json::Value::as_object) else {
        println!("no components tracked yet");
        return;
    };
    for (name, component) in components {
        let status = component
            .get("status")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        let restarts = component
            .get("restart_count")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        match component.get("last_error").and_then(serde_json::Value::as_str) {
            Some(error) if status != "ok" => {
                println!("  {name:<12} {status} (restarts {restarts}): {error}");
            }
            _ => println!("  {name:<12} {status} (restarts {restarts})"),
        }
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_author_comes_from_package_metadata() {
        let cmd = Cli::command();
        assert_eq!(cmd.get_author(), Some(env!("CARGO_PKG_AUTHORS")));
        assert_eq!(env!("CARGO_PKG_AUTHORS"), "Synapse Agent Contributors");
    }

    #[test]
    fn run_accepts_overrides() {
        let cli = Cli::try_parse_from([
            "synapse-agent",
            "--config",
            "/tmp/agent.toml",
            "run",
            "--uuid",
            "5f1c",
            "--vhost",
            "hosts",
            "--disable",
            "hosts,files",
        ])
        .expect("run invocation should parse");

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/agent.toml")));
        match cli.command {
            Commands::Run {
                uuid,
                vhost,
                disable,
            } => {
                assert_eq!(uuid.as_deref(), Some("5f1c"));
                assert_eq!(vhost.as_deref(), Some("hosts"));
                assert_eq!(disable, vec!["hosts", "files"]);
            }
            other => panic!("expected run command, got {other:?}"),
        }
    }

    #[test]
    fn run_overrides_update_config() {
        let mut config = Config::default();
        config.ensure_identity();
        config.controller.ignored_resources.push("hosts".into());

        apply_run_overrides(
            &mut config,
            Some("agent-7".into()),
            Some("".into()),
            vec!["hosts".into(), " files ".into()],
        );
        assert_eq!(config.broker.uuid, "agent-7");
        assert_eq!(config.broker.queue_name(), "agent-7");
        assert_eq!(config.broker.vhost, "/");
        assert_eq!(config.controller.ignored_resources, vec!["hosts", "files"]);
    }

    #[test]
    fn completions_cli_parses_supported_shells() {
        for shell in ["bash", "fish", "zsh", "powershell", "elvish"] {
            let cli = Cli::try_parse_from(["synapse-agent", "completions", shell])
                .expect("completions invocation should parse");
            match cli.command {
                Commands::Completions { .. } => {}
                other => panic!("expected completions command, got {other:?}"),
            }
        }
    }

    #[test]
    fn completion_generation_mentions_binary_name() {
        let mut output = Vec::new();
        write_shell_completion(CompletionShell::Bash, &mut output)
            .expect("completion generation should succeed");
        let script = String::from_utf8(output).expect("completion output should be valid utf-8");
        assert!(
            script.contains("synapse-agent"),
            "completion script should reference binary name"
        );
    }
}
