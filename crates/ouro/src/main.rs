//! ouro: recursive language model runtime.
//!
//! Drives an LM that decomposes prompts by writing code; the code runs in
//! a persistent environment and can call back into the model through
//! `llm_query`.

mod config;
mod session;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::{CONFIG_FILE, Config, OURO_DIR};
use ouro_rlm::Rlm;
use ouro_tracing::{FileSink, NullSink, TrajectorySink};
use session::Session;

/// Recursive language model runtime
#[derive(Parser)]
#[command(name = "ouro")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one completion
    Run {
        /// The prompt; reads stdin when absent
        prompt: Option<String>,

        /// Load a file as context slot 0
        #[arg(long)]
        context: Option<PathBuf>,

        /// Override the configured environment ("local" or "sandbox")
        #[arg(long)]
        env: Option<String>,

        /// Override the iteration budget
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Override the recursion depth limit
        #[arg(long)]
        max_depth: Option<u32>,
    },
    /// Write a default .ouro/config.toml in the current directory
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            prompt,
            context,
            env,
            max_iterations,
            max_depth,
        } => run(cli.verbose, prompt, context, env, max_iterations, max_depth).await,
        Command::Init => init(),
    }
}

fn init() -> Result<()> {
    let ouro_dir = PathBuf::from(OURO_DIR);
    fs::create_dir_all(&ouro_dir)?;
    let path = ouro_dir.join(CONFIG_FILE);
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let rendered = toml::to_string_pretty(&Config::default())?;
    fs::write(&path, rendered)?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn run(
    verbose: bool,
    prompt: Option<String>,
    context: Option<PathBuf>,
    env: Option<String>,
    max_iterations: Option<usize>,
    max_depth: Option<u32>,
) -> Result<()> {
    let start = std::env::current_dir()?;
    let (mut config, ouro_dir) = Config::load(&start)?;

    if let Some(env) = env {
        config.environment.environment_type = env;
    }
    if let Some(n) = max_iterations {
        config.limits.max_iterations = n;
    }
    if let Some(d) = max_depth {
        config.limits.max_depth = d;
    }

    let faults = config.validate();
    if !faults.is_empty() {
        for fault in &faults {
            eprintln!("config error - {}", fault);
        }
        bail!("invalid configuration ({} fault(s))", faults.len());
    }

    let mut session = Session::create(&ouro_dir, &config)?;
    let _log_guard = init_logging(verbose, session.dir())?;
    info!(session_id = session.id(), "session started");

    let prompt = match prompt {
        Some(p) => p,
        None => {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf.trim().to_string()
        }
    };
    if prompt.is_empty() {
        bail!("empty prompt");
    }
    session.set_prompt(ouro_rlm::types::truncate_preview(&prompt, 200))?;

    let sink: Arc<dyn TrajectorySink> = if config.trajectory.enabled {
        Arc::new(FileSink::new(session.trajectory_path())?)
    } else {
        Arc::new(NullSink)
    };

    let rlm = Rlm::new(config.to_rlm_config())?.with_sink(sink);

    let completion = if let Some(context_path) = context {
        let payload = fs::read_to_string(&context_path)
            .with_context(|| format!("Failed to read context {}", context_path.display()))?;
        // A persistent environment so the context slot is bound before the
        // loop starts.
        let handler_placeholder = "127.0.0.1:1".parse().expect("static addr");
        let mut env = ouro_rlm::LocalEnv::new(
            ouro_rlm::LocalConfig {
                python: config.environment.python.clone(),
                ..Default::default()
            },
            handler_placeholder,
        );
        use ouro_rlm::Environment;
        env.setup().await?;
        env.load_context(&payload, None).await?;
        let completion = rlm.completion_in(prompt.as_str(), &mut env).await?;
        env.teardown().await?;
        completion
    } else {
        rlm.completion(prompt.as_str()).await?
    };

    session.finish(&completion)?;
    println!("{}", completion.response);

    if verbose || completion.metadata.truncated {
        eprintln!();
        eprintln!(
            "[{} iteration(s), {} tokens, {} ms{}{}]",
            completion.iterations.len(),
            completion.usage.total_tokens(),
            completion.metadata.duration_ms,
            if completion.metadata.truncated {
                ", truncated"
            } else {
                ""
            },
            if completion.metadata.fallback {
                ", fallback"
            } else {
                ""
            },
        );
        eprintln!("[session: {}]", session.dir().display());
    }

    Ok(())
}

fn init_logging(
    verbose: bool,
    session_dir: &std::path::Path,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = RollingFileAppender::new(Rotation::NEVER, session_dir, "ouro.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_filter = if verbose {
        EnvFilter::new("info,ouro_rlm=debug")
    } else {
        EnvFilter::new("warn")
    };
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(guard)
}
