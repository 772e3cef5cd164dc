mod api;
mod cache;
mod cli;
mod config;
mod execution;
mod loader;
mod orchestrator;
mod printer;
mod render;
mod throttle;

use std::{
    io::{self, Read, Write},
    path::Path,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use is_terminal::IsTerminal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use api::{ApiClient, TokenStore};
use cli::Command;
use config::Config;
use loader::{HttpScriptFetcher, VersionedLoader};
use orchestrator::{LogSink, Orchestrator, SubmitOutcome};
use printer::{MarkdownPrinter, TerminalLog};
use render::{HtmlFileTarget, RenderGate};
use throttle::Throttle;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_tracing(args.verbose);

    let mut cfg = Config::load();
    if let Some(url) = &args.base_url {
        cfg.set("HIBIKI_API_BASE_URL", url.as_str());
    }
    if let Some(path) = &args.plot_out {
        cfg.set("PLOT_OUTPUT", path.to_string_lossy());
    }

    match args.command {
        Command::Run { file } => run_once(&cfg, file.as_deref()).await,
        Command::Session { file } => run_session(&cfg, &file).await,
        Command::Login { username, password_stdin } => login(&cfg, &username, password_stdin).await,
        Command::Logout => {
            let client = ApiClient::from_config(&cfg)?;
            let store = TokenStore::from_config(&cfg);
            if let Err(e) = client.logout().await {
                tracing::warn!(target: "hibiki", error = %e, "server-side logout failed");
            }
            store.clear()?;
            println!("Logged out");
            Ok(())
        }
        Command::Whoami => {
            let user = ApiClient::from_config(&cfg)?.me().await?;
            let role = if user.is_admin { ", admin" } else { "" };
            println!("{} (id {}{})", user.username, user.id, role);
            Ok(())
        }
        Command::History { limit, no_md } => {
            let entries = ApiClient::from_config(&cfg)?.history(limit).await?;
            let md = printer::history_markdown(&entries);
            if no_md || !io::stdout().is_terminal() {
                print!("{}", md);
            } else {
                MarkdownPrinter::default().print(&md);
            }
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "hibiki=debug" } else { "hibiki=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn build_orchestrator(cfg: &Config, log: Arc<dyn LogSink>) -> Result<(Orchestrator, Arc<HtmlFileTarget>)> {
    let endpoint = Arc::new(ApiClient::from_config(cfg)?);
    let fetcher = Arc::new(HttpScriptFetcher::from_config(cfg)?);
    let loader = Arc::new(VersionedLoader::new(
        fetcher,
        cfg.bokeh_url_template(),
        cfg.bokeh_entry_point(),
    ));
    let target = Arc::new(HtmlFileTarget::new(
        cfg.plot_output(),
        cfg.plot_target_id(),
        cfg.bokeh_entry_point(),
    ));
    let gate = RenderGate::new(loader, target.clone(), cfg.bokeh_fallback_version());
    let throttle = Throttle::new(cfg.cooldown_window(), cfg.display_tick());
    Ok((Orchestrator::new(endpoint, throttle, gate, log), target))
}

async fn run_once(cfg: &Config, file: Option<&Path>) -> Result<()> {
    let code = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            if io::stdin().is_terminal() {
                bail!("Provide a FILE or pipe code via stdin");
            }
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let log = Arc::new(TerminalLog::detect());
    let (orchestrator, target) = build_orchestrator(cfg, log)?;
    let outcome = orchestrator.submit(&code).await;
    if target.path().exists() {
        println!("plot: {}", target.path().display());
    }
    match outcome {
        SubmitOutcome::Completed { success: true } => Ok(()),
        SubmitOutcome::Completed { success: false } => bail!("execution failed: the program reported an error"),
        SubmitOutcome::Failed(err) => bail!("execution failed ({}): {}", err.kind(), err),
    }
}

async fn run_session(cfg: &Config, file: &Path) -> Result<()> {
    let log = Arc::new(TerminalLog::detect());
    let (orchestrator, target) = build_orchestrator(cfg, log.clone())?;
    let label_line = printer::spawn_label_line(orchestrator.throttle().subscribe());

    eprintln!("Enter: 実行 / r: 待機解除 / q: 終了 ({})", file.display());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "q" => break,
            "r" => {
                orchestrator.throttle().reset();
                continue;
            }
            _ => {}
        }
        let code = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        match orchestrator.try_submit(&code).await {
            None => log.alert(&format!("まだ実行できません [{}]", orchestrator.throttle().label())),
            Some(outcome) if outcome.is_success() && target.path().exists() => {
                println!("plot: {}", target.path().display());
            }
            Some(_) => {}
        }
    }

    if let Some(handle) = label_line {
        handle.abort();
        eprintln!();
    }
    Ok(())
}

async fn login(cfg: &Config, username: &str, password_stdin: bool) -> Result<()> {
    if !password_stdin {
        eprint!("Password: ");
        io::stderr().flush()?;
    }
    let mut password = String::new();
    io::stdin().read_line(&mut password).context("reading password")?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("password is empty");
    }

    let client = ApiClient::from_config(cfg)?;
    let (token, user) = client.login(username, password).await?;
    TokenStore::from_config(cfg).save(&token)?;
    println!("Logged in as {}", user.username);
    Ok(())
}
