use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "hibiki", about = "Run code on the HibikiCode sandbox", version)]
pub struct Cli {
    /// Server base URL (overrides HIBIKI_API_BASE_URL).
    #[arg(long = "base-url", global = true)]
    pub base_url: Option<String>,

    /// HTML file plots are written to (overrides PLOT_OUTPUT).
    #[arg(long = "plot-out", global = true)]
    pub plot_out: Option<PathBuf>,

    /// Log debug events to stderr (RUST_LOG still wins when set).
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Submit code once. Reads FILE, or stdin when FILE is omitted.
    Run {
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Re-read FILE and submit it each time Enter is pressed; `q` quits.
    Session {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Log in and store the access token.
    Login {
        username: String,
        /// Read the password from the first line of stdin without prompting.
        #[arg(long = "password-stdin")]
        password_stdin: bool,
    },
    /// Log out and forget the stored token.
    Logout,
    /// Show the logged-in user.
    Whoami,
    /// Show recent runs.
    History {
        /// Number of entries (1-100).
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
        /// Print plain text instead of rendered Markdown.
        #[arg(long = "no-md")]
        no_md: bool,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
