//! Printers: execution log, gate label line and history (termimad).

use std::{
    io::{self, Write},
    sync::atomic::{AtomicBool, Ordering},
};

use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use termimad::MadSkin;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    execution::{HistoryEntry, LogEntry},
    orchestrator::LogSink,
    throttle::GateLabel,
};

/// Log sink writing to stdout; alerts go to stderr.
pub struct TerminalLog {
    color: bool,
    dirty: AtomicBool,
}

impl TerminalLog {
    pub fn new(color: bool) -> Self {
        Self { color, dirty: AtomicBool::new(false) }
    }

    pub fn detect() -> Self {
        Self::new(io::stdout().is_terminal())
    }
}

impl LogSink for TerminalLog {
    fn clear(&self) {
        if self.dirty.swap(false, Ordering::Relaxed) {
            let rule = "─".repeat(40);
            if self.color { println!("{}", rule.dimmed()) } else { println!("{}", rule) }
        }
    }

    fn update(&self, entry: &LogEntry) {
        self.dirty.store(true, Ordering::Relaxed);
        let time = format!("実行時間: {}", entry.formatted_time());
        let body = entry.combined();
        if self.color {
            println!("{}", time.dimmed());
            if entry.is_error() {
                println!("{}", body.red());
            } else if !body.is_empty() {
                println!("{}", body);
            }
        } else {
            println!("{}", time);
            if !body.is_empty() {
                println!("{}", body);
            }
        }
    }

    fn alert(&self, message: &str) {
        if self.color {
            eprintln!("{} {}", "!".yellow().bold(), message.yellow());
        } else {
            eprintln!("! {}", message);
        }
    }
}

/// Redraws the run label on stderr whenever the throttle publishes a new one.
pub fn spawn_label_line(mut labels: watch::Receiver<GateLabel>) -> Option<JoinHandle<()>> {
    if !io::stderr().is_terminal() {
        return None;
    }
    Some(tokio::spawn(async move {
        loop {
            let label = *labels.borrow_and_update();
            let text = match label {
                GateLabel::Ready => format!("[{}]", label).green().to_string(),
                _ => format!("[{}]", label).yellow().to_string(),
            };
            {
                let mut err = io::stderr().lock();
                let _ = write!(err, "\r\x1b[2K{} ", text);
                let _ = err.flush();
            }
            if labels.changed().await.is_err() {
                break;
            }
        }
    }))
}

pub struct MarkdownPrinter {
    pub skin: MadSkin,
}

impl Default for MarkdownPrinter {
    fn default() -> Self {
        Self { skin: MadSkin::default() }
    }
}

impl MarkdownPrinter {
    pub fn print(&self, text: &str) { self.skin.print_text(text); println!(); }
}

/// Markdown rendition of the run history.
pub fn history_markdown(entries: &[HistoryEntry]) -> String {
    if entries.is_empty() {
        return "履歴がありません。\n".to_string();
    }
    let mut md = String::new();
    for entry in entries {
        let status = if entry.success { "成功" } else { "失敗" };
        md.push_str(&format!(
            "### {} [{}]\n\n実行時間: {:.3}s\n\n",
            entry.created_at.as_deref().unwrap_or("-"),
            status,
            entry.execution_time.unwrap_or(0.0),
        ));
        for (label, content) in [
            ("実行コード", entry.code.as_deref()),
            ("標準出力", entry.stdout.as_deref()),
            ("標準エラー", entry.stderr.as_deref()),
        ] {
            md.push_str(&format!("**{}**\n\n```\n{}\n```\n\n", label, content.unwrap_or("").trim_end()));
        }
    }
    md
}
