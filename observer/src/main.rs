// SPDX-License-Identifier: MIT

mod client;
mod ui;

use anyhow::Result;
use clap::Parser;
use client::{default_socket_path, Client};
use crossterm::event::{self, Event};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use std::io::stdout;
use std::path::PathBuf;
use ui::App;

/// A terminal observer for a running `tincd`'s traffic-stream subprotocol.
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// Name of the net to observe, if more than one is configured
    #[clap(short = 'n', long = "net")]
    net_name: Option<String>,

    /// Path to the control socket, overriding the net-name default
    #[clap(long = "socket")]
    socket: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).init();

    let socket_path = args
        .socket
        .unwrap_or_else(|| default_socket_path(args.net_name.as_deref()));

    let mut app = App::new(Client::new(socket_path));

    enable_raw_mode()?;
    let mut out = stdout();
    execute!(out, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(out);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &mut app);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>, app: &mut App) -> Result<()> {
    let mut last_poll = std::time::Instant::now() - app.delay;

    while !app.should_quit {
        if last_poll.elapsed() >= app.delay {
            if let Err(e) = app.client.poll() {
                tracing::warn!(error = %e, "DUMP_TRAFFIC poll failed");
            }
            last_poll = std::time::Instant::now();
        }

        terminal.draw(|frame| app.draw(frame))?;

        let remaining = app.delay.saturating_sub(last_poll.elapsed());
        if event::poll(remaining.min(std::time::Duration::from_millis(200)))? {
            if let Event::Key(key) = event::read()? {
                app.on_key(key);
            }
        }
    }
    Ok(())
}
