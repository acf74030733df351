// SPDX-License-Identifier: MIT

//! Rendering and key handling for the observer (§4.9 steps 4-5). Built on
//! `ratatui`/`crossterm`, the modern idiomatic replacement for a hand-rolled
//! curses UI; this module owns only the "what to draw and which key does what"
//! logic; the terminal setup/teardown dance lives in `main.rs`.

use crate::client::{Client, NodeStats};
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::layout::Constraint;
use ratatui::style::{Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Row, Table};
use ratatui::Frame;
use std::time::Duration;

/// Sort modes named in §4.9.4: 0 is ascending by name, 1..6 are all descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    Name,
    InPackets,
    InBytes,
    OutPackets,
    OutBytes,
    TotalPackets,
    TotalBytes,
}

/// Observer state that outlives a single frame: sort mode, cumulative/rate toggle,
/// refresh delay, and the running client.
pub struct App {
    pub client: Client,
    pub sort_mode: SortMode,
    pub cumulative: bool,
    pub delay: Duration,
    pub should_quit: bool,
    pub prompting_delay: Option<String>,
}

impl App {
    pub fn new(client: Client) -> Self {
        App {
            client,
            sort_mode: SortMode::Name,
            cumulative: true,
            delay: Duration::from_secs(1),
            should_quit: false,
            prompting_delay: None,
        }
    }

    /// Handles one key event (§4.9.5). When a delay prompt is active, digits are
    /// appended to it and Enter commits a new `delay` (minimum 0.1s); any other key
    /// during a prompt cancels it.
    pub fn on_key(&mut self, key: KeyEvent) {
        if let Some(buf) = &mut self.prompting_delay {
            match key.code {
                KeyCode::Char(c) if c.is_ascii_digit() || c == '.' => buf.push(c),
                KeyCode::Enter => {
                    if let Ok(secs) = buf.parse::<f64>() {
                        self.delay = Duration::from_secs_f64(secs.max(0.1));
                    }
                    self.prompting_delay = None;
                }
                KeyCode::Esc => self.prompting_delay = None,
                _ => {}
            }
            return;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Char('n') => self.sort_mode = SortMode::Name,
            KeyCode::Char('i') => self.sort_mode = SortMode::InPackets,
            KeyCode::Char('I') => self.sort_mode = SortMode::InBytes,
            KeyCode::Char('o') => self.sort_mode = SortMode::OutPackets,
            KeyCode::Char('O') => self.sort_mode = SortMode::OutBytes,
            KeyCode::Char('t') => self.sort_mode = SortMode::TotalPackets,
            KeyCode::Char('T') => self.sort_mode = SortMode::TotalBytes,
            KeyCode::Char('c') => self.cumulative = !self.cumulative,
            KeyCode::Char('s') => self.prompting_delay = Some(String::new()),
            _ => {}
        }
    }

    pub fn draw(&self, frame: &mut Frame) {
        let mut rows: Vec<&NodeStats> = self.client.nodes().iter().collect();
        sort_nodes(&mut rows, self.sort_mode);

        let header = Row::new(vec![
            "NODE", "IN PKTS", "IN BYTES", "OUT PKTS", "OUT BYTES",
        ]);
        let body: Vec<Row> = rows
            .iter()
            .map(|n| {
                let style = row_style(n);
                let (ip, ib, op, ob) = if self.cumulative {
                    (
                        n.in_packets.to_string(),
                        n.in_bytes.to_string(),
                        n.out_packets.to_string(),
                        n.out_bytes.to_string(),
                    )
                } else {
                    (
                        format!("{:.1}/s", n.in_packet_rate),
                        format!("{:.1}/s", n.in_byte_rate),
                        format!("{:.1}/s", n.out_packet_rate),
                        format!("{:.1}/s", n.out_byte_rate),
                    )
                };
                Row::new(vec![n.name.clone(), ip, ib, op, ob]).style(style)
            })
            .collect();

        let widths = [
            Constraint::Percentage(30),
            Constraint::Percentage(17),
            Constraint::Percentage(17),
            Constraint::Percentage(17),
            Constraint::Percentage(19),
        ];
        let title = match &self.prompting_delay {
            Some(buf) => format!("tinc observer — new delay (s): {buf}_"),
            None => format!(
                "tinc observer — sort={:?} mode={} delay={:.1}s",
                self.sort_mode,
                if self.cumulative { "cumulative" } else { "rate" },
                self.delay.as_secs_f64()
            ),
        };
        let table = Table::new(body, widths)
            .header(header)
            .block(Block::default().borders(Borders::ALL).title(Line::from(title)));

        frame.render_widget(table, frame.area());
    }
}

fn row_style(node: &NodeStats) -> Style {
    if !node.known {
        return Style::default().add_modifier(Modifier::DIM);
    }
    let active = node.in_packet_rate > 0.0 || node.out_packet_rate > 0.0;
    if active {
        Style::default().add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    }
}

fn sort_nodes(rows: &mut [&NodeStats], mode: SortMode) {
    match mode {
        SortMode::Name => rows.sort_by(|a, b| a.name.cmp(&b.name)),
        SortMode::InPackets => rows.sort_by(|a, b| b.in_packets.cmp(&a.in_packets)),
        SortMode::InBytes => rows.sort_by(|a, b| b.in_bytes.cmp(&a.in_bytes)),
        SortMode::OutPackets => rows.sort_by(|a, b| b.out_packets.cmp(&a.out_packets)),
        SortMode::OutBytes => rows.sort_by(|a, b| b.out_bytes.cmp(&a.out_bytes)),
        SortMode::TotalPackets => rows.sort_by(|a, b| b.total_packets().cmp(&a.total_packets())),
        SortMode::TotalBytes => rows.sort_by(|a, b| b.total_bytes().cmp(&a.total_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, in_pkts: u64, out_pkts: u64) -> NodeStats {
        NodeStats {
            name: name.to_string(),
            in_packets: in_pkts,
            out_packets: out_pkts,
            known: true,
            ..NodeStats::default()
        }
    }

    #[test]
    fn sort_by_name_is_ascending() {
        let a = node("bravo", 1, 1);
        let b = node("alpha", 1, 1);
        let mut rows = vec![&a, &b];
        sort_nodes(&mut rows, SortMode::Name);
        assert_eq!(rows[0].name, "alpha");
    }

    #[test]
    fn sort_by_in_packets_is_descending() {
        let a = node("a", 5, 0);
        let b = node("b", 20, 0);
        let mut rows = vec![&a, &b];
        sort_nodes(&mut rows, SortMode::InPackets);
        assert_eq!(rows[0].name, "b");
    }

    #[test]
    fn key_n_resets_sort_to_name() {
        let mut app = App::new(Client::new(std::path::PathBuf::from("/nonexistent")));
        app.sort_mode = SortMode::TotalBytes;
        app.on_key(KeyEvent::from(KeyCode::Char('n')));
        assert_eq!(app.sort_mode, SortMode::Name);
    }

    #[test]
    fn key_q_requests_quit() {
        let mut app = App::new(Client::new(std::path::PathBuf::from("/nonexistent")));
        app.on_key(KeyEvent::from(KeyCode::Char('q')));
        assert!(app.should_quit);
    }

    #[test]
    fn delay_prompt_commits_on_enter() {
        let mut app = App::new(Client::new(std::path::PathBuf::from("/nonexistent")));
        app.on_key(KeyEvent::from(KeyCode::Char('s')));
        app.on_key(KeyEvent::from(KeyCode::Char('2')));
        app.on_key(KeyEvent::from(KeyCode::Enter));
        assert_eq!(app.delay, Duration::from_secs_f64(2.0));
        assert!(app.prompting_delay.is_none());
    }
}
