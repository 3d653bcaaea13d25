use crossterm::{
    queue,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use std::io::{self, Write};

use super::clean_output;
use crate::agents::orchestrator::WorkerStatus;
use crate::agents::{ResultStatus, TaskResult};
use crate::app::session::Reply;
use crate::history::HistoryRecord;

/// Line-oriented renderer for session replies.
pub struct SimpleLayer {
    color: bool,
    line_end: &'static str,
}

impl SimpleLayer {
    /// Renderer for a terminal in raw mode, where a newline does not return
    /// the carriage.
    pub fn raw() -> Self {
        Self {
            color: true,
            line_end: "\r\n",
        }
    }

    pub fn plain() -> Self {
        Self {
            color: false,
            line_end: "\n",
        }
    }

    pub fn banner(&self, out: &mut impl Write, provider: &str, model: &str) -> io::Result<()> {
        self.line(out, Color::Cyan, "swarm-ide: code generation and debugging agents")?;
        self.line(
            out,
            Color::DarkGrey,
            &format!("model {} via {}. Type 'help' for commands.", model, provider),
        )?;
        out.flush()
    }

    pub fn render(&self, out: &mut impl Write, reply: &Reply) -> io::Result<()> {
        match reply {
            Reply::Usage(usage) => self.block(out, Color::Yellow, usage)?,
            Reply::Help(usage) => self.block(out, Color::Reset, usage)?,
            Reply::Accepted {
                task_id,
                specialization,
                command,
            } => self.line(
                out,
                Color::DarkGrey,
                &format!("[#{}] {} queued for the {} worker", task_id, command, specialization),
            )?,
            Reply::DispatchFailed(e) => self.line(out, Color::Red, &format!("error: {}", e))?,
            Reply::Status(workers) => self.status(out, workers)?,
            Reply::History(records) => self.history(out, records)?,
            Reply::Completed(result) => self.completed(out, result)?,
            Reply::Notice(text) => self.line(out, Color::Yellow, text)?,
            Reply::Quit => self.line(out, Color::DarkGrey, "bye")?,
        }
        out.flush()
    }

    fn completed(&self, out: &mut impl Write, result: &TaskResult) -> io::Result<()> {
        match result.status {
            ResultStatus::Success => {
                self.line(
                    out,
                    Color::Green,
                    &format!("[#{}] {} finished", result.task_id, result.specialization),
                )?;
                self.block(out, Color::Reset, &clean_output(&result.output))
            }
            ResultStatus::Error => self.line(
                out,
                Color::Red,
                &format!(
                    "[#{}] {} failed: {}",
                    result.task_id,
                    result.specialization,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            ),
        }
    }

    fn status(&self, out: &mut impl Write, workers: &[WorkerStatus]) -> io::Result<()> {
        if workers.is_empty() {
            return self.line(out, Color::Yellow, "no workers registered");
        }
        for w in workers {
            let (color, state) = if w.alive {
                (Color::Green, "up")
            } else {
                (Color::Red, "down")
            };
            self.line(
                out,
                color,
                &format!(
                    "{:<16} {:<5} last seen {:.1}s ago  in flight {}  done {}  failed {}  ({} {})",
                    w.specialization.as_str(),
                    state,
                    w.last_seen_age.as_secs_f64(),
                    w.in_flight,
                    w.completed,
                    w.failed,
                    w.name,
                    w.worker_id.simple(),
                ),
            )?;
        }
        Ok(())
    }

    fn history(&self, out: &mut impl Write, records: &[HistoryRecord]) -> io::Result<()> {
        if records.is_empty() {
            return self.line(out, Color::DarkGrey, "no history yet");
        }
        for record in records {
            let e = &record.entry;
            let color = match e.status {
                ResultStatus::Success => Color::Reset,
                ResultStatus::Error => Color::Red,
            };
            let cleaned = clean_output(&e.result);
            let first_line = cleaned.lines().next().unwrap_or_default();
            self.line(
                out,
                color,
                &format!(
                    "#{:<4} {} [{}] {} {} -> {}",
                    e.task_id,
                    record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    e.specialization,
                    e.command,
                    truncate(&e.payload, 40),
                    truncate(first_line, 60),
                ),
            )?;
        }
        Ok(())
    }

    fn line(&self, out: &mut impl Write, color: Color, text: &str) -> io::Result<()> {
        if self.color && color != Color::Reset {
            queue!(out, SetForegroundColor(color), Print(text), ResetColor)?;
        } else {
            queue!(out, Print(text))?;
        }
        queue!(out, Print(self.line_end))
    }

    fn block(&self, out: &mut impl Write, color: Color, text: &str) -> io::Result<()> {
        for line in text.lines() {
            self.line(out, color, line)?;
        }
        Ok(())
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
