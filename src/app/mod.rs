pub mod session;

use anyhow::Result;
use crossterm::event::{self, Event, KeyEventKind};
use std::io::{self, Write};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::config::SwarmConfig;
use crate::ui::prompt::{PromptAction, PromptLine};
use crate::ui::simple::SimpleLayer;
use session::{Reply, Session};

/// How input reaches the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Raw-mode line editor on a terminal.
    Interactive,
    /// One command per stdin line, plain output.
    Lines,
    /// Run a single command and exit.
    Exec(String),
}

pub struct Application {
    session: Session,
    notices: Vec<Reply>,
    provider: String,
    model: String,
    /// Longest a task can take, plus slack for the round trip.
    drain_timeout: Duration,
}

impl Application {
    pub async fn new(config: &SwarmConfig) -> Result<Self> {
        let (session, notices) = Session::start(config).await?;
        Ok(Self {
            session,
            notices,
            provider: config.model.provider.to_string(),
            model: config.model.model.clone(),
            drain_timeout: Duration::from_secs(config.orchestrator.task_timeout_secs)
                + Duration::from_secs(config.orchestrator.shutdown_grace_secs),
        })
    }

    /// Runs until the user quits or input ends. Returns false when an
    /// `--exec` command was rejected or its task failed.
    pub async fn run(self, mode: Mode) -> Result<bool> {
        match mode {
            Mode::Interactive => self.run_interactive().await.map(|()| true),
            Mode::Lines => self.run_lines().await.map(|()| true),
            Mode::Exec(command) => self.run_exec(&command).await,
        }
    }

    async fn run_interactive(mut self) -> Result<()> {
        let layer = SimpleLayer::raw();
        let mut prompt = PromptLine::new();

        self.setup_terminal()?;
        let result = self.interactive_loop(&layer, &mut prompt).await;
        self.restore_terminal()?;
        result?;

        let mut out = io::stdout();
        for reply in self.session.shutdown().await {
            SimpleLayer::plain().render(&mut out, &reply)?;
        }
        Ok(())
    }

    async fn interactive_loop(&mut self, layer: &SimpleLayer, prompt: &mut PromptLine) -> Result<()> {
        let mut out = io::stdout();
        layer.banner(&mut out, &self.provider, &self.model)?;
        for notice in std::mem::take(&mut self.notices) {
            layer.render(&mut out, &notice)?;
        }
        prompt.redraw(&mut out)?;

        loop {
            // Check for results from the workers
            let arrived = self.session.poll().await;
            if !arrived.is_empty() {
                clear_prompt(&mut out)?;
                for reply in &arrived {
                    layer.render(&mut out, reply)?;
                }
                prompt.redraw(&mut out)?;
            }

            // Handle events with timeout to stay responsive
            if !event::poll(Duration::from_millis(50))? {
                continue;
            }
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }

            match prompt.handle_key(key) {
                PromptAction::None => prompt.redraw(&mut out)?,
                PromptAction::Quit => {
                    clear_prompt(&mut out)?;
                    layer.render(&mut out, &Reply::Quit)?;
                    return Ok(());
                }
                PromptAction::Submit(line) => {
                    // Leave the typed command on screen above the reply.
                    write!(out, "\r\n")?;
                    let reply = self.session.handle(&line).await;
                    layer.render(&mut out, &reply)?;
                    if matches!(reply, Reply::Quit) {
                        return Ok(());
                    }
                    prompt.redraw(&mut out)?;
                }
            }
        }
    }

    async fn run_lines(mut self) -> Result<()> {
        let mut out = io::stdout();
        for notice in std::mem::take(&mut self.notices) {
            SimpleLayer::plain().render(&mut out, &notice)?;
        }
        let input = BufReader::new(tokio::io::stdin());
        serve_lines(self.session, input, &mut out, self.drain_timeout).await
    }

    async fn run_exec(mut self, command: &str) -> Result<bool> {
        let mut out = io::stdout();
        let mut err = io::stderr();
        for notice in std::mem::take(&mut self.notices) {
            SimpleLayer::plain().render(&mut err, &notice)?;
        }
        exec_command(self.session, command, &mut out, &mut err, self.drain_timeout).await
    }

    fn setup_terminal(&self) -> Result<()> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(())
    }

    fn restore_terminal(&self) -> Result<()> {
        crossterm::terminal::disable_raw_mode()?;
        Ok(())
    }
}

/// Feeds one command per input line to `session` and prints every reply.
/// Once input ends, waits up to `drain_timeout` for outstanding tasks
/// before stopping the workers.
async fn serve_lines<R, W>(
    mut session: Session,
    input: R,
    out: &mut W,
    drain_timeout: Duration,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let layer = SimpleLayer::plain();
    let mut lines = input.lines();
    let mut tick = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("end of input");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = session.handle(&line).await;
                layer.render(out, &reply)?;
                if matches!(reply, Reply::Quit) {
                    break;
                }
            }
            _ = tick.tick() => {
                for reply in session.poll().await {
                    layer.render(out, &reply)?;
                }
            }
        }
    }

    if session.pending() > 0 {
        info!(pending = session.pending(), "waiting for outstanding tasks");
    }
    for reply in session.wait_idle(drain_timeout).await {
        layer.render(out, &reply)?;
    }
    for reply in session.shutdown().await {
        layer.render(out, &reply)?;
    }
    Ok(())
}

/// Runs a single command. Returns false when it was rejected, could not be
/// dispatched or its task failed.
async fn exec_command(
    mut session: Session,
    command: &str,
    out: &mut impl Write,
    err: &mut impl Write,
    drain_timeout: Duration,
) -> Result<bool> {
    let layer = SimpleLayer::plain();

    let reply = session.handle(command).await;
    let mut ok = !matches!(reply, Reply::Usage(_) | Reply::DispatchFailed(_));
    match reply {
        Reply::Accepted { .. } => {
            let mut results = session.wait_idle(drain_timeout).await;
            results.extend(session.shutdown().await);
            for reply in &results {
                if let Reply::Completed(result) = reply {
                    ok &= result.is_success();
                }
                layer.render(out, reply)?;
            }
            return Ok(ok);
        }
        Reply::Usage(_) | Reply::DispatchFailed(_) => layer.render(err, &reply)?,
        other => layer.render(out, &other)?,
    }

    session.shutdown().await;
    Ok(ok)
}

fn clear_prompt(out: &mut impl Write) -> io::Result<()> {
    crossterm::queue!(
        out,
        crossterm::cursor::MoveToColumn(0),
        crossterm::terminal::Clear(crossterm::terminal::ClearType::CurrentLine)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::orchestrator::{Orchestrator, OrchestratorSettings};
    use crate::agents::testing::{EchoAgent, FailingAgent, SlowAgent};
    use crate::agents::worker::WorkerSettings;
    use crate::agents::{Agent, Specialization};
    use crate::history::MemoryHistory;
    use std::sync::Arc;

    const DRAIN: Duration = Duration::from_secs(5);

    async fn session(agents: Vec<Arc<dyn Agent>>) -> Session {
        let orchestrator = Orchestrator::spawn(
            agents,
            WorkerSettings::default(),
            Box::new(MemoryHistory::new()),
            OrchestratorSettings {
                shutdown_grace: Duration::from_millis(200),
                ..OrchestratorSettings::default()
            },
        )
        .await;
        Session::new(orchestrator, 10).await.unwrap()
    }

    async fn exec(agents: Vec<Arc<dyn Agent>>, command: &str) -> (bool, String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let ok = exec_command(session(agents).await, command, &mut out, &mut err, DRAIN)
            .await
            .unwrap();
        (
            ok,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_exec_rejected_command_fails() {
        let (ok, out, err) = exec(
            vec![Arc::new(EchoAgent(Specialization::CodeGeneration))],
            "banana",
        )
        .await;
        assert!(!ok);
        assert!(out.is_empty());
        assert!(err.contains("generate function"));
    }

    #[tokio::test]
    async fn test_exec_dispatch_failure_fails() {
        let (ok, _, err) = exec(
            vec![Arc::new(EchoAgent(Specialization::CodeGeneration))],
            "debug syntax x = (",
        )
        .await;
        assert!(!ok);
        assert!(err.contains("no worker registered for debugging tasks"));
    }

    #[tokio::test]
    async fn test_exec_failed_task_fails() {
        let (ok, out, _) = exec(
            vec![Arc::new(FailingAgent(Specialization::CodeGeneration))],
            "generate function add",
        )
        .await;
        assert!(!ok);
        assert!(out.contains("[#1] code-generation failed: connection refused"));
    }

    #[tokio::test]
    async fn test_exec_successful_task_succeeds() {
        let (ok, out, err) = exec(
            vec![Arc::new(EchoAgent(Specialization::CodeGeneration))],
            "generate function add",
        )
        .await;
        assert!(ok);
        assert!(out.contains("[#1] code-generation finished"));
        assert!(out.contains("echo: add"));
        assert!(err.is_empty());
    }

    #[tokio::test]
    async fn test_exec_utility_command_succeeds() {
        let agents = || -> Vec<Arc<dyn Agent>> {
            vec![Arc::new(EchoAgent(Specialization::CodeGeneration))]
        };

        let (ok, out, _) = exec(agents(), "status").await;
        assert!(ok);
        assert!(out.contains("code-generation"));

        let (ok, out, _) = exec(agents(), "history").await;
        assert!(ok);
        assert!(out.contains("no history yet"));
    }

    #[tokio::test]
    async fn test_lines_wait_for_tasks_still_running_at_end_of_input() {
        let agent = Arc::new(SlowAgent(
            Specialization::CodeGeneration,
            Duration::from_millis(300),
        ));
        let input: &[u8] = b"generate code one\n\n   \ngenerate code two\n";
        let mut out = Vec::new();

        serve_lines(session(vec![agent]).await, input, &mut out, DRAIN)
            .await
            .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("[#1] generate code queued"));
        assert!(out.contains("[#2] generate code queued"));
        assert!(out.contains("[#1] code-generation finished"));
        assert!(out.contains("[#2] code-generation finished"));
        assert!(out.contains("echo: two"));
        assert!(!out.contains("failed"));
    }

    #[tokio::test]
    async fn test_lines_stop_reading_at_quit() {
        let input: &[u8] = b"quit\ngenerate code ignored\n";
        let mut out = Vec::new();

        serve_lines(
            session(vec![Arc::new(EchoAgent(Specialization::CodeGeneration))]).await,
            input,
            &mut out,
            DRAIN,
        )
        .await
        .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("bye"));
        assert!(!out.contains("queued"));
    }
}
