use crossterm::{
    cursor,
    event::{KeyCode, KeyEvent, KeyModifiers},
    queue,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use std::io::{self, Write};

pub const PROMPT: &str = "swarm> ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptAction {
    None,
    Submit(String),
    Quit,
}

/// Single-line editor for raw mode, with recall of earlier submissions.
#[derive(Debug, Default)]
pub struct PromptLine {
    input: Vec<char>,
    cursor_position: usize,
    recall: Vec<String>,
    recall_index: Option<usize>,
    stash: Vec<char>,
}

impl PromptLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        self.input.iter().collect()
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> PromptAction {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') | KeyCode::Char('d') if ctrl => {
                if self.input.is_empty() {
                    return PromptAction::Quit;
                }
                // Ctrl+C on a non-empty line just discards it.
                if key.code == KeyCode::Char('c') {
                    self.clear();
                }
            }
            KeyCode::Char('u') if ctrl => self.clear(),
            KeyCode::Char('a') if ctrl => self.cursor_position = 0,
            KeyCode::Char('e') if ctrl => self.cursor_position = self.input.len(),
            KeyCode::Char(c) if !ctrl => {
                self.input.insert(self.cursor_position, c);
                self.cursor_position += 1;
            }
            KeyCode::Backspace => {
                if self.cursor_position > 0 {
                    self.cursor_position -= 1;
                    self.input.remove(self.cursor_position);
                }
            }
            KeyCode::Delete => {
                if self.cursor_position < self.input.len() {
                    self.input.remove(self.cursor_position);
                }
            }
            KeyCode::Left => {
                if self.cursor_position > 0 {
                    self.cursor_position -= 1;
                }
            }
            KeyCode::Right => {
                if self.cursor_position < self.input.len() {
                    self.cursor_position += 1;
                }
            }
            KeyCode::Home => self.cursor_position = 0,
            KeyCode::End => self.cursor_position = self.input.len(),
            KeyCode::Up => self.recall_older(),
            KeyCode::Down => self.recall_newer(),
            KeyCode::Enter => {
                let line = self.text();
                self.clear();
                self.recall_index = None;
                if line.trim().is_empty() {
                    return PromptAction::None;
                }
                if self.recall.last() != Some(&line) {
                    self.recall.push(line.clone());
                }
                return PromptAction::Submit(line);
            }
            _ => {}
        }
        PromptAction::None
    }

    fn clear(&mut self) {
        self.input.clear();
        self.cursor_position = 0;
    }

    fn set_input(&mut self, text: Vec<char>) {
        self.cursor_position = text.len();
        self.input = text;
    }

    fn recall_older(&mut self) {
        if self.recall.is_empty() {
            return;
        }
        let index = match self.recall_index {
            None => {
                self.stash = self.input.clone();
                self.recall.len() - 1
            }
            Some(0) => 0,
            Some(i) => i - 1,
        };
        self.recall_index = Some(index);
        self.set_input(self.recall[index].chars().collect());
    }

    fn recall_newer(&mut self) {
        match self.recall_index {
            None => {}
            Some(i) if i + 1 < self.recall.len() => {
                self.recall_index = Some(i + 1);
                self.set_input(self.recall[i + 1].chars().collect());
            }
            Some(_) => {
                self.recall_index = None;
                let stash = std::mem::take(&mut self.stash);
                self.set_input(stash);
            }
        }
    }

    /// Repaints the prompt on the current terminal line.
    pub fn redraw(&self, out: &mut impl Write) -> io::Result<()> {
        queue!(
            out,
            cursor::MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            SetForegroundColor(Color::Cyan),
            Print(PROMPT),
            ResetColor,
            Print(self.text()),
            cursor::MoveToColumn((PROMPT.len() + self.cursor_position) as u16),
        )?;
        out.flush()
    }
}
