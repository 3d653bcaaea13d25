//! Parsing of the one-line command language typed at the prompt.

use crate::agents::{DebugFocus, GenerateTarget, TaskKind, TaskRequest};

/// Printed for every line that is not a valid command.
pub const USAGE: &str = "\
Usage:
  generate function <description>   generate a function
  generate class <description>      generate a class
  generate code <description>       generate a program or snippet
  debug syntax <code>               check code for syntax errors
  debug logic <code>                check code for logic errors and edge cases
  debug code <code>                 review code for any issues
  status                            show worker health
  history [limit]                   show recent tasks
  help                              show this message
  quit | exit                       leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Generate { target: GenerateTarget, payload: String },
    Debug { focus: DebugFocus, payload: String },
    Help,
    Status,
    History { limit: Option<usize> },
    Quit,
}

impl Command {
    /// The task this command asks for, if it is not a utility command.
    pub fn into_request(self) -> Option<TaskRequest> {
        match self {
            Command::Generate { target, payload } => {
                Some(TaskRequest::new(TaskKind::Generate(target), payload))
            }
            Command::Debug { focus, payload } => {
                Some(TaskRequest::new(TaskKind::Debug(focus), payload))
            }
            _ => None,
        }
    }
}

/// A line that did not parse. Always carries [`USAGE`] and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection;

impl Rejection {
    pub fn usage(&self) -> &'static str {
        USAGE
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(USAGE)
    }
}

impl std::error::Error for Rejection {}

/// Splits off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

pub fn parse(line: &str) -> Result<Command, Rejection> {
    let (command, rest) = split_word(line.trim());

    match command.to_ascii_lowercase().as_str() {
        "generate" => {
            let (sub, payload) = split_word(rest);
            let target = match sub.to_ascii_lowercase().as_str() {
                "function" => GenerateTarget::Function,
                "class" => GenerateTarget::Class,
                "code" => GenerateTarget::Code,
                _ => return Err(Rejection),
            };
            Ok(Command::Generate {
                target,
                payload: non_empty(payload)?,
            })
        }
        "debug" => {
            let (sub, payload) = split_word(rest);
            let focus = match sub.to_ascii_lowercase().as_str() {
                "syntax" => DebugFocus::Syntax,
                "logic" => DebugFocus::Logic,
                "code" => DebugFocus::Code,
                _ => return Err(Rejection),
            };
            Ok(Command::Debug {
                focus,
                payload: non_empty(payload)?,
            })
        }
        "help" if rest.is_empty() => Ok(Command::Help),
        "status" if rest.is_empty() => Ok(Command::Status),
        "quit" | "exit" if rest.is_empty() => Ok(Command::Quit),
        "history" => {
            if rest.is_empty() {
                return Ok(Command::History { limit: None });
            }
            // `usize::from_str` also takes a leading `+`.
            if !rest.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Rejection);
            }
            match rest.parse::<usize>() {
                Ok(n) if n > 0 => Ok(Command::History { limit: Some(n) }),
                _ => Err(Rejection),
            }
        }
        _ => Err(Rejection),
    }
}

fn non_empty(payload: &str) -> Result<String, Rejection> {
    let payload = payload.trim();
    if payload.is_empty() {
        Err(Rejection)
    } else {
        Ok(payload.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Specialization;

    #[test]
    fn test_generate_commands() {
        assert_eq!(
            parse("generate function add_two_numbers"),
            Ok(Command::Generate {
                target: GenerateTarget::Function,
                payload: "add_two_numbers".to_string(),
            })
        );
        assert_eq!(
            parse("  GENERATE Class   file logger with   rotation "),
            Ok(Command::Generate {
                target: GenerateTarget::Class,
                payload: "file logger with   rotation".to_string(),
            })
        );
    }

    #[test]
    fn test_debug_payload_is_kept_verbatim() {
        assert_eq!(
            parse("debug syntax def f(: pass"),
            Ok(Command::Debug {
                focus: DebugFocus::Syntax,
                payload: "def f(: pass".to_string(),
            })
        );
    }

    #[test]
    fn test_commands_map_to_their_specialization() {
        let request = parse("generate code hello world").unwrap().into_request().unwrap();
        assert_eq!(request.kind.specialization(), Specialization::CodeGeneration);

        let request = parse("debug logic x = 1 / 0").unwrap().into_request().unwrap();
        assert_eq!(request.kind.specialization(), Specialization::Debugging);
        assert_eq!(request.payload, "x = 1 / 0");
    }

    #[test]
    fn test_utility_commands() {
        assert_eq!(parse("help"), Ok(Command::Help));
        assert_eq!(parse("Status"), Ok(Command::Status));
        assert_eq!(parse("history"), Ok(Command::History { limit: None }));
        assert_eq!(parse("history 5"), Ok(Command::History { limit: Some(5) }));
        assert_eq!(parse("quit"), Ok(Command::Quit));
        assert_eq!(parse("exit"), Ok(Command::Quit));
        assert!(parse("status").unwrap().into_request().is_none());
    }

    #[test]
    fn test_everything_else_is_rejected_the_same_way() {
        let bad = [
            "",
            "   ",
            "banana",
            "generate",
            "generate function",
            "generate function    ",
            "generate method foo",
            "generate functionfoo",
            "debug",
            "debug style x = 1",
            "history 0",
            "history -1",
            "history ten",
            "history 1 2",
            "history +5",
            "history 5.0",
            "history 99999999999999999999999",
            "help me",
            "quit now",
            "gen function foo",
        ];
        for line in bad {
            let err = parse(line).unwrap_err();
            assert_eq!(err.usage(), USAGE, "line {:?}", line);
            assert_eq!(err.to_string(), USAGE);
        }
    }
}
