//! A provider that never touches the network. Generation requests get a
//! Python skeleton named after the payload; debugging requests get a review
//! from a handful of static checks. Useful when no model server is running
//! and as a deterministic stand-in during tests.

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LLMProvider, ProviderError, TaskContext};
use crate::agents::{DebugFocus, GenerateTarget, TaskKind};

#[derive(Debug, Default, Clone)]
pub struct OfflineProvider;

impl OfflineProvider {
    pub fn new() -> Self {
        Self
    }

    fn respond(&self, request: &CompletionRequest) -> String {
        match &request.task {
            Some(TaskContext { kind: TaskKind::Generate(target), payload }) => {
                generate(*target, payload)
            }
            Some(TaskContext { kind: TaskKind::Debug(focus), payload }) => review(*focus, payload),
            None => {
                let prompt = request.prompt();
                let excerpt: String = prompt.chars().take(50).collect();
                format!(
                    "# offline response for model '{}'\n# prompt: '{}...'",
                    request.model, excerpt
                )
            }
        }
    }
}

#[async_trait]
impl LLMProvider for OfflineProvider {
    fn name(&self) -> &str {
        "offline"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        Ok(CompletionResponse {
            content: self.respond(&request),
            model: request.model,
            usage: None,
        })
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn generate(target: GenerateTarget, payload: &str) -> String {
    match target {
        GenerateTarget::Function => {
            let name = snake_case(payload);
            format!(
                "def {name}(*args, **kwargs):\n    \"\"\"{payload}\"\"\"\n    raise NotImplementedError(\"{name} needs a model server to be generated\")\n"
            )
        }
        GenerateTarget::Class => {
            let name = camel_case(payload);
            format!(
                "class {name}:\n    \"\"\"{payload}\"\"\"\n\n    def __init__(self) -> None:\n        pass\n"
            )
        }
        GenerateTarget::Code => {
            format!(
                "# {payload}\n\n\ndef main() -> None:\n    print(\"{}\")\n\n\nif __name__ == \"__main__\":\n    main()\n",
                payload.replace('"', "'")
            )
        }
    }
}

fn review(focus: DebugFocus, code: &str) -> String {
    let mut findings = Vec::new();
    if matches!(focus, DebugFocus::Syntax | DebugFocus::Code) {
        findings.extend(syntax_findings(code));
    }
    if matches!(focus, DebugFocus::Logic | DebugFocus::Code) {
        findings.extend(logic_findings(code));
    }

    let mut out = String::from("Offline review (static checks only):\n");
    if findings.is_empty() {
        out.push_str("- No issues found.");
    } else {
        let lines: Vec<String> = findings.iter().map(|f| format!("- {}", f)).collect();
        out.push_str(&lines.join("\n"));
    }
    out
}

const BLOCK_KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "else", "for", "while", "try", "except", "finally", "with",
];

fn syntax_findings(code: &str) -> Vec<String> {
    let mut findings = Vec::new();

    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut quote: Option<char> = None;
    for (col, ch) in code.chars().enumerate() {
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' | '[' | '{' => stack.push((ch, col + 1)),
            ')' | ']' | '}' => {
                let expected = match ch {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, at)) => findings.push(format!(
                        "'{}' at column {} closes '{}' opened at column {}",
                        ch,
                        col + 1,
                        open,
                        at
                    )),
                    None => findings.push(format!("unmatched '{}' at column {}", ch, col + 1)),
                }
            }
            _ => {}
        }
    }
    if let Some(open) = quote {
        findings.push(format!("unterminated string starting with {}", open));
    }
    for (open, at) in stack {
        findings.push(format!("'{}' opened at column {} is never closed", open, at));
    }

    for statement in code.split(['\n', ';']) {
        let trimmed = statement.trim();
        let keyword = trimmed
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .next()
            .unwrap_or_default();
        if BLOCK_KEYWORDS.contains(&keyword) && !trimmed.contains(':') {
            findings.push(format!("'{}' statement is missing a ':'", keyword));
        }
    }

    findings
}

fn logic_findings(code: &str) -> Vec<String> {
    let mut findings = Vec::new();
    let compact: String = code.split_whitespace().collect::<Vec<_>>().join(" ");

    if compact.contains("while True") && !compact.contains("break") && !compact.contains("return") {
        findings.push("'while True' loop has no break or return and never ends".to_string());
    }
    if compact.contains("== None") || compact.contains("!= None") {
        findings.push("compare with None using 'is' / 'is not'".to_string());
    }
    if compact.contains("/ 0") || compact.contains("/0") {
        findings.push("division by a literal zero".to_string());
    }
    if compact.contains("except:") {
        findings.push("bare 'except:' also swallows KeyboardInterrupt and SystemExit".to_string());
    }
    if compact.contains("=[]") || compact.contains("= [])") || compact.contains("=[])") {
        findings.push("mutable default argument is shared between calls".to_string());
    }

    findings
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect()
}

fn snake_case(text: &str) -> String {
    let name = words(text).join("_");
    match name.chars().next() {
        None => "generated".to_string(),
        Some(c) if c.is_ascii_digit() => format!("_{}", name),
        Some(_) => name,
    }
}

fn camel_case(text: &str) -> String {
    let name: String = words(text)
        .iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    match name.chars().next() {
        None => "Generated".to_string(),
        Some(c) if c.is_ascii_digit() => format!("_{}", name),
        Some(_) => name,
    }
}
