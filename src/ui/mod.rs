pub mod prompt;
pub mod simple;

use regex::Regex;
use std::sync::OnceLock;

fn think_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"))
}

fn fence_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*```[\w+-]*[ \t]*$\n?").expect("valid regex"))
}

/// Strips reasoning blocks and markdown code fences from model output so
/// the code itself is what reaches the terminal.
pub fn clean_output(text: &str) -> String {
    let without_think = think_block().replace_all(text, "");
    let without_fences = fence_line().replace_all(&without_think, "");
    without_fences.trim().to_string()
}
