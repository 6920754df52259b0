//! Parsing of LM output: fenced code regions and the final-answer sentinel.
//!
//! Fences are triple backticks, optionally with a language tag; every
//! fenced region is treated as executable regardless of tag. Nested fences
//! are not supported, the outermost fence wins. The sentinel is a line
//! starting with `FINAL_ANSWER:` outside any fence; the answer runs to the
//! end of the message unless another fence begins. When a response carries
//! more than one sentinel, the first wins.

use std::sync::LazyLock;

use regex::Regex;

static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*```\S*\s*$").unwrap());
static FENCE_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*```\s*$").unwrap());
static SENTINEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*FINAL_ANSWER:\s?(.*)$").unwrap());

/// A final answer detected in an LM response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalAnswer {
    /// The answer text, trimmed.
    pub text: String,
    /// How many code regions appear before the sentinel.
    pub preceding_blocks: usize,
}

impl FinalAnswer {
    /// True when the sentinel appeared before the first code region.
    pub fn before_code(&self) -> bool {
        self.preceding_blocks == 0
    }
}

/// The parsed structure of one LM response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Fenced code regions, in document order.
    pub code_blocks: Vec<String>,
    /// The first final-answer sentinel, if present.
    pub final_answer: Option<FinalAnswer>,
}

/// Parse an LM response into code regions and an optional final answer.
pub fn parse_response(text: &str) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();
    let mut in_fence = false;
    let mut current = String::new();
    let mut answer_lines: Option<Vec<String>> = None;
    let mut answer_blocks = 0usize;

    for line in text.lines() {
        if in_fence {
            if FENCE_CLOSE.is_match(line) {
                in_fence = false;
                parsed.code_blocks.push(std::mem::take(&mut current));
            } else {
                current.push_str(line);
                current.push('\n');
            }
            continue;
        }

        if FENCE_OPEN.is_match(line) {
            // A fence terminates a running answer.
            if let Some(lines) = answer_lines.take() {
                finish_answer(&mut parsed, lines, answer_blocks);
            }
            in_fence = true;
            continue;
        }

        if let Some(ref mut lines) = answer_lines {
            lines.push(line.to_string());
            continue;
        }

        if parsed.final_answer.is_none() {
            if let Some(captures) = SENTINEL.captures(line) {
                answer_blocks = parsed.code_blocks.len();
                answer_lines = Some(vec![captures[1].to_string()]);
            }
        }
    }

    // An unterminated fence still counts as a region, outermost fence wins.
    if in_fence && !current.is_empty() {
        parsed.code_blocks.push(current);
    }
    if let Some(lines) = answer_lines.take() {
        finish_answer(&mut parsed, lines, answer_blocks);
    }

    parsed
}

fn finish_answer(parsed: &mut ParsedResponse, lines: Vec<String>, preceding_blocks: usize) {
    if parsed.final_answer.is_some() {
        return;
    }
    let text = lines.join("\n").trim().to_string();
    if !text.is_empty() {
        parsed.final_answer = Some(FinalAnswer {
            text,
            preceding_blocks,
        });
    }
}
