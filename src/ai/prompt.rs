//! Prompt construction and reply parsing for test generation

use std::path::Path;

use super::providers::Prompt;
use crate::agent::GenerationContext;

const SYSTEM_PROMPT: &str = "You are an expert software engineer writing unit tests. \
You only answer with test code that can be appended verbatim to an existing test file.";

/// Language of a file, guessed from its extension
pub fn detect_language(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("py") => "python",
        Some("js" | "jsx" | "mjs" | "cjs") => "javascript",
        Some("ts" | "tsx") => "typescript",
        Some("rs") => "rust",
        Some("go") => "go",
        Some("java") => "java",
        _ => "unknown",
    }
}

/// Build the generation prompt for one iteration
pub fn build_generation_prompt(ctx: &GenerationContext<'_>, additional_instructions: &str) -> Prompt {
    let language = detect_language(ctx.source_file);

    let numbered_source: String = ctx
        .source_code
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{} {}\n", i + 1, line))
        .collect();

    let mut user = format!(
        "## Source file: {source_name} ({language})\n\
         Each line is prefixed with its line number.\n```\n{numbered_source}```\n\n\
         ## Existing test file: {test_name}\n```\n{test_code}\n```\n\n\
         ## Current coverage\n{coverage:.2}% of lines are covered.\n",
        source_name = ctx.source_file.display(),
        test_name = ctx.test_file.display(),
        test_code = ctx.test_code,
        coverage = ctx.coverage * 100.0,
    );

    if !ctx.missed_lines.is_empty() {
        let lines: Vec<String> = ctx.missed_lines.iter().map(|l| l.to_string()).collect();
        user.push_str(&format!("Lines not yet covered: {}\n", lines.join(", ")));
    }

    if !ctx.failed_attempts.is_empty() {
        user.push_str("\n## Previously rejected tests\nDo not repeat these.\n");
        for failed in ctx.failed_attempts {
            user.push_str(&format!("```\n{}\n```\nRejected because: {}\n", failed.code.trim_end(), failed.reason));
            if !failed.error_excerpt.is_empty() {
                user.push_str(&format!("Test output:\n{}\n", failed.error_excerpt));
            }
            user.push('\n');
        }
    }

    user.push_str(&format!(
        "\n## Task\nWrite up to {max} new {language} tests that exercise the uncovered lines. \
         Put each test in its own fenced code block. Each block must be self-contained and \
         valid when appended to the end of the existing test file: do not repeat imports or \
         fixtures that already exist there, and do not rewrite existing tests.\n",
        max = ctx.max_tests,
    ));

    if !additional_instructions.trim().is_empty() {
        user.push_str(&format!("\n## Additional instructions\n{}\n", additional_instructions.trim()));
    }

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Split a model reply into candidate tests
///
/// Every fenced code block is one candidate. A reply without fences is taken
/// as a single candidate. At most `max` candidates are returned.
pub fn extract_candidates(response: &str, max: usize) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in response.lines() {
        if line.trim_start().starts_with("```") {
            match current.take() {
                Some(body) => {
                    let code = body.join("\n");
                    if !code.trim().is_empty() {
                        blocks.push(code.trim_end().to_string() + "\n");
                    }
                }
                None => current = Some(Vec::new()),
            }
        } else if let Some(body) = current.as_mut() {
            body.push(line);
        }
    }

    if blocks.is_empty() && current.is_none() {
        let trimmed = response.trim();
        if !trimmed.is_empty() {
            blocks.push(format!("{}\n", trimmed));
        }
    }

    blocks.truncate(max);
    blocks
}
