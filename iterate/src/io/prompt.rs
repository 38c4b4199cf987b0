//! Prompt rendering for iteration and verification sessions.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::types::{Depth, Mode};

const TEMPLATES: &[(&str, &str)] = &[
    ("iterate_loop", include_str!("prompts/iterate_loop.md")),
    ("iterate_iterative", include_str!("prompts/iterate_iterative.md")),
    ("verify_header", include_str!("prompts/verify_header.md")),
    ("verify_footer", include_str!("prompts/verify_footer.md")),
    ("verify_quick", include_str!("prompts/verify_quick.md")),
    ("verify_standard", include_str!("prompts/verify_standard.md")),
    ("verify_deep", include_str!("prompts/verify_deep.md")),
];

/// Inputs for one work session prompt.
#[derive(Debug, Clone)]
pub struct IterationPrompt<'a> {
    pub workspace: &'a str,
    pub mode: Mode,
    pub iteration: u32,
    pub max_iterations: u32,
    pub instructions: &'a str,
    pub todo_path: &'a Path,
    pub status_path: &'a Path,
    pub completion_marker: &'a str,
    /// Remaining count seen after the previous session.
    pub remaining: Option<u32>,
}

/// Inputs for one verification session prompt.
#[derive(Debug, Clone)]
pub struct VerifyPrompt<'a> {
    pub workspace: &'a str,
    pub depth: Depth,
    /// The instructions as the user wrote them, without resume findings.
    pub instructions: &'a str,
    pub todo_path: &'a Path,
    pub report_path: &'a Path,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for &(name, source) in TEMPLATES {
            env.add_template(name, source)
                .with_context(|| format!("load prompt template {name}"))?;
        }
        Ok(Self { env })
    }

    pub fn render_iteration(&self, input: &IterationPrompt<'_>) -> Result<String> {
        let name = match input.mode {
            Mode::Loop => "iterate_loop",
            Mode::Iterative => "iterate_iterative",
        };
        let rendered = self
            .env
            .get_template(name)?
            .render(context! {
                workspace => input.workspace,
                iteration => input.iteration,
                max_iterations => input.max_iterations,
                instructions => input.instructions.trim(),
                todo_path => input.todo_path.display().to_string(),
                status_path => input.status_path.display().to_string(),
                completion_marker => input.completion_marker,
                remaining => input.remaining,
            })
            .with_context(|| format!("render {name} prompt"))?;
        debug!(template = name, bytes = rendered.len(), "rendered iteration prompt");
        Ok(rendered)
    }

    pub fn render_verify(&self, input: &VerifyPrompt<'_>) -> Result<String> {
        let name = format!("verify_{}", input.depth.as_str());
        let rendered = self
            .env
            .get_template(&name)?
            .render(context! {
                workspace => input.workspace,
                instructions => input.instructions.trim(),
                todo_path => input.todo_path.display().to_string(),
                report_path => input.report_path.display().to_string(),
            })
            .with_context(|| format!("render {name} prompt"))?;
        debug!(template = %name, bytes = rendered.len(), "rendered verification prompt");
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iteration(mode: Mode, remaining: Option<u32>) -> String {
        let engine = PromptEngine::new().expect("engine");
        engine
            .render_iteration(&IterationPrompt {
                workspace: "demo",
                mode,
                iteration: 3,
                max_iterations: 10,
                instructions: "  Build the exporter.\n",
                todo_path: Path::new("/ws/TODO.md"),
                status_path: Path::new("/ws/.status.json"),
                completion_marker: "TASK COMPLETE",
                remaining,
            })
            .expect("render")
    }

    #[test]
    fn loop_prompt_names_marker_and_progress_files() {
        let prompt = iteration(Mode::Loop, Some(4));
        assert!(prompt.contains("session 3 of at most 10"));
        assert!(prompt.contains("Build the exporter."));
        assert!(prompt.contains("**Remaining**: N"));
        assert!(prompt.contains("TASK COMPLETE"));
        assert!(prompt.contains("/ws/TODO.md"));
        assert!(prompt.contains("last recorded remaining count was 4"));
    }

    #[test]
    fn iterative_prompt_asks_for_checklist_and_omits_unknown_count() {
        let prompt = iteration(Mode::Iterative, None);
        assert!(prompt.contains("- [ ] item"));
        assert!(!prompt.contains("last recorded count"));
    }

    #[test]
    fn each_depth_renders_its_own_review_with_report_path() {
        let engine = PromptEngine::new().expect("engine");
        let mut seen = Vec::new();
        for depth in [Depth::Quick, Depth::Standard, Depth::Deep] {
            let prompt = engine
                .render_verify(&VerifyPrompt {
                    workspace: "demo",
                    depth,
                    instructions: "Build the exporter.",
                    todo_path: Path::new("/ws/TODO.md"),
                    report_path: Path::new("/ws/verification-report.md"),
                })
                .expect("render");
            assert!(prompt.contains("/ws/verification-report.md"));
            assert!(prompt.contains("❌ INCOMPLETE"));
            assert!(prompt.contains("Build the exporter."));
            seen.push(prompt);
        }
        seen.dedup();
        assert_eq!(seen.len(), 3);
    }
}
