//! Terminal output.
//!
//! The orchestrator runs on a blocking thread and reports through
//! [`Console`]; every line is written with a single `println!`/`eprintln!`
//! so lines from different threads never interleave.

use crossterm::style::Stylize;
use hearth_core::{Reporter, Stage};
use hearth_schema::{Artifact, ArtifactKind};

/// Plain status lines for one-shot commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct Output;

impl Output {
    pub fn new() -> Self {
        Self
    }

    pub fn success(&self, msg: &str) {
        println!("  {} {}", "✓".green(), msg);
    }

    pub fn info(&self, msg: &str) {
        println!("  {} {}", "•".dark_grey(), msg);
    }

    pub fn warning(&self, msg: &str) {
        eprintln!("  {} {}", "!".yellow(), msg.yellow());
    }

    pub fn error(&self, msg: &str) {
        eprintln!("  {} {}", "✗".red(), msg.red());
    }

    /// A `label value` detail row.
    pub fn field(&self, label: &str, value: &str) {
        println!("    {}{}", format!("{label:<12}").dark_grey(), value);
    }
}

/// [`Reporter`] that prints progress for an interactive install.
#[derive(Debug, Clone)]
pub struct Console {
    package: String,
    out: Output,
}

impl Console {
    pub fn new(package: &str) -> Self {
        Self {
            package: package.to_string(),
            out: Output::new(),
        }
    }
}

impl Reporter for Console {
    fn stage(&self, stage: Stage) {
        if stage.is_terminal() {
            return;
        }
        println!(
            "{} {} {}",
            "==>".cyan().bold(),
            stage_title(stage).bold(),
            self.package.as_str().dark_grey()
        );
    }

    fn installed(&self, artifact: &Artifact) {
        let kind = match artifact.kind {
            ArtifactKind::Executable => "bin",
            ArtifactKind::SharedFramework => "framework",
        };
        self.out.field(kind, &artifact.destination.display().to_string());
    }

    fn info(&self, msg: &str) {
        self.out.info(msg);
    }

    fn warning(&self, msg: &str) {
        self.out.warning(msg);
    }

    fn failed(&self, stage: Stage, reason: &str) {
        self.out.error(&format!("{} failed during {stage}", self.package));
        for line in reason.lines() {
            eprintln!("    {line}");
        }
    }

    fn done(&self, artifacts: &[Artifact], elapsed_secs: f64) {
        self.out.success(&format!(
            "Installed {} ({} artifacts) in {elapsed_secs:.1}s",
            self.package,
            artifacts.len()
        ));
    }
}

fn stage_title(stage: Stage) -> &'static str {
    match stage {
        Stage::Init => "Starting",
        Stage::Resolving => "Resolving dependencies",
        Stage::Building => "Building",
        Stage::Installing => "Installing",
        Stage::Patching => "Patching search paths",
        Stage::Signing => "Signing",
        Stage::Done => "Done",
        Stage::Failed => "Failed",
    }
}
