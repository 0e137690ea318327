//! Install orchestration.
//!
//! An [`Orchestrator`] drives one install run through a fixed sequence of
//! stages:
//!
//! ```text
//! Init → Resolving → Building → Installing → Patching → Signing → Done
//!                                                    ↘ Failed (from any)
//! ```
//!
//! Stages run strictly in order on the calling thread. The first error moves
//! the run to [`Stage::Failed`] and skips everything after it. The
//! orchestrator is consumed by [`Orchestrator::run`], so a run cannot be
//! resumed or replayed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hearth_schema::{Artifact, BuildConfig, PackageSpec};
use thiserror::Error;
use tracing::{info, warn};

use crate::builder::{BuildFailure, BuildInvoker, BuildTool, tool_for};
use crate::installer::{InstallIoError, InstallLayout, Installer};
use crate::lock::InstallLock;
use crate::patcher::{PatchError, PatchOutcome, patch_file};
use crate::process::CancelToken;
use crate::receipt::InstallReceipt;
use crate::reporter::{NullReporter, Reporter};
use crate::resolver::{DependencySource, PathSource, ResolvedDependency, UnresolvedDependency, resolve};
use crate::signer::{SignError, SignTool, platform_default};

/// A step of an install run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Nothing has happened yet.
    Init,
    /// Resolving dependencies.
    Resolving,
    /// Running the build tool.
    Building,
    /// Copying artifacts into the install tree.
    Installing,
    /// Rewriting search paths in installed executables.
    Patching,
    /// Signing installed executables.
    Signing,
    /// Finished successfully.
    Done,
    /// Stopped by an error.
    Failed,
}

impl Stage {
    /// Lowercase stage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Resolving => "resolving",
            Self::Building => "building",
            Self::Installing => "installing",
            Self::Patching => "patching",
            Self::Signing => "signing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// `Done` and `Failed` end a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// The stage that follows on success.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Init => Some(Self::Resolving),
            Self::Resolving => Some(Self::Building),
            Self::Building => Some(Self::Installing),
            Self::Installing => Some(Self::Patching),
            Self::Patching => Some(Self::Signing),
            Self::Signing => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error that stopped a run.
#[derive(Error, Debug)]
pub enum StageError {
    /// Dependency resolution failed.
    #[error(transparent)]
    Resolve(#[from] UnresolvedDependency),
    /// The build failed.
    #[error(transparent)]
    Build(#[from] BuildFailure),
    /// Installing failed.
    #[error(transparent)]
    Install(#[from] InstallIoError),
    /// Patching failed.
    #[error("{}: {source}", .path.display())]
    Patch {
        /// Installed file being patched.
        path: PathBuf,
        /// Underlying error.
        source: PatchError,
    },
    /// Signing failed.
    #[error(transparent)]
    Sign(#[from] SignError),
    /// The run was cancelled between stages.
    #[error("Install cancelled")]
    Cancelled,
}

/// Outcome of a run: what was installed or why it stopped, plus every stage
/// entered, in order.
#[derive(Debug)]
pub struct InstallResult {
    outcome: Result<Vec<Artifact>, (Stage, StageError)>,
    stages: Vec<Stage>,
    dependencies: Vec<ResolvedDependency>,
    elapsed: Duration,
}

impl InstallResult {
    /// Whether the run reached `Done`.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Final stage: `Done` or `Failed`.
    pub fn final_stage(&self) -> Stage {
        if self.is_success() { Stage::Done } else { Stage::Failed }
    }

    /// Installed artifacts; empty on failure.
    pub fn artifacts(&self) -> &[Artifact] {
        self.outcome.as_deref().unwrap_or(&[])
    }

    /// The failing stage and its error.
    pub fn failure(&self) -> Option<(Stage, &StageError)> {
        self.outcome.as_ref().err().map(|(stage, err)| (*stage, err))
    }

    /// Every stage entered, starting with `Init` and ending with `Done` or
    /// `Failed`.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Dependencies resolved before the run ended.
    pub fn dependencies(&self) -> &[ResolvedDependency] {
        &self.dependencies
    }

    /// Wall-clock duration of the run.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Convert into a `Result`, dropping the stage history.
    ///
    /// # Errors
    ///
    /// Returns the failing stage and its error.
    pub fn into_result(self) -> Result<Vec<Artifact>, (Stage, StageError)> {
        self.outcome
    }
}

type StageResult<T> = Result<T, (Stage, StageError)>;

/// Drives one install run. See the module docs.
pub struct Orchestrator {
    spec: PackageSpec,
    config: BuildConfig,
    source_dir: PathBuf,
    layout: InstallLayout,
    sources: Vec<Box<dyn DependencySource>>,
    build_tool: Box<dyn BuildTool>,
    sign_tool: Box<dyn SignTool>,
    reporter: Box<dyn Reporter>,
    log_path: PathBuf,
    receipt_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    cancel: CancelToken,
    stage: Stage,
    stages: Vec<Stage>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("package", self.spec.name())
            .field("source_dir", &self.source_dir)
            .field("layout", &self.layout)
            .field("build_tool", &self.build_tool.name())
            .field("sign_tool", &self.sign_tool.name())
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// A run for `spec` building in `source_dir` and installing into
    /// `layout`.
    ///
    /// Defaults: the package's own build options and build system, tools on
    /// `PATH` as the only dependency source, the platform's signer, no
    /// timeout, no receipt, and a build log inside the build output folder.
    pub fn new(spec: PackageSpec, source_dir: impl Into<PathBuf>, layout: InstallLayout) -> Self {
        let source_dir = source_dir.into();
        let config = spec.build().clone();
        let build_tool = tool_for(spec.build_system());
        let log_path = source_dir.join(&config.output_folder).join("hearth-build.log");
        Self {
            spec,
            config,
            source_dir,
            layout,
            sources: vec![Box::new(PathSource)],
            build_tool,
            sign_tool: platform_default(),
            reporter: Box::new(NullReporter),
            log_path,
            receipt_dir: None,
            timeout: None,
            cancel: CancelToken::new(),
            stage: Stage::Init,
            stages: Vec::new(),
        }
    }

    /// Build with `config` instead of the package's declared options.
    pub fn with_config(mut self, config: BuildConfig) -> Self {
        self.config = config;
        self
    }

    /// Dependency sources, tried in order.
    pub fn with_sources(mut self, sources: Vec<Box<dyn DependencySource>>) -> Self {
        self.sources = sources;
        self
    }

    /// Replace the build tool selected by the package.
    pub fn with_build_tool(mut self, tool: Box<dyn BuildTool>) -> Self {
        self.build_tool = tool;
        self
    }

    /// Replace the platform signer.
    pub fn with_sign_tool(mut self, tool: Box<dyn SignTool>) -> Self {
        self.sign_tool = tool;
        self
    }

    /// Progress sink.
    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    /// Where build output is logged.
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    /// Write an install receipt into `dir` after a successful run.
    pub fn with_receipt_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.receipt_dir = Some(dir.into());
        self
    }

    /// Kill the build after `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abort the run when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build log location.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Execute every stage and report the outcome.
    pub fn run(mut self) -> InstallResult {
        let started = Instant::now();
        self.stages.push(Stage::Init);
        info!(package = %self.spec.name(), "starting install");

        let mut dependencies = Vec::new();
        let outcome = self.run_stages(&mut dependencies);
        let elapsed = started.elapsed();

        match &outcome {
            Ok(artifacts) => {
                self.enter(Stage::Done);
                self.write_receipt(artifacts, &dependencies);
                self.reporter.done(artifacts, elapsed.as_secs_f64());
                info!(package = %self.spec.name(), elapsed = ?elapsed, "install complete");
            }
            Err((stage, err)) => {
                self.stage = Stage::Failed;
                self.stages.push(Stage::Failed);
                self.reporter.failed(*stage, &err.to_string());
                warn!(package = %self.spec.name(), %stage, error = %err, "install failed");
            }
        }

        InstallResult {
            outcome,
            stages: self.stages,
            dependencies,
            elapsed,
        }
    }

    fn run_stages(&mut self, dependencies: &mut Vec<ResolvedDependency>) -> StageResult<Vec<Artifact>> {
        self.advance(Stage::Resolving)?;
        let sources: Vec<&dyn DependencySource> = self.sources.iter().map(AsRef::as_ref).collect();
        *dependencies = resolve(&self.spec, &sources).map_err(|e| (Stage::Resolving, e.into()))?;
        for dep in dependencies.iter() {
            self.reporter.info(&format!("dependency {dep}"));
        }

        self.advance(Stage::Building)?;
        let artifacts = BuildInvoker::new(self.build_tool.as_ref())
            .with_timeout(self.timeout)
            .with_cancel(self.cancel.clone())
            .invoke(
                &self.spec,
                dependencies,
                &self.config,
                &self.source_dir,
                &self.layout,
                &self.log_path,
            )
            .map_err(|e| (Stage::Building, e.into()))?;

        self.advance(Stage::Installing)?;
        // Held until this function returns, covering patching and signing.
        let _lock = InstallLock::acquire(&self.layout.destinations())
            .map_err(|e| (Stage::Installing, e.into()))?;
        Installer::new(&self.layout)
            .install(&artifacts)
            .map_err(|e| (Stage::Installing, e.into()))?;
        for artifact in &artifacts {
            self.reporter.installed(artifact);
        }

        self.advance(Stage::Patching)?;
        let placeholder = self.spec.placeholder_for(&self.config);
        let target = self.layout.frameworks_dir().to_string_lossy().into_owned();
        for artifact in artifacts.iter().filter(|a| a.is_executable()) {
            let outcome = patch_file(&artifact.destination, &placeholder, &target).map_err(|source| {
                (
                    Stage::Patching,
                    StageError::Patch {
                        path: artifact.destination.clone(),
                        source,
                    },
                )
            })?;
            if outcome == PatchOutcome::AlreadyPatched {
                self.reporter
                    .info(&format!("{} already points at {target}", artifact.name));
            }
        }

        self.advance(Stage::Signing)?;
        for artifact in artifacts.iter().filter(|a| a.is_executable()) {
            self.sign_tool
                .sign(&artifact.destination, &self.cancel)
                .map_err(|e| (Stage::Signing, e.into()))?;
        }

        Ok(artifacts)
    }

    /// Move to `next`, failing in `next` if the run was cancelled.
    fn advance(&mut self, next: Stage) -> StageResult<()> {
        debug_assert_eq!(self.stage.next(), Some(next), "illegal stage transition");
        self.enter(next);
        if self.cancel.is_cancelled() {
            return Err((next, StageError::Cancelled));
        }
        Ok(())
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.stages.push(stage);
        self.reporter.stage(stage);
        info!(package = %self.spec.name(), %stage, "entering stage");
    }

    fn write_receipt(&self, artifacts: &[Artifact], dependencies: &[ResolvedDependency]) {
        let Some(dir) = &self.receipt_dir else {
            return;
        };
        let written = InstallReceipt::new(&self.spec, &self.config, artifacts, dependencies)
            .and_then(|r| r.write(dir));
        match written {
            Ok(path) => info!(path = %path.display(), "wrote install receipt"),
            Err(e) => {
                warn!(error = %e, "failed to write install receipt");
                self.reporter.warning(&format!("Failed to write install receipt: {e}"));
            }
        }
    }
}
