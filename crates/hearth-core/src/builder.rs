//! Build invocation.
//!
//! The [`BuildInvoker`] turns a package description into a list of expected
//! [`Artifact`]s, runs the selected [`BuildTool`] as a supervised subprocess,
//! and then checks that every expected product actually exists.
//!
//! ## Dependency environment
//!
//! Both tools see the resolved dependencies through the same variables:
//!
//! | Variable | Value |
//! |---|---|
//! | `PATH` | `bin/` of every dependency, then the system directories |
//! | `DEP_<NAME>` | Prefix of each dependency that has one |
//! | `CPATH` | `include/` of runtime dependencies only |
//! | `LIBRARY_PATH` | `lib/` of runtime dependencies only |
//! | `PKG_CONFIG_PATH` | `lib/pkgconfig` of runtime dependencies only |
//!
//! Build-only dependencies contribute executables, never headers or
//! libraries, so they cannot end up in the installed artifact's link set.
//!
//! ## Products
//!
//! Products are expected at `<source>/<output-folder>/build/<build-type>/<name>`
//! (the CMake layout Conan produces). The products directory is cleared
//! before each build so a stale product can never satisfy the check.

use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use hearth_schema::{Artifact, BuildConfig, BuildSystem, ConfigError, PackageSpec, Phase};
use thiserror::Error;
use tracing::{debug, info};

use crate::installer::InstallLayout;
use crate::process::{CancelToken, Supervised, WaitError};
use crate::resolver::ResolvedDependency;

/// Number of log lines quoted in a failure.
const LOG_TAIL_LINES: usize = 40;

/// Fixed epoch for `SOURCE_DATE_EPOCH` so embedded timestamps are identical
/// across builds.
const SOURCE_DATE_EPOCH: &str = "0";

/// System directories appended to every build `PATH`.
const SYSTEM_PATH: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin", "/usr/sbin", "/sbin"];

/// Why a build did not produce its artifacts.
#[derive(Error, Debug)]
pub enum BuildFailure {
    /// The build configuration failed validation. No process was started.
    #[error("Invalid build configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The build log could not be created.
    #[error("Failed to create build log {}: {source}", .path.display())]
    Log {
        /// Log path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The build tree could not be prepared.
    #[error("Failed to prepare build tree {}: {source}", .path.display())]
    Prepare {
        /// Path that could not be cleared or created.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The build tool could not be started.
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The build tool exited unsuccessfully.
    #[error("'{program}' exited with {}\n{output}", describe_code(.code.as_ref()))]
    Exited {
        /// Program name.
        program: String,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Tail of the build log.
        output: String,
    },

    /// The build tool ran past the configured timeout and was killed.
    #[error("'{program}' timed out after {}s\n{output}", .after.as_secs())]
    TimedOut {
        /// Program name.
        program: String,
        /// How long it ran.
        after: Duration,
        /// Tail of the build log.
        output: String,
    },

    /// The run was cancelled and the build tool was killed.
    #[error("Build cancelled")]
    Cancelled,

    /// The build tool reported success but an expected product is missing.
    #[error("Build succeeded but expected output is missing: {}", .path.display())]
    MissingOutput {
        /// Expected product path.
        path: PathBuf,
    },

    /// Waiting on the build tool failed.
    #[error("Failed to wait for '{program}': {source}")]
    Wait {
        /// Program name.
        program: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

fn describe_code(code: Option<&i32>) -> String {
    code.map_or_else(|| "no exit code (killed by signal)".to_string(), |c| format!("exit code {c}"))
}

/// Everything a build tool needs for one invocation.
#[derive(Debug)]
pub struct BuildRequest<'a> {
    /// Package being built.
    pub spec: &'a PackageSpec,
    /// Validated options.
    pub config: &'a BuildConfig,
    /// Source tree root; the tool runs with this as its working directory.
    pub source_dir: &'a Path,
    /// Resolved dependencies.
    pub deps: &'a [ResolvedDependency],
    /// Where stdout and stderr go.
    pub log_path: &'a Path,
    /// Wall-clock budget for the whole build.
    pub timeout: Option<Duration>,
    /// Cancellation flag for the whole run.
    pub cancel: &'a CancelToken,
}

impl BuildRequest<'_> {
    /// Run `cmd` under supervision with output appended to the build log.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildFailure`] describing spawn, exit, timeout, or
    /// cancellation failures; output tails are read from the log.
    pub fn run(&self, cmd: &mut Command, remaining: Option<Duration>) -> Result<(), BuildFailure> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let log = File::options()
            .create(true)
            .append(true)
            .open(self.log_path)
            .map_err(|source| BuildFailure::Log {
                path: self.log_path.to_path_buf(),
                source,
            })?;
        let log_err = log.try_clone().map_err(|source| BuildFailure::Log {
            path: self.log_path.to_path_buf(),
            source,
        })?;

        cmd.current_dir(self.source_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        debug!(program, args = ?cmd.get_args().collect::<Vec<_>>(), "running build command");
        let child = Supervised::spawn(cmd).map_err(|source| BuildFailure::Spawn {
            program: program.clone(),
            source,
        })?;

        match child.wait(remaining, self.cancel) {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(BuildFailure::Exited {
                program,
                code: status.code(),
                output: self.log_tail(),
            }),
            Err(WaitError::TimedOut(after)) => Err(BuildFailure::TimedOut {
                program,
                after,
                output: self.log_tail(),
            }),
            Err(WaitError::Cancelled) => Err(BuildFailure::Cancelled),
            Err(WaitError::Io(source)) => Err(BuildFailure::Wait { program, source }),
        }
    }

    fn log_tail(&self) -> String {
        read_last_lines(self.log_path, LOG_TAIL_LINES).unwrap_or_default()
    }

    /// `PATH`, `DEP_*`, and search-path variables for the resolved
    /// dependencies (see the module docs).
    pub fn dependency_env(&self) -> Vec<(String, OsString)> {
        let mut path_dirs: Vec<PathBuf> = Vec::new();
        let mut include: Vec<PathBuf> = Vec::new();
        let mut lib: Vec<PathBuf> = Vec::new();
        let mut pkg_config: Vec<PathBuf> = Vec::new();
        let mut env: Vec<(String, OsString)> = Vec::new();

        for dep in self.deps {
            if let Some(bin) = &dep.bin_dir {
                if !path_dirs.contains(bin) {
                    path_dirs.push(bin.clone());
                }
            }
            let Some(prefix) = &dep.prefix else {
                continue;
            };
            env.push((
                format!("DEP_{}", dep.name.env_key()),
                prefix.clone().into_os_string(),
            ));
            if dep.phase != Phase::Runtime {
                continue;
            }
            if prefix.join("include").is_dir() {
                include.push(prefix.join("include"));
            }
            if prefix.join("lib").is_dir() {
                lib.push(prefix.join("lib"));
            }
            if prefix.join("lib/pkgconfig").is_dir() {
                pkg_config.push(prefix.join("lib/pkgconfig"));
            }
        }

        path_dirs.extend(SYSTEM_PATH.iter().map(PathBuf::from));
        let join = |dirs: &[PathBuf]| std::env::join_paths(dirs).unwrap_or_default();

        env.push(("PATH".to_string(), join(&path_dirs)));
        if !include.is_empty() {
            env.push(("CPATH".to_string(), join(&include)));
        }
        if !lib.is_empty() {
            env.push(("LIBRARY_PATH".to_string(), join(&lib)));
        }
        if !pkg_config.is_empty() {
            env.push(("PKG_CONFIG_PATH".to_string(), join(&pkg_config)));
        }
        env
    }
}

/// An external build system.
pub trait BuildTool: fmt::Debug + Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Build the package described by `request`, leaving products under
    /// `request.config.products_dir()`.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildFailure`] if the build does not complete.
    fn build(&self, request: &BuildRequest<'_>) -> Result<(), BuildFailure>;
}

/// Conan 2 driving a CMake project.
///
/// Runs `conan profile detect --exist-ok`, then
/// `conan build . --build=missing --output-folder=<f>
/// --conf tools.build:skip_test=<b> --settings build_type=<t>
/// --options use_system_libs=<b>`.
#[derive(Debug, Clone)]
pub struct Conan {
    program: PathBuf,
}

impl Default for Conan {
    fn default() -> Self {
        Self {
            program: PathBuf::from("conan"),
        }
    }
}

impl Conan {
    /// Use a specific `conan` executable.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments for the `conan build` step.
    pub fn build_args(config: &BuildConfig) -> Vec<OsString> {
        let mut output_folder = OsString::from("--output-folder=");
        output_folder.push(&config.output_folder);
        vec![
            "build".into(),
            ".".into(),
            "--build=missing".into(),
            output_folder,
            "--conf".into(),
            format!("tools.build:skip_test={}", python_bool(config.skip_tests)).into(),
            "--settings".into(),
            format!("build_type={}", config.build_type).into(),
            "--options".into(),
            format!("use_system_libs={}", python_bool(config.use_system_libs)).into(),
        ]
    }

    fn command(&self, request: &BuildRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.program);
        // Conan needs the user's HOME and its own cache; only extend PATH and
        // the dependency variables.
        for (key, value) in request.dependency_env() {
            if key == "PATH" {
                let mut path = value;
                if let Some(existing) = std::env::var_os("PATH") {
                    path.push(":");
                    path.push(existing);
                }
                cmd.env("PATH", path);
            } else {
                cmd.env(key, value);
            }
        }
        cmd.env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH);
        cmd
    }
}

fn python_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

impl BuildTool for Conan {
    fn name(&self) -> &str {
        "conan"
    }

    fn build(&self, request: &BuildRequest<'_>) -> Result<(), BuildFailure> {
        let started = std::time::Instant::now();

        let mut detect = self.command(request);
        detect.args(["profile", "detect", "--exist-ok"]);
        request.run(&mut detect, request.timeout)?;

        let remaining = request.timeout.map(|t| t.saturating_sub(started.elapsed()));
        let mut build = self.command(request);
        build.args(Self::build_args(request.config));
        request.run(&mut build, remaining)
    }
}

/// A shell script run as `/bin/sh -c <script>` with a cleared environment.
///
/// Besides the dependency variables, the script sees `HOME` (the source
/// tree), `TERM=dumb`, `LANG`, `SOURCE_DATE_EPOCH`, `OUTPUT_FOLDER`,
/// `BUILD_TYPE`, `SKIP_TESTS`, `USE_SYSTEM_LIBS` and `ARTIFACT_DIR` (the
/// absolute products directory, already created).
#[derive(Debug, Clone)]
pub struct Script {
    body: String,
}

impl Script {
    /// A script tool running `body`.
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

impl BuildTool for Script {
    fn name(&self) -> &str {
        "script"
    }

    fn build(&self, request: &BuildRequest<'_>) -> Result<(), BuildFailure> {
        let artifact_dir = request.source_dir.join(request.config.products_dir());
        std::fs::create_dir_all(&artifact_dir).map_err(|source| BuildFailure::Prepare {
            path: artifact_dir.clone(),
            source,
        })?;

        let mut cmd = Command::new("/bin/sh");
        // Start from a blank slate so host env vars never leak in.
        cmd.env_clear();
        cmd.arg("-c").arg(&self.body);
        cmd.envs(request.dependency_env())
            .env("HOME", request.source_dir)
            .env("TERM", "dumb")
            .env("LANG", "en_US.UTF-8")
            .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
            .env("OUTPUT_FOLDER", &request.config.output_folder)
            .env("BUILD_TYPE", request.config.build_type.as_str())
            .env("SKIP_TESTS", request.config.skip_tests.to_string())
            .env("USE_SYSTEM_LIBS", request.config.use_system_libs.to_string())
            .env("ARTIFACT_DIR", &artifact_dir);
        request.run(&mut cmd, request.timeout)
    }
}

/// Build tool selected by a package description.
pub fn tool_for(system: &BuildSystem) -> Box<dyn BuildTool> {
    match system {
        BuildSystem::Conan => Box::new(Conan::default()),
        BuildSystem::Script { script } => Box::new(Script::new(script.clone())),
    }
}

/// Runs a build tool and reports the products it left behind.
#[derive(Debug)]
pub struct BuildInvoker<'a> {
    tool: &'a dyn BuildTool,
    timeout: Option<Duration>,
    cancel: CancelToken,
}

impl<'a> BuildInvoker<'a> {
    /// Invoker for `tool` with no timeout.
    pub fn new(tool: &'a dyn BuildTool) -> Self {
        Self {
            tool,
            timeout: None,
            cancel: CancelToken::new(),
        }
    }

    /// Kill the build after `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Kill the build when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate, build, and verify.
    ///
    /// Returns the sorted artifact list on success. Re-running with the same
    /// inputs yields the same list.
    ///
    /// # Errors
    ///
    /// Returns [`BuildFailure::InvalidConfig`] before any process starts if
    /// the configuration is invalid; otherwise whatever the tool reports, or
    /// [`BuildFailure::MissingOutput`] if a declared product is absent.
    pub fn invoke(
        &self,
        spec: &PackageSpec,
        deps: &[ResolvedDependency],
        config: &BuildConfig,
        source_dir: &Path,
        layout: &InstallLayout,
        log_path: &Path,
    ) -> Result<Vec<Artifact>, BuildFailure> {
        config.validate()?;
        let artifacts = expected_artifacts(spec, config, source_dir, layout);

        let products = source_dir.join(config.products_dir());
        if products.exists() {
            std::fs::remove_dir_all(&products).map_err(|source| BuildFailure::Prepare {
                path: products.clone(),
                source,
            })?;
        }
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| BuildFailure::Log {
                path: log_path.to_path_buf(),
                source,
            })?;
        }
        // Each invocation starts a fresh log.
        File::create(log_path).map_err(|source| BuildFailure::Log {
            path: log_path.to_path_buf(),
            source,
        })?;

        info!(
            package = %spec.name(),
            tool = self.tool.name(),
            build_type = %config.build_type,
            log = %log_path.display(),
            "building"
        );

        let request = BuildRequest {
            spec,
            config,
            source_dir,
            deps,
            log_path,
            timeout: self.timeout,
            cancel: &self.cancel,
        };
        self.tool.build(&request)?;

        for artifact in &artifacts {
            if artifact.source.symlink_metadata().is_err() {
                return Err(BuildFailure::MissingOutput {
                    path: artifact.source.clone(),
                });
            }
        }

        Ok(artifacts)
    }
}

/// Artifact records for `spec`, sorted by kind then name.
pub fn expected_artifacts(
    spec: &PackageSpec,
    config: &BuildConfig,
    source_dir: &Path,
    layout: &InstallLayout,
) -> Vec<Artifact> {
    let products = source_dir.join(config.products_dir());
    let mut artifacts: Vec<Artifact> = spec
        .artifacts()
        .iter()
        .map(|decl| Artifact {
            kind: decl.kind,
            name: decl.name.clone(),
            source: products.join(&decl.name),
            destination: layout.dir_for(decl.kind).join(&decl.name),
        })
        .collect();
    artifacts.sort();
    artifacts
}

/// Read the last N lines from a file efficiently.
///
/// Instead of loading the entire file, we seek to near the end and read a fixed-size
/// tail buffer. This keeps failure reports cheap for very large build logs.
fn read_last_lines(path: &Path, n: usize) -> std::io::Result<String> {
    // Read at most 16KB from the end (enough for ~400 lines at 40 chars each)
    const TAIL_SIZE: u64 = 16 * 1024;

    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let seek_pos = file_len.saturating_sub(TAIL_SIZE);
    file.seek(SeekFrom::Start(seek_pos))?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let buffer = String::from_utf8_lossy(&bytes);

    // If we seeked mid-file, skip the first (partial) line
    let content = if seek_pos > 0 {
        buffer.find('\n').map_or(&buffer[..], |idx| &buffer[idx + 1..])
    } else {
        &buffer[..]
    };

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].join("\n"))
}
