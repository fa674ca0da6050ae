use anyhow::{bail, Context, Result};
use clap::Parser;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(author, version, about = "Pascal compiler regression harness", long_about = None)]
struct Cli {
    /// Root directory containing test suites
    tests_dir: PathBuf,
    /// Single-character selector passed to the compiler as -<selector>
    selector: char,
    /// Assemble, link and run the compiled program; diff its stdout
    #[arg(short = 'o', long)]
    check_output: bool,
    /// Write baselines from the current output instead of comparing
    #[arg(short, long)]
    generate: bool,
    /// Suffix appended to baseline base-names
    #[arg(short, long, default_value = "")]
    suffix: String,
    /// Report failures without rewriting baselines; exit non-zero on failure
    #[arg(long, conflicts_with = "generate")]
    verify: bool,
    /// Only run cases whose file name contains this filter
    #[arg(short, long)]
    filter: Option<String>,
    /// Print per-invocation execution details
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
    /// Compiler executable (name on PATH or explicit path)
    #[arg(long, default_value = "pascalc")]
    compiler: String,
    /// Assembler executable used in --check-output mode
    #[arg(long, default_value = "ml")]
    assembler: String,
    /// Linker executable used in --check-output mode
    #[arg(long, default_value = "link")]
    linker: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    VERBOSE.store(cli.verbose, Ordering::Relaxed);

    let harness = Harness::new(&cli)?;
    let tally = run_suite(&harness, &cli.tests_dir)?;
    if harness.baselines == BaselinePolicy::Generate {
        return Ok(());
    }
    println!("\n{} tests passed. {} tests failed", tally.passed, tally.failed);
    if harness.baselines == BaselinePolicy::Verify && tally.failed > 0 {
        bail!("failures encountered");
    }
    Ok(())
}

// --------------------- Shared harness --------------------------------------

static VERBOSE: AtomicBool = AtomicBool::new(false);

const COMPILER_OUTPUT: &str = "output.txt";
const OBJECT_FILE: &str = "output.obj";
const PROGRAM_FILE: &str = "output.exe";

#[derive(Debug, Error)]
enum HarnessError {
    #[error("missing baseline {}", .0.display())]
    MissingBaseline(PathBuf),
    #[error("{tool} not found: {source}")]
    ToolNotFound { tool: String, source: which::Error },
    #[error("could not run {}: {source}", .tool.display())]
    ToolInvocation { tool: PathBuf, source: io::Error },
}

/// What the actual output of a case is, and therefore which baseline file
/// sits next to its source.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CompareMode {
    /// Diff the compiler's raw output file (`<base>.result` baselines).
    CompilerOutput,
    /// Assemble, link and run the program; diff its captured stdout
    /// (`<base>.output` baselines).
    ProgramOutput,
}

impl CompareMode {
    fn baseline_ext(self) -> &'static str {
        match self {
            CompareMode::CompilerOutput => "result",
            CompareMode::ProgramOutput => "output",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BaselinePolicy {
    /// Compare, and overwrite the baseline on mismatch so the next run passes.
    Update,
    /// Compare only; mismatched baselines are left untouched.
    Verify,
    /// Write baselines from current output; no comparison, no counting.
    Generate,
}

struct Harness {
    compiler: PathBuf,
    toolchain: Option<Toolchain>,
    selector: char,
    mode: CompareMode,
    baselines: BaselinePolicy,
    suffix: String,
    filter: Option<String>,
}

struct Toolchain {
    assembler: PathBuf,
    linker: PathBuf,
}

impl Harness {
    fn new(cli: &Cli) -> Result<Self> {
        let compiler = resolve_tool(&cli.compiler)?;
        let toolchain = if cli.check_output {
            Some(Toolchain {
                assembler: resolve_tool(&cli.assembler)?,
                linker: resolve_tool(&cli.linker)?,
            })
        } else {
            None
        };
        let mode = if cli.check_output {
            CompareMode::ProgramOutput
        } else {
            CompareMode::CompilerOutput
        };
        let baselines = if cli.generate {
            BaselinePolicy::Generate
        } else if cli.verify {
            BaselinePolicy::Verify
        } else {
            BaselinePolicy::Update
        };
        Ok(Self {
            compiler,
            toolchain,
            selector: cli.selector,
            mode,
            baselines,
            suffix: cli.suffix.clone(),
            filter: cli.filter.clone(),
        })
    }
}

fn resolve_tool(name: &str) -> Result<PathBuf, HarnessError> {
    which::which(name).map_err(|source| HarnessError::ToolNotFound {
        tool: name.to_string(),
        source,
    })
}

// --------------------- Process invocation ----------------------------------

fn run_tool(
    exe: &Path,
    args: &[&OsStr],
    dir: &Path,
    quiet: bool,
) -> Result<std::process::ExitStatus, HarnessError> {
    let mut command = Command::new(exe);
    command.args(args).current_dir(dir);
    if quiet {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }
    let status = command
        .status()
        .map_err(|source| HarnessError::ToolInvocation {
            tool: exe.to_path_buf(),
            source,
        })?;
    if VERBOSE.load(Ordering::Relaxed) {
        println!("[CMD ] {exe:?} {args:?} -> status {:?}", status.code());
    }
    Ok(status)
}

fn run_tool_captured(exe: &Path, args: &[&OsStr], dir: &Path) -> Result<Vec<u8>, HarnessError> {
    let spawn_err = |source| HarnessError::ToolInvocation {
        tool: exe.to_path_buf(),
        source,
    };
    let child = Command::new(exe)
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;
    let output = child.wait_with_output().map_err(spawn_err)?;
    if VERBOSE.load(Ordering::Relaxed) {
        println!(
            "[CMD ] {exe:?} {args:?} -> status {:?}, stdout {}B",
            output.status.code(),
            output.stdout.len()
        );
    }
    Ok(output.stdout)
}

/// Captured program output has passed through the console layer: decode it
/// as code page 1251 and collapse CRLF line endings. Compiler output files
/// are compared raw and never go through here.
fn decode_console_output(raw: &[u8]) -> String {
    let (text, _, _) = encoding_rs::WINDOWS_1251.decode(raw);
    text.replace("\r\n", "\n")
}

// --------------------- Baseline store --------------------------------------

fn baseline_path(source: &Path, suffix: &str, mode: CompareMode) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    source.with_file_name(format!("{stem}{suffix}.{}", mode.baseline_ext()))
}

fn load_baseline(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(HarnessError::MissingBaseline(path.to_path_buf()).into())
        }
        Err(e) => Err(e).with_context(|| format!("reading baseline {}", path.display())),
    }
}

fn save_baseline(path: &Path, actual: &[u8]) -> Result<()> {
    // Must reproduce the captured output exactly, with no trailing-newline
    // inflation.
    fs::write(path, actual).with_context(|| format!("writing baseline {}", path.display()))
}

// --------------------- Case execution --------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CaseOutcome {
    Passed,
    Failed,
    Generated,
}

fn run_case(h: &Harness, source: &Path) -> Result<CaseOutcome> {
    let scratch = TempDir::new().context("creating case scratch directory")?;
    let actual = compile_and_capture(h, source, scratch.path())?;
    let baseline = baseline_path(source, &h.suffix, h.mode);

    if h.baselines == BaselinePolicy::Generate {
        save_baseline(&baseline, &actual)?;
        return Ok(CaseOutcome::Generated);
    }
    let expected = load_baseline(&baseline)?;
    if expected == actual {
        return Ok(CaseOutcome::Passed);
    }
    if h.baselines == BaselinePolicy::Update {
        save_baseline(&baseline, &actual)?;
    }
    Ok(CaseOutcome::Failed)
}

fn compile_and_capture(h: &Harness, source: &Path, scratch: &Path) -> Result<Vec<u8>> {
    let source = fs::canonicalize(source)
        .with_context(|| format!("locating test case {}", source.display()))?;
    let selector = format!("-{}", h.selector);
    // Exit statuses are deliberately ignored: the output file is the
    // contract, and a missing or empty one is a legitimate actual result.
    let _ = run_tool(
        &h.compiler,
        &[
            OsStr::new(&selector),
            source.as_os_str(),
            OsStr::new(COMPILER_OUTPUT),
        ],
        scratch,
        false,
    )?;
    match &h.toolchain {
        None => Ok(fs::read(scratch.join(COMPILER_OUTPUT)).unwrap_or_default()),
        Some(tools) => {
            let _ = run_tool(
                &tools.assembler,
                &[
                    OsStr::new("/c"),
                    OsStr::new("/coff"),
                    OsStr::new(COMPILER_OUTPUT),
                ],
                scratch,
                true,
            )?;
            let _ = run_tool(
                &tools.linker,
                &[OsStr::new("/subsystem:console"), OsStr::new(OBJECT_FILE)],
                scratch,
                true,
            )?;
            let raw = run_tool_captured(&scratch.join(PROGRAM_FILE), &[], scratch)?;
            Ok(decode_console_output(&raw).into_bytes())
        }
    }
}

// --------------------- Suite walking ---------------------------------------

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
struct Tally {
    passed: usize,
    failed: usize,
}

impl std::ops::AddAssign for Tally {
    fn add_assign(&mut self, rhs: Tally) {
        self.passed += rhs.passed;
        self.failed += rhs.failed;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Entry {
    Case,
    Suite,
    Data,
    Unrecognized,
}

/// Suite layout rules: `*.pas` files are cases and dot-free directories are
/// nested suites. Anything else with a dot is suite data (baselines, notes).
/// A dot-free file cannot be descended into and is reported rather than
/// crashed on.
fn classify(name: &str, is_dir: bool) -> Entry {
    if !is_dir && name.len() > ".pas".len() && name.ends_with(".pas") {
        Entry::Case
    } else if !name.contains('.') {
        if is_dir {
            Entry::Suite
        } else {
            Entry::Unrecognized
        }
    } else {
        Entry::Data
    }
}

fn run_suite(h: &Harness, dir: &Path) -> Result<Tally> {
    let mut tally = Tally::default();
    let entries =
        fs::read_dir(dir).with_context(|| format!("reading suite directory {}", dir.display()))?;
    // Native directory-listing order; case ordering is not guaranteed.
    for entry in entries {
        let entry =
            entry.with_context(|| format!("reading suite directory {}", dir.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("inspecting {}", entry.path().display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        match classify(&name, file_type.is_dir()) {
            Entry::Case => {
                if let Some(f) = &h.filter {
                    if !name.contains(f.as_str()) {
                        continue;
                    }
                }
                tally += report_case(h, dir, &name);
            }
            Entry::Suite => {
                println!();
                tally += run_suite(h, &entry.path())?;
            }
            Entry::Data => {}
            Entry::Unrecognized => {
                eprintln!(
                    "skipping unrecognized entry {} (not a case or suite)",
                    entry.path().display()
                );
            }
        }
    }
    Ok(tally)
}

fn report_case(h: &Harness, dir: &Path, name: &str) -> Tally {
    if VERBOSE.load(Ordering::Relaxed) {
        println!("[RUN ] {}/{}", dir.display(), name);
    }
    let mut tally = Tally::default();
    match run_case(h, &dir.join(name)) {
        Ok(CaseOutcome::Passed) => {
            println!("Test {}/{} passed", dir.display(), name);
            tally.passed += 1;
        }
        Ok(CaseOutcome::Failed) => {
            println!("Test {}/{} failed", dir.display(), name);
            tally.failed += 1;
        }
        Ok(CaseOutcome::Generated) => {}
        Err(e) => {
            // Missing baselines and unrunnable tools fail the case with a
            // cause; the rest of the walk carries on.
            println!("Test {}/{} failed: {e:#}", dir.display(), name);
            if h.baselines != BaselinePolicy::Generate {
                tally.failed += 1;
            }
        }
    }
    tally
}

// --------------------- Tests ------------------------------------------------
