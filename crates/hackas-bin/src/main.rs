//! hackas entrypoint: a drop-in stand-in for the system assembler.
//!
//! The command line is scanned for the handful of options an assembler
//! invocation from the compiler driver uses. Anything else means the
//! invocation is not ours to optimize: the real assembler is executed with
//! the original argv. Otherwise the input is rewritten, both versions are
//! dumped for inspection, and the rewritten text is piped to the real
//! assembler, whose exit status becomes ours.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio, exit};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use core_x86::Abi;

/// Where the assembler lives when this build environment carries its own
/// binutils; `HACKAS_AS` overrides, `PATH` is the fallback.
const PREFERRED_AS: &str = "/usr/local/binutils-svn/bin/as";

fn find_as() -> String {
    if let Ok(path) = std::env::var("HACKAS_AS") {
        if !path.is_empty() {
            return path;
        }
    }
    let preferred = Path::new(PREFERRED_AS);
    if preferred.is_file() {
        // X_OK probe without unix-extras: spawning will fail later anyway
        // if it is not executable; existence is the cheap check.
        return PREFERRED_AS.to_string();
    }
    "as".to_string()
}

/// The recognized subset of an assembler command line.
#[derive(Debug, PartialEq, Eq)]
struct AsInvocation {
    /// Arguments for the real assembler (input file omitted; it reads stdin).
    args: Vec<String>,
    /// `-` or absent means stdin.
    input: Option<String>,
    abi: Abi,
}

impl AsInvocation {
    /// Scan `argv[1..]`. `None` means the command line is not understood
    /// and the caller must fall back to the real assembler verbatim.
    fn parse(argv: &[String]) -> Option<Self> {
        let mut args = Vec::new();
        let mut input: Option<String> = None;
        let mut outfile: Option<String> = None;
        let mut abi = Abi::Lp64;
        let mut iter = argv.iter().peekable();
        while let Some(arg) = iter.next() {
            if arg.starts_with("-m") || arg == "--noexecstack" || arg == "-W" {
                args.push(arg.clone());
            } else if let Some(parsed) = Abi::from_flag(arg) {
                abi = parsed;
                args.push(arg.clone());
            } else if arg == "-" || arg.ends_with(".s") || arg.ends_with(".S") {
                if input.is_some() {
                    return None;
                }
                input = Some(arg.clone());
            } else if arg == "-I" {
                let dir = iter.next()?;
                args.push(arg.clone());
                args.push(dir.clone());
            } else if arg == "-o" {
                let out = iter.next()?;
                outfile = Some(out.clone());
                args.push(arg.clone());
                args.push(out.clone());
            } else {
                return None;
            }
        }
        outfile?;
        Some(Self { args, input, abi })
    }
}

/// Before/after dump files under one shared directory, so a failed build
/// can be replayed. The directory is contended by concurrent compiler
/// invocations; index allocation holds an exclusive flock.
struct Dumper {
    dir: PathBuf,
    index: u32,
}

const DUMP_DIR: &str = "/tmp/.hackas";
const CLEAN_THRESHOLD: Duration = Duration::from_secs(600);

struct DirLock {
    file: File,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let file = File::open(dir)?;
        // SAFETY: the fd is owned by `file` and stays open for the guard's
        // lifetime.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("flock dump directory");
        }
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

impl Dumper {
    fn new(original: &[u8]) -> Result<Self> {
        Self::in_dir(PathBuf::from(DUMP_DIR), original)
    }

    fn in_dir(dir: PathBuf, original: &[u8]) -> Result<Self> {
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err).context("create dump directory"),
        }
        let _lock = DirLock::acquire(&dir)?;

        let threshold = SystemTime::now() - CLEAN_THRESHOLD;
        let mut index = 0u32;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".s") {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .map(|mtime| mtime < threshold)
                .unwrap_or(false);
            if stale {
                let _ = fs::remove_file(entry.path());
            } else if let Some(n) = name.get(..5).and_then(|s| s.parse::<u32>().ok()) {
                index = index.max(n);
            }
        }
        index += 1;

        let dumper = Self { dir, index };
        fs::write(dumper.path(0), original).context("dump original")?;
        Ok(dumper)
    }

    fn path(&self, generation: u32) -> PathBuf {
        self.dir.join(format!("{:05}.{}.s", self.index, generation))
    }

    /// Write the rewritten text and hand back a handle positioned at the
    /// start, ready to serve as the assembler's stdin.
    fn dump_new(&self, rewritten: &[u8]) -> Result<File> {
        let path = self.path(1);
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("dump rewritten copy to {}", path.display()))?;
        file.write_all(rewritten)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }
}

/// Wall-clock accounting per pipeline stage, reported when
/// `HACKAS_PROFILE` is set.
#[derive(Default)]
struct StageTimer {
    stages: Vec<(&'static str, Duration)>,
}

impl StageTimer {
    fn run<T>(&mut self, name: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.stages.push((name, start.elapsed()));
        result
    }

    fn report(&self) {
        let total: Duration = self.stages.iter().map(|(_, d)| *d).sum();
        eprintln!("hackas profile (cumulative {:>9.3?})", total);
        let mut cumulative = Duration::ZERO;
        for (name, duration) in &self.stages {
            cumulative += *duration;
            eprintln!("  {name:<12} self {duration:>9.3?}  cum {cumulative:>9.3?}");
        }
    }
}

fn profiling_enabled() -> bool {
    std::env::var("HACKAS_PROFILE").is_ok_and(|v| !v.is_empty())
}

fn configure_logging(profile: bool) {
    let filter = if profile {
        // Per-pass events from the engine land on stderr alongside the
        // stage table.
        tracing_subscriber::EnvFilter::new("info,hackas::profile=debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn rewrite_buffer(content: &[u8], abi: Abi, timer: &mut StageTimer) -> Result<Vec<u8>> {
    let (canonical, preprocessor) = timer.run("preprocess", || core_preprocess::apply(content));
    let rewritten = timer.run("rewrite", || core_rewrite::rewrite(&canonical, abi));
    let restored = timer.run("restore", || preprocessor.restore(&rewritten))?;
    Ok(restored)
}

fn read_input(input: Option<&str>) -> std::io::Result<Vec<u8>> {
    let mut content = Vec::new();
    match input {
        None | Some("-") => {
            std::io::stdin().lock().read_to_end(&mut content)?;
        }
        Some(path) => {
            File::open(path)?.read_to_end(&mut content)?;
        }
    }
    Ok(content)
}

/// Run the real assembler with the original argv and propagate its status.
fn fall_back(argv: &[String]) -> ! {
    eprintln!(
        "WARNING: Falling back to standard as. Command line not understood: {}",
        argv.join(" ")
    );
    let status = Command::new(find_as()).args(&argv[1..]).status();
    match status {
        Ok(status) => exit(status.code().unwrap_or(1)),
        Err(err) => {
            eprintln!("hackas: failed to run assembler: {err}");
            exit(1);
        }
    }
}

fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let profile = profiling_enabled();
    configure_logging(profile);

    let Some(invocation) = AsInvocation::parse(&argv[1..]) else {
        fall_back(&argv);
    };
    let Ok(content) = read_input(invocation.input.as_deref()) else {
        // Let the real assembler produce its own diagnostics and status.
        fall_back(&argv);
    };

    info!(
        target: "hackas",
        bytes_in = content.len(),
        abi = invocation.abi.as_str(),
        "rewrite_begin"
    );

    let mut timer = StageTimer::default();
    let dumper = match Dumper::new(&content) {
        Ok(dumper) => Some(dumper),
        Err(err) => {
            // Dumps are a debugging aid; losing them never blocks a build.
            warn!(target: "hackas", %err, "dump_directory_unavailable");
            None
        }
    };

    let rewritten = match rewrite_buffer(&content, invocation.abi, &mut timer) {
        Ok(rewritten) => rewritten,
        Err(err) => {
            warn!(target: "hackas", %err, "rewrite_failed_using_original");
            content.clone()
        }
    };
    debug!(
        target: "hackas",
        bytes_in = content.len(),
        bytes_out = rewritten.len(),
        "rewrite_done"
    );
    if profile {
        timer.report();
    }

    let stdin_file = dumper
        .as_ref()
        .and_then(|dumper| dumper.dump_new(&rewritten).ok());

    let mut command = Command::new(find_as());
    command.args(&invocation.args);
    match stdin_file {
        Some(file) => {
            command.stdin(Stdio::from(file));
        }
        None => {
            command.stdin(Stdio::piped());
        }
    }
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            eprintln!("hackas: failed to run assembler: {err}");
            exit(1);
        }
    };
    if let Some(mut pipe) = child.stdin.take() {
        let _ = pipe.write_all(&rewritten);
    }
    match child.wait() {
        Ok(status) => exit(status.code().unwrap_or(1)),
        Err(err) => {
            eprintln!("hackas: failed to wait for assembler: {err}");
            exit(1);
        }
    }
}
