//! Whitelisted command execution inside a session sandbox.
//!
//! Commands are tokenized without a shell. Anything that looks like shell
//! chaining, substitution, expansion, redirection or piping is rejected
//! before the program is even looked up.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ExecError;

/// Executables that may run inside a sandbox.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "npm", "npx", "node", "pnpm", "yarn", "tsc", "prisma", "ls", "cat", "mkdir", "pwd", "echo",
    "touch", "cp", "mv", "rm", "head", "tail", "grep", "find", "wc",
];

/// Shell syntax rejected anywhere in a command, quoted or not. Longer
/// sequences come first so the error names the construct the caller used.
const FORBIDDEN_SEQUENCES: &[&str] = &[
    "&&", "||", "$(", ";", "&", "|", "`", "$", ">", "<", "\n", "\r",
];

/// Per-stream cap on captured output.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// How long to keep draining pipes after the process was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Timeout class of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Install,
    SchemaValidation,
    TypeCheck,
    Generic,
}

impl CommandKind {
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Install => Duration::from_secs(5 * 60),
            Self::SchemaValidation => Duration::from_secs(90),
            Self::TypeCheck => Duration::from_secs(120),
            Self::Generic => Duration::from_secs(60),
        }
    }

    pub fn classify(command: &ParsedCommand) -> Self {
        let is_pm = matches!(command.program.as_str(), "npm" | "pnpm" | "yarn");
        let first = command.args.first().map(String::as_str);
        if is_pm && matches!(first, Some("install" | "i" | "ci" | "add")) {
            return Self::Install;
        }
        if command.program == "prisma" || command.args.iter().any(|a| a == "prisma") {
            return Self::SchemaValidation;
        }
        if command.program == "tsc" || command.args.iter().any(|a| a == "tsc") {
            return Self::TypeCheck;
        }
        Self::Generic
    }
}

/// A tokenized, validated command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ParsedCommand {
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl std::fmt::Display for ParsedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Validate and tokenize a command line.
pub fn parse_command(command: &str) -> Result<ParsedCommand, ExecError> {
    if let Some(seq) = FORBIDDEN_SEQUENCES.iter().find(|s| command.contains(**s)) {
        let shown = match *seq {
            "\n" | "\r" => "newline",
            other => other,
        };
        return Err(ExecError::ForbiddenSyntax(shown.to_string()));
    }

    let tokens = tokenize(command)?;
    let mut iter = tokens.into_iter();
    let program = iter.next().ok_or(ExecError::Empty)?;
    if program.contains('/') || !ALLOWED_COMMANDS.contains(&program.as_str()) {
        return Err(ExecError::NotAllowed(program));
    }
    Ok(ParsedCommand {
        program,
        args: iter.collect(),
    })
}

fn tokenize(input: &str) -> Result<Vec<String>, ExecError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_token = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_token = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err(ExecError::UnterminatedQuote);
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Result of a command that was allowed to run.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub truncated: bool,
    pub duration: Duration,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// stdout followed by stderr, for parsers that read both.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// One-line description of why the command did not succeed.
    pub fn failure_summary(&self) -> String {
        if self.cancelled {
            "cancelled".to_string()
        } else if self.timed_out {
            format!("timed out after {}s", self.duration.as_secs())
        } else {
            match self.exit_code {
                Some(code) => format!("exited with code {}", code),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

/// Something that can run a whitelisted command for a sandbox.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, cancel: &CancellationToken) -> Result<ExecOutcome, ExecError>;
}

/// Runs commands as host child processes with the sandbox as working directory.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    root: PathBuf,
    timeout_override: Option<Duration>,
}

impl LocalExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            timeout_override: None,
        }
    }

    /// Use one timeout for every command class.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl CommandRunner for LocalExecutor {
    async fn run(&self, command: &str, cancel: &CancellationToken) -> Result<ExecOutcome, ExecError> {
        let parsed = parse_command(command)?;
        let timeout = self
            .timeout_override
            .unwrap_or_else(|| CommandKind::classify(&parsed).timeout());
        run_process(&self.root, &parsed, timeout, cancel).await
    }
}

async fn run_process(
    cwd: &Path,
    parsed: &ParsedCommand,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ExecOutcome, ExecError> {
    let started = Instant::now();
    if cancel.is_cancelled() {
        return Ok(ExecOutcome {
            cancelled: true,
            ..Default::default()
        });
    }

    debug!(command = %parsed, cwd = %cwd.display(), "running sandbox command");
    let mut child = Command::new(&parsed.program)
        .args(&parsed.args)
        .current_dir(cwd)
        .env("CI", "1")
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: parsed.program.clone(),
            source,
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut stdout_task = tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES));
    let mut stderr_task = tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES));

    let mut timed_out = false;
    let mut cancelled = false;
    let exit_code = tokio::select! {
        status = child.wait() => status.map_err(ExecError::Output)?.code(),
        _ = cancel.cancelled() => {
            cancelled = true;
            None
        }
        _ = tokio::time::sleep(timeout) => {
            timed_out = true;
            None
        }
    };

    if (cancelled || timed_out)
        && let Err(e) = child.kill().await
    {
        warn!(command = %parsed, error = %e, "failed to kill sandbox command");
    }

    let (stdout, out_truncated) = join_reader(&mut stdout_task, cancelled || timed_out).await;
    let (stderr, err_truncated) = join_reader(&mut stderr_task, cancelled || timed_out).await;

    Ok(ExecOutcome {
        exit_code,
        stdout,
        stderr,
        timed_out,
        cancelled,
        truncated: out_truncated || err_truncated,
        duration: started.elapsed(),
    })
}

/// Await a reader task. After a kill, grandchildren may still hold the pipe,
/// so the wait is bounded and the task aborted.
async fn join_reader(
    task: &mut tokio::task::JoinHandle<(Vec<u8>, bool)>,
    killed: bool,
) -> (String, bool) {
    let joined = if killed {
        match tokio::time::timeout(DRAIN_GRACE, &mut *task).await {
            Ok(res) => res.ok(),
            Err(_) => {
                task.abort();
                None
            }
        }
    } else {
        (&mut *task).await.ok()
    };
    let (bytes, truncated) = joined.unwrap_or_default();
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    (text, truncated)
}

/// Read a stream to the end, keeping at most `limit` bytes. The remainder is
/// drained and discarded so the child never blocks on a full pipe.
async fn read_bounded<R>(reader: Option<R>, limit: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
                if n > room {
                    truncated = true;
                }
            }
        }
    }
    (buf, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_command() {
        let cmd = parse_command("npm install --save react").unwrap();
        assert_eq!(cmd.program, "npm");
        assert_eq!(cmd.args, vec!["install", "--save", "react"]);
        assert_eq!(cmd.to_string(), "npm install --save react");
    }

    #[test]
    fn test_parse_respects_quotes() {
        let cmd = parse_command(r#"grep -r "hello world" 'src dir'"#).unwrap();
        assert_eq!(cmd.args, vec!["-r", "hello world", "src dir"]);
        let cmd = parse_command(r#"echo "say \"hi\"""#).unwrap();
        assert_eq!(cmd.args, vec![r#"say "hi""#]);
        let cmd = parse_command(r#"echo """#).unwrap();
        assert_eq!(cmd.args, vec![""]);
    }

    #[test]
    fn test_parse_rejects_chaining_and_expansion() {
        for bad in [
            "npm install && rm -rf /",
            "ls; cat /etc/passwd",
            "ls || echo x",
            "cat package.json | grep react",
            "echo `whoami`",
            "echo $(whoami)",
            "echo $HOME",
            "echo hi > out.txt",
            "cat < in.txt",
            "npm run dev &",
            "ls\ncat x",
            "echo 'quoted; still rejected'",
        ] {
            assert!(
                matches!(parse_command(bad), Err(ExecError::ForbiddenSyntax(_))),
                "expected rejection for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_parse_names_the_forbidden_construct() {
        match parse_command("npm i && npm test") {
            Err(ExecError::ForbiddenSyntax(s)) => assert_eq!(s, "&&"),
            other => panic!("unexpected {:?}", other),
        }
        match parse_command("ls\nls") {
            Err(ExecError::ForbiddenSyntax(s)) => assert_eq!(s, "newline"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unlisted_programs() {
        assert!(matches!(parse_command("curl http://x"), Err(ExecError::NotAllowed(p)) if p == "curl"));
        assert!(matches!(parse_command("bash -c ls"), Err(ExecError::NotAllowed(_))));
        assert!(matches!(parse_command("/usr/bin/npm install"), Err(ExecError::NotAllowed(_))));
        assert!(matches!(parse_command("   "), Err(ExecError::Empty)));
        assert!(matches!(parse_command("echo 'open"), Err(ExecError::UnterminatedQuote)));
    }

    #[test]
    fn test_classify_timeouts() {
        let kind = |s: &str| CommandKind::classify(&parse_command(s).unwrap());
        assert_eq!(kind("npm install"), CommandKind::Install);
        assert_eq!(kind("pnpm add zod"), CommandKind::Install);
        assert_eq!(kind("npx prisma validate"), CommandKind::SchemaValidation);
        assert_eq!(kind("npx tsc --noEmit"), CommandKind::TypeCheck);
        assert_eq!(kind("ls -la"), CommandKind::Generic);
        assert_eq!(CommandKind::Install.timeout(), Duration::from_secs(300));
        assert_eq!(CommandKind::SchemaValidation.timeout(), Duration::from_secs(90));
        assert_eq!(CommandKind::TypeCheck.timeout(), Duration::from_secs(120));
        assert_eq!(CommandKind::Generic.timeout(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_read_bounded_truncates() {
        let data = vec![b'a'; 100];
        let (buf, truncated) = read_bounded(Some(&data[..]), 10).await;
        assert_eq!(buf.len(), 10);
        assert!(truncated);
        let (buf, truncated) = read_bounded(Some(&data[..]), 100).await;
        assert_eq!(buf.len(), 100);
        assert!(!truncated);
    }

    #[test]
    fn test_outcome_summaries() {
        let ok = ExecOutcome {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.success());
        let failed = ExecOutcome {
            exit_code: Some(2),
            stdout: "out".into(),
            stderr: "err".into(),
            ..Default::default()
        };
        assert!(!failed.success());
        assert_eq!(failed.failure_summary(), "exited with code 2");
        assert_eq!(failed.combined_output(), "out\nerr");
        let timed = ExecOutcome {
            exit_code: Some(0),
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_executor_runs_in_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi there\n").unwrap();
        let exec = LocalExecutor::new(dir.path());
        let out = exec.run("cat hello.txt", &CancellationToken::new()).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hi there\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_executor_reports_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalExecutor::new(dir.path());
        let out = exec.run("cat missing.txt", &CancellationToken::new()).await.unwrap();
        assert!(!out.success());
        assert_ne!(out.exit_code, Some(0));
        assert!(!out.stderr.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_executor_timeout_returns_outcome() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("log.txt"), "").unwrap();
        let exec = LocalExecutor::new(dir.path()).with_timeout(Duration::from_millis(200));
        let out = exec.run("tail -f log.txt", &CancellationToken::new()).await.unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_executor_observes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("log.txt"), "").unwrap();
        let exec = LocalExecutor::new(dir.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let out = exec.run("tail -f log.txt", &cancel).await.unwrap();
        assert!(out.cancelled);
        assert!(out.duration < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_local_executor_rejects_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalExecutor::new(dir.path());
        let err = exec.run("rm -rf / ; ls", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::ForbiddenSyntax(_)));
    }
}
