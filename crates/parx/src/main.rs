//! parx: run a command once per line of stdin, with bounded parallelism.
//!
//! Each non-empty input line is appended as the last argument of the command.
//! By default the first failing command stops further dispatch; with
//! `--keep-going` every line is run and reported as one JSON object per line.

use std::io;
use std::process;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use futures::{Stream, StreamExt, future, stream};
use safe_parallel::{CancellationToken, RunConfig, RunError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Options {
    jobs: Option<usize>,
    keep_going: bool,
    program: String,
    args: Vec<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: parx [-j <jobs>] [-k] [--] <command> [args...]");
            eprintln!();
            eprintln!("Runs <command> [args...] <line> for every line read from stdin.");
            eprintln!();
            eprintln!("Options:");
            eprintln!(
                "  -j, --jobs <n>     Maximum concurrent commands [default: $SAFE_PARALLEL_MAX_PARALLELISM or 100]"
            );
            eprintln!("  -k, --keep-going   Run every line and print a JSON result per line");
            process::exit(2);
        }
    };

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    match run(options, BufReader::new(tokio::io::stdin()), cancel).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

/// Logs go to stderr. `RUST_LOG` wins over `PARX_LOG` (a bare level, default
/// `warn`); `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("PARX_LOG").unwrap_or_else(|_| "warn".to_string());
        EnvFilter::try_new(format!("parx={level},safe_parallel={level}"))
            .unwrap_or_else(|_| EnvFilter::new("parx=warn,safe_parallel=warn"))
    });

    let json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(io::stderr)))
        .try_init();
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut jobs = None;
    let mut keep_going = false;
    let mut command: Vec<String> = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "-j" | "--jobs" => {
                i += 1;
                let value = args.get(i).ok_or("--jobs requires a value")?;
                let n = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid job count: {value}"))?;
                jobs = Some(n);
            }
            "-k" | "--keep-going" => keep_going = true,
            "--help" | "-h" => return Err(String::new()),
            "--" => {
                command.extend(args[i + 1..].iter().cloned());
                break;
            }
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            _ => {
                command.extend(args[i..].iter().cloned());
                break;
            }
        }
        i += 1;
    }

    let mut command = command.into_iter();
    let program = command.next().ok_or("missing required argument: <command>")?;
    Ok(Options {
        jobs,
        keep_going,
        program,
        args: command.collect(),
    })
}

/// Returns whether every command succeeded.
///
/// Fails if `input` could not be read to the end, after the lines read so far
/// have been run.
async fn run<R>(options: Options, input: R, cancel: CancellationToken) -> anyhow::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    let read_error = Arc::new(OnceLock::new());
    let lines = until_error(input_lines(input), Arc::clone(&read_error));

    let mut config = RunConfig::default().with_cancel_token(cancel);
    if let Some(jobs) = options.jobs {
        config = config.with_max_parallelism(jobs);
    }

    let program: Arc<str> = options.program.into();
    let args: Arc<[String]> = options.args.into();
    let action = move |line: String| run_command(Arc::clone(&program), Arc::clone(&args), line);

    if !options.keep_going {
        let succeeded = match safe_parallel::run_all_stream(lines, action, config).await {
            Ok(()) => true,
            Err(RunError::Cancelled) => {
                tracing::warn!("Interrupted, not starting further commands");
                false
            }
            Err(e) => return Err(e.into()),
        };
        check_read(&read_error)?;
        return Ok(succeeded);
    }

    let results = safe_parallel::run_all_with_results_stream(lines, action, config)?;
    let mut results = std::pin::pin!(results);
    let mut failed = 0usize;
    let mut total = 0usize;
    while let Some(result) = results.next().await {
        total += 1;
        if !result.succeeded() {
            failed += 1;
        }
        println!("{}", result.to_json());
    }

    tracing::info!(total, failed, "All commands finished");
    check_read(&read_error)?;
    if failed > 0 {
        eprintln!(
            "{}",
            serde_json::json!({ "total": total, "failed": failed })
        );
    }
    Ok(failed == 0)
}

async fn run_command(program: Arc<str>, args: Arc<[String]>, line: String) -> anyhow::Result<()> {
    let status = Command::new(&*program)
        .args(args.iter())
        .arg(&line)
        .status()
        .await
        .with_context(|| format!("failed to start `{program}`"))?;

    if !status.success() {
        anyhow::bail!("`{program}` exited with {status} for input {line:?}");
    }
    Ok(())
}

/// Non-empty lines of `input`, read lazily. Invalid UTF-8 is replaced, not rejected.
fn input_lines<R>(input: R) -> impl Stream<Item = io::Result<String>>
where
    R: AsyncBufRead + Unpin,
{
    stream::unfold(Some(input), |input| async move {
        let mut input = input?;
        let mut buf = Vec::new();
        match input.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.ends_with(b"\n") {
                    buf.pop();
                }
                if buf.ends_with(b"\r") {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                Some((Ok(line), Some(input)))
            }
            // Nothing is read after an error.
            Err(e) => Some((Err(e), None)),
        }
    })
    .filter(|line| future::ready(line.as_ref().map_or(true, |l| !l.trim().is_empty())))
}

/// Ends `lines` at the first read error, parking it in `slot`.
fn until_error<S>(lines: S, slot: Arc<OnceLock<io::Error>>) -> impl Stream<Item = String>
where
    S: Stream<Item = io::Result<String>>,
{
    lines.scan(slot, |slot, line| {
        future::ready(match line {
            Ok(line) => Some(line),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read input, not starting further commands");
                let _ = slot.set(e);
                None
            }
        })
    })
}

fn check_read(read_error: &OnceLock<io::Error>) -> anyhow::Result<()> {
    match read_error.get() {
        Some(e) => anyhow::bail!("failed to read input: {e}"),
        None => Ok(()),
    }
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl-C, cancelling");
            cancel.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

    /// Reader that fails on every read.
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")))
        }
    }

    fn sh(script: &str, keep_going: bool) -> Options {
        Options {
            jobs: Some(2),
            keep_going,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("parx")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_command_and_args() {
        let options = parse_args(&argv(&["echo", "-n", "hello"])).unwrap();
        assert_eq!(
            options,
            Options {
                jobs: None,
                keep_going: false,
                program: "echo".to_string(),
                args: vec!["-n".to_string(), "hello".to_string()],
            }
        );
    }

    #[test]
    fn parses_flags_before_separator() {
        let options = parse_args(&argv(&["-j", "8", "--keep-going", "--", "curl", "-s"])).unwrap();
        assert_eq!(options.jobs, Some(8));
        assert!(options.keep_going);
        assert_eq!(options.program, "curl");
        assert_eq!(options.args, vec!["-s".to_string()]);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            parse_args(&argv(&["-j", "many", "echo"])).unwrap_err(),
            "invalid job count: many"
        );
        assert_eq!(
            parse_args(&argv(&["--bogus", "echo"])).unwrap_err(),
            "unknown flag: --bogus"
        );
        assert_eq!(
            parse_args(&argv(&["-k"])).unwrap_err(),
            "missing required argument: <command>"
        );
        assert_eq!(parse_args(&argv(&["-j"])).unwrap_err(), "--jobs requires a value");
    }

    #[tokio::test]
    async fn run_command_reports_exit_status() {
        let program: Arc<str> = "sh".into();
        let args: Arc<[String]> = vec!["-c".to_string(), "exit \"$0\"".to_string()].into();

        run_command(Arc::clone(&program), Arc::clone(&args), "0".to_string())
            .await
            .unwrap();

        let err = run_command(program, args, "3".to_string())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("\"3\""), "unexpected error: {err}");
    }

    #[test]
    fn init_tracing_tolerates_existing_subscriber() {
        init_tracing();
        init_tracing();
        tracing::info!("still logging");
    }

    #[tokio::test]
    async fn input_lines_skip_blanks_and_replace_invalid_utf8() {
        let input: &[u8] = b"a\n\xff\xfe\n\n  \r\nb";
        let lines: Vec<String> = input_lines(input)
            .map(|line| line.unwrap())
            .collect()
            .await;

        assert_eq!(lines, vec!["a", "\u{fffd}\u{fffd}", "b"]);
    }

    #[tokio::test]
    async fn input_lines_stop_at_read_error() {
        let input = BufReader::new((&b"a\n"[..]).chain(BrokenPipe));
        let lines: Vec<io::Result<String>> = input_lines(input).collect().await;

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].as_ref().unwrap(), "a");
        assert_eq!(lines[1].as_ref().unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn run_feeds_every_line_past_invalid_utf8() {
        let input: &[u8] = b"a\n\xff\xfe\nb\n";
        let ok = run(sh("test -n \"$0\"", false), input, CancellationToken::new())
            .await
            .unwrap();
        assert!(ok);

        let err = run(sh("test \"$0\" != b", false), input, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("\"b\""), "unexpected error: {err:#}");
    }

    #[tokio::test]
    async fn run_keep_going_reports_failures() {
        let input: &[u8] = b"1\n2\n3\n";
        let ok = run(sh("test \"$0\" != 2", true), input, CancellationToken::new())
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn run_fails_when_input_cannot_be_read() {
        for keep_going in [false, true] {
            let input = BufReader::new((&b"a\n"[..]).chain(BrokenPipe));
            let err = run(sh("exit 0", keep_going), input, CancellationToken::new())
                .await
                .unwrap_err();
            assert!(
                err.to_string().contains("failed to read input"),
                "unexpected error: {err}"
            );
        }
    }
}
