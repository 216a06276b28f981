//! Print a framed log record stream as JSON lines.
//!
//! Usage:
//!   slp [OPTIONS] [FILE]
//!   producer | slp --filter 'level == "ERROR"'
//!
//! Records are written to stdout, one JSON object per line. Diagnostics go to stderr and are
//! controlled by `RUST_LOG` (default `warn`). Ctrl-C stops reading at the next frame boundary.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use logproto::{CancellationToken, EvalErrorPolicy, ReaderConfig};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, IsTerminal, Read, Write};
use std::ops::ControlFlow;
use std::path::PathBuf;

/// slp - print logproto record streams as JSON lines
#[derive(Parser, Debug)]
#[command(name = "slp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input file (reads stdin when omitted)
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Only print records for which this expression is true
    #[arg(long, short)]
    filter: Option<String>,

    /// What to do when the filter fails on a record
    #[arg(long, value_enum, default_value_t = OnFilterError::Abort)]
    on_filter_error: OnFilterError,

    /// Largest accepted frame payload, in bytes
    #[arg(long, default_value_t = logproto::frame::DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnFilterError {
    Abort,
    Skip,
}

impl From<OnFilterError> for EvalErrorPolicy {
    fn from(v: OnFilterError) -> Self {
        match v {
            OnFilterError::Abort => EvalErrorPolicy::Abort,
            OnFilterError::Skip => EvalErrorPolicy::Skip,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let program = args
        .filter
        .as_deref()
        .map(logproto::compile)
        .transpose()
        .context("invalid filter")?;

    let source: Box<dyn Read + Send> = match &args.file {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("open {}", path.display()))?,
        )),
        None if io::stdin().is_terminal() => bail!("missing file argument"),
        None => Box::new(io::stdin()),
    };

    let config = ReaderConfig {
        max_frame_len: args.max_frame_len,
        eval_error_policy: args.on_filter_error.into(),
        ..ReaderConfig::default()
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let reader = tokio::task::spawn_blocking(move || -> Result<()> {
        let stdout = io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        let mut write_err = None;
        let result = logproto::read_filtered(&cancel, source, program.as_ref(), &config, |record| {
            let line = serde_json::to_writer(&mut out, &record)
                .map_err(io::Error::from)
                .and_then(|()| out.write_all(b"\n"));
            match line {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    write_err = Some(e);
                    ControlFlow::Break(())
                }
            }
        });
        match result {
            Ok(summary) => tracing::debug!(?summary, "done"),
            Err(e) if e.is_cancelled() => tracing::info!("interrupted"),
            Err(e) => {
                out.flush().ok();
                return Err(e).context("read failed");
            }
        }
        match write_err {
            Some(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            Some(e) => Err(e).context("write stdout"),
            None => out.flush().context("write stdout"),
        }
    });

    reader.await.context("reader task")?
}
