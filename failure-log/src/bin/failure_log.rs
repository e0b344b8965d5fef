use std::path::PathBuf;

use anyhow::Context;
use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use clap::Parser;
use clap::Subcommand;
use dsync_failure_log::FailureLogDir;
use dsync_failure_log::LogRole;
use dsync_failure_log::LogSegment;
use dsync_failure_log::RotatedLogReader;
use dsync_failure_log::SegmentFile;
use dsync_failure_log::SegmentState;
use dsync_protocol::FailureRecord;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

const BATCH: usize = 512;

#[derive(Debug, Parser)]
#[command(name = "dsync-failure-log")]
#[command(about = "Inspect and requeue dsync mirror failure logs")]
struct Args {
    /// Directory holding the failure log segments.
    #[arg(long, env = "DSYNC_FAILURE_LOG_DIR")]
    dir: PathBuf,

    /// Deployed version whose log set to inspect.
    #[arg(long = "log-version", env = "DSYNC_VERSION")]
    log_version: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Summarize what is left to repair.
    Status,
    /// List every segment of the version, oldest first.
    List,
    /// Print the records of one segment, flagging lines repair would quarantine.
    Show {
        /// File name of the segment, as printed by `list`.
        file: String,
    },
    /// Move rotated error segments back into the retry queue.
    RequeueErrors,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let dir = FailureLogDir::new(&args.dir, &args.log_version, true);
    dir.ensure_exists().await?;

    match args.command {
        Command::Status => print_status(&dir).await,
        Command::List => print_list(&dir).await,
        Command::Show { file } => print_segment(&dir, &file).await,
        Command::RequeueErrors => {
            let requeued = dir.requeue_errors().await?;
            println!("requeued {} error segment(s)", requeued.len());
            Ok(())
        }
    }
}

async fn print_status(dir: &FailureLogDir) -> anyhow::Result<()> {
    let status = dir.status().await?;
    let pending = status
        .rotated
        .iter()
        .filter(|file| file.segment.role != LogRole::Error)
        .count();
    let errors = status.rotated.len() - pending;
    println!("pending segments:     {pending}");
    println!("error segments:       {errors}");
    println!("active failure logs:  {}", status.active_failure.len());
    println!("open retry/error:     {}", status.active_retry_error.len());
    println!("logically deleted:    {}", status.done);
    if status.is_fully_repaired() {
        println!("{}", "fully repaired".green());
    } else {
        println!("{}", "repair pending".yellow());
    }
    Ok(())
}

async fn print_list(dir: &FailureLogDir) -> anyhow::Result<()> {
    for file in dir.scan().await? {
        println!("{}", format_file(dir, &file));
    }
    Ok(())
}

fn format_file(dir: &FailureLogDir, file: &SegmentFile) -> String {
    let SegmentFile { segment, len, .. } = file;
    let state = match segment.state {
        SegmentState::Active => "active",
        SegmentState::Rotated => "rotated",
        SegmentState::Done => "done",
    };
    let created = format_segment_time(segment);
    format!(
        "{created} {:<7} {state:<7} {len:>10}B {}",
        segment.role.as_str(),
        segment.file_name(dir.version())
    )
}

fn format_segment_time(segment: &LogSegment) -> String {
    i64::try_from(segment.id.get())
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| segment.id.to_string())
}

async fn print_segment(dir: &FailureLogDir, file: &str) -> anyhow::Result<()> {
    let segment = LogSegment::from_file_name(dir.version(), file)
        .with_context(|| format!("{file} is not a segment of version {}", dir.version()))?;
    if segment.state == SegmentState::Active {
        let contents = tokio::fs::read_to_string(dir.path_of(&segment))
            .await
            .with_context(|| format!("failed to read {file}"))?;
        for line in contents.lines() {
            print_line(line);
        }
        return Ok(());
    }

    let mut reader = RotatedLogReader::open(dir, segment).await?;
    loop {
        let batch = reader.read_batch(BATCH).await?;
        if batch.is_empty() {
            break;
        }
        for line in &batch {
            print_line(&line.to_text_lossy());
        }
    }
    reader.close();
    Ok(())
}

fn print_line(line: &str) {
    match FailureRecord::parse(line) {
        Ok(record) => println!(
            "{} {} {}/{} v{} lock={}",
            record.operation,
            record.doc_type,
            record.index_name,
            record.uuid,
            record.es_version,
            if record.lock_key.is_empty() {
                "-"
            } else {
                record.lock_key.as_str()
            }
        ),
        Err(err) => println!("{} {line:?}: {err}", "malformed".red()),
    }
}
