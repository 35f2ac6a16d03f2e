use crate::errors;
use anyhow::Context;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn log_path_for(log_directory: &Path, label: &str, pid: u32) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    log_directory.join(format!(
        "{}-{}-{}.log",
        sanitize_filename(label),
        pid,
        timestamp
    ))
}

fn timestamped(stream: &str, line: &str) -> String {
    let timestamp = chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    format!("[{}] [{}] {}\n", timestamp, stream, line)
}

fn report_write_error(log_path: &Path, stream: &str, e: &std::io::Error) {
    if e.to_string().contains("No space left on device") || e.to_string().contains("disk full") {
        tracing::error!(
            "{}",
            errors::disk::full_log_write(&log_path.display().to_string())
        );
    } else {
        tracing::error!("{}", errors::logs::failed_to_write(stream, &e.to_string()));
    }
}

/// Copies a child's stdout and stderr line by line into a timestamped log
/// file. Every stdout line is also handed to `on_stdout`.
pub async fn capture_child_output<F>(
    child: &mut Child,
    log_directory: &Path,
    label: &str,
    cancel: CancellationToken,
    on_stdout: F,
) -> anyhow::Result<(PathBuf, JoinHandle<()>)>
where
    F: FnMut(&str) + Send + 'static,
{
    let pid = child.id().context(errors::process::FAILED_TO_GET_PID)?;
    let stdout = child
        .stdout
        .take()
        .context(errors::process::FAILED_TO_CAPTURE_STDOUT)?;
    let stderr = child
        .stderr
        .take()
        .context(errors::process::FAILED_TO_CAPTURE_STDERR)?;

    capture_output(stdout, stderr, pid, log_directory, label, cancel, on_stdout).await
}

/// Same as [`capture_child_output`] for processes that were not spawned
/// through `tokio::process`.
pub async fn capture_output<O, E, F>(
    stdout: O,
    stderr: E,
    pid: u32,
    log_directory: &Path,
    label: &str,
    cancel: CancellationToken,
    mut on_stdout: F,
) -> anyhow::Result<(PathBuf, JoinHandle<()>)>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
    F: FnMut(&str) + Send + 'static,
{
    let log_path = log_path_for(log_directory, label, pid);

    tokio::fs::create_dir_all(log_directory)
        .await
        .context(errors::logs::FAILED_TO_CREATE_DIR)?;

    let log_file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
        .context(errors::logs::FAILED_TO_CREATE_FILE)?;

    let task_log_path = log_path.clone();
    let task = tokio::spawn(async move {
        let mut log_writer = tokio::io::BufWriter::new(log_file);
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Output capture cancelled for log: {}", task_log_path.display());
                    break;
                }
                result = stdout_lines.next_line(), if stdout_open => {
                    match result {
                        Ok(Some(line)) => {
                            on_stdout(&line);
                            if let Err(e) = log_writer.write_all(timestamped("STDOUT", &line).as_bytes()).await {
                                report_write_error(&task_log_path, "stdout", &e);
                                break;
                            }
                        }
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            tracing::error!("Error reading stdout: {}", e);
                            stdout_open = false;
                        }
                    }
                }
                result = stderr_lines.next_line(), if stderr_open => {
                    match result {
                        Ok(Some(line)) => {
                            if let Err(e) = log_writer.write_all(timestamped("STDERR", &line).as_bytes()).await {
                                report_write_error(&task_log_path, "stderr", &e);
                                break;
                            }
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            tracing::error!("Error reading stderr: {}", e);
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        if let Err(e) = log_writer.flush().await {
            tracing::error!("{}", errors::logs::failed_to_flush(&e.to_string()));
        }
    });

    Ok((log_path, task))
}
