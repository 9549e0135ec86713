use crate::config::Config;
use crate::error::TranscoderError;
use crate::flv::{self, MediaFrame, SequenceHeaderCache};
use crate::playlist;
use crate::session::{Session, SessionState};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub const FRAME_CHANNEL_CAPACITY: usize = 512;

const PLAYLIST_FILE: &str = "index.m3u8";
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const RESTART_BACKOFF_BASE: Duration = Duration::from_millis(200);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Owns the external transcoder process for one session.
///
/// Frames arrive from the ingest connection on a bounded channel and are
/// re-muxed as FLV onto the child's stdin. The child writes numbered segment
/// files plus a playlist into a per-run directory; a poller publishes each
/// completed segment into the session's segment store. Exit code 0 after
/// stdin closes is a clean finalize, anything else while live triggers the
/// restart policy.
pub struct TranscoderSupervisor {
    session: Arc<Session>,
    transcoder_path: String,
    out_dir: PathBuf,
    segment_duration: u32,
    retry_limit: u32,
    drain_timeout: Duration,
    headers: SequenceHeaderCache,
}

enum RunOutcome {
    /// Ingest finished; stdin has been closed
    Drained,
    /// Child exited while the session was live
    Exited(Option<ExitStatus>),
}

impl TranscoderSupervisor {
    pub fn new(config: &Config, session: Arc<Session>, out_dir: PathBuf) -> Self {
        Self {
            session,
            transcoder_path: config.transcoder_path.clone(),
            out_dir,
            segment_duration: config.segment_duration,
            retry_limit: config.retry_limit,
            drain_timeout: config.drain_timeout(),
            headers: SequenceHeaderCache::default(),
        }
    }

    /// Drive the child process until the frame channel closes (drain) or the
    /// retry budget is spent (fatal, surfaced to the ingest side).
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<MediaFrame>,
    ) -> Result<(), TranscoderError> {
        let key = self.session.key().to_string();
        let mut failures: u32 = 0;
        let mut attempt: u32 = 0;
        let mut last_error: Option<TranscoderError> = None;

        loop {
            let run_dir = self.out_dir.join(format!("run-{attempt}"));
            let mut child = match self.prepare(&run_dir).await {
                Ok(child) => child,
                Err(err) => {
                    failures += 1;
                    warn!(%key, %err, failures, "Transcoder start failed");
                    last_error = Some(err);
                    if failures >= self.retry_limit {
                        break;
                    }
                    tokio::time::sleep(backoff(failures)).await;
                    attempt += 1;
                    continue;
                }
            };

            let restarted = attempt > 0;
            let mut published_in_run = 0usize;
            let outcome = self
                .drive(&mut child, &run_dir, &mut frames, &mut published_in_run, restarted)
                .await;

            match outcome {
                RunOutcome::Drained => {
                    match tokio::time::timeout(self.drain_timeout, child.wait()).await {
                        Ok(Ok(status)) if status.success() => {
                            debug!(%key, "Transcoder finalized cleanly");
                        }
                        Ok(Ok(status)) => {
                            warn!(%key, %status, "Transcoder exited uncleanly during drain");
                        }
                        Ok(Err(err)) => {
                            warn!(%key, %err, "Failed waiting for transcoder during drain");
                        }
                        Err(_) => {
                            warn!(%key, "Drain timeout expired, killing transcoder");
                            let _ = child.kill().await;
                        }
                    }
                    // pick up whatever the child flushed on its way out
                    self.collect(&run_dir, &mut published_in_run, restarted).await;
                    self.session.store().end();
                    info!(%key, "Transcoder drained");
                    return Ok(());
                }
                RunOutcome::Exited(status) => {
                    // segments flushed just before the crash are still valid
                    self.collect(&run_dir, &mut published_in_run, restarted).await;
                    failures += 1;
                    match status {
                        Some(status) => {
                            warn!(%key, %status, failures, "Transcoder exited while live");
                            last_error = Some(TranscoderError::Exited(status));
                        }
                        None => warn!(%key, failures, "Transcoder vanished while live"),
                    }
                    if failures >= self.retry_limit {
                        break;
                    }
                    tokio::time::sleep(backoff(failures)).await;
                    attempt += 1;
                }
            }
        }

        self.session.store().end();
        error!(%key, attempts = failures, ?last_error, "Transcoder retries exhausted");
        Err(TranscoderError::RetriesExhausted { attempts: failures })
    }

    async fn prepare(&self, run_dir: &Path) -> Result<Child, TranscoderError> {
        tokio::fs::create_dir_all(run_dir).await?;
        self.spawn(run_dir)
    }

    fn spawn(&self, run_dir: &Path) -> Result<Child, TranscoderError> {
        let mut command = Command::new(&self.transcoder_path);
        command
            .arg("-hide_banner")
            .args(["-loglevel", "error"])
            .args(["-f", "flv"])
            .args(["-i", "pipe:0"])
            .args(["-c", "copy"])
            .args(["-f", "hls"])
            .args(["-hls_time", &self.segment_duration.to_string()])
            .args(["-hls_list_size", "0"])
            .args(["-hls_flags", "temp_file"])
            .arg("-hls_segment_filename")
            .arg(run_dir.join("seg%05d.ts"))
            .arg(run_dir.join(PLAYLIST_FILE))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        command.spawn().map_err(|source| TranscoderError::Spawn {
            path: self.transcoder_path.clone(),
            source,
        })
    }

    async fn drive(
        &mut self,
        child: &mut Child,
        run_dir: &Path,
        frames: &mut mpsc::Receiver<MediaFrame>,
        published_in_run: &mut usize,
        restarted: bool,
    ) -> RunOutcome {
        let Some(mut stdin) = child.stdin.take() else {
            return RunOutcome::Exited(child.wait().await.ok());
        };

        if stdin.write_all(&self.headers.preamble()).await.is_err() {
            return RunOutcome::Exited(child.wait().await.ok());
        }

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_frame = frames.recv() => match maybe_frame {
                    Some(frame) => {
                        self.headers.observe(&frame);
                        if stdin.write_all(&flv::encode_tag(&frame)).await.is_err() {
                            return RunOutcome::Exited(child.wait().await.ok());
                        }
                    }
                    None => {
                        // ingest is done; closing stdin asks the child to flush
                        drop(stdin);
                        return RunOutcome::Drained;
                    }
                },
                status = child.wait() => {
                    return RunOutcome::Exited(status.ok());
                }
                _ = poll.tick() => {
                    self.collect(run_dir, published_in_run, restarted).await;
                }
            }
        }
    }

    /// Publish every playlist entry the child has completed since the last
    /// sweep. Publish order matches playlist order, so segment bytes are
    /// always retrievable before any manifest snapshot references them.
    async fn collect(&self, run_dir: &Path, published_in_run: &mut usize, restarted: bool) {
        let content = match tokio::fs::read_to_string(run_dir.join(PLAYLIST_FILE)).await {
            Ok(content) => content,
            // nothing written yet
            Err(_) => return,
        };

        let store = self.session.store();
        for entry in playlist::parse(&content).entries.iter().skip(*published_in_run) {
            let path = run_dir.join(&entry.uri);
            let data = match tokio::fs::read(&path).await {
                Ok(data) => Bytes::from(data),
                Err(err) => {
                    warn!(key = %self.session.key(), uri = %entry.uri, %err, "Listed segment unreadable, retrying next sweep");
                    return;
                }
            };

            let discontinuity = restarted && *published_in_run == 0 && store.next_sequence() > 0;
            let sequence = store.publish(entry.duration_ms, data, discontinuity);
            *published_in_run += 1;

            if self.session.state() == SessionState::Connecting {
                self.session.advance(SessionState::Live);
                info!(key = %self.session.key(), "Stream is live");
            }
            debug!(
                key = %self.session.key(),
                sequence,
                duration_ms = entry.duration_ms,
                discontinuity,
                "Published segment"
            );

            // the store owns the bytes now; keep the run directory bounded
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}

fn backoff(failures: u32) -> Duration {
    RESTART_BACKOFF_BASE
        .saturating_mul(1 << failures.saturating_sub(1).min(10))
        .min(RESTART_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        assert_eq!(backoff(1), Duration::from_millis(200));
        assert_eq!(backoff(2), Duration::from_millis(400));
        assert_eq!(backoff(3), Duration::from_millis(800));
        assert_eq!(backoff(20), RESTART_BACKOFF_CAP);
    }
}
