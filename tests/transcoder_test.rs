//! Supervisor tests against a scripted stand-in for the real transcoder
//! binary. Each script receives the same command line ffmpeg would and keys
//! its behavior off the playlist path it is handed as the last argument.

use bytes::Bytes;
use live_relay::{Config, MediaFrame, Session, SessionState, TranscoderError, TranscoderSupervisor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

fn write_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-transcoder.sh");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(script: &Path, retry_limit: u32) -> Config {
    Config {
        transcoder_path: script.to_str().unwrap().to_string(),
        segment_duration: 2,
        retry_limit,
        drain_timeout_secs: 5,
        ..Default::default()
    }
}

fn frame(n: u32) -> MediaFrame {
    MediaFrame::Video {
        timestamp: n * 40,
        data: Bytes::from_static(&[0x27, 0x01, 0x00]),
    }
}

/// Writes two segments and a playlist up front, then consumes stdin until the
/// drain closes it.
const CLEAN_SCRIPT: &str = r#"#!/bin/sh
for last; do :; done
dir=$(dirname "$last")
printf 'seg data 0' > "$dir/seg00000.ts"
printf 'seg data 1' > "$dir/seg00001.ts"
{
  echo '#EXTM3U'
  echo '#EXT-X-VERSION:3'
  echo '#EXT-X-TARGETDURATION:2'
  echo '#EXT-X-MEDIA-SEQUENCE:0'
  echo '#EXTINF:2.000000,'
  echo 'seg00000.ts'
  echo '#EXTINF:1.960000,'
  echo 'seg00001.ts'
} > "$last"
cat > /dev/null
exit 0
"#;

/// Fails immediately without producing any output.
const CRASH_SCRIPT: &str = "#!/bin/sh\nexit 3\n";

/// Publishes one segment per run; the first run then crashes, later runs
/// behave and drain cleanly.
const CRASH_ONCE_SCRIPT: &str = r#"#!/bin/sh
for last; do :; done
dir=$(dirname "$last")
printf 'payload' > "$dir/seg00000.ts"
{
  echo '#EXTM3U'
  echo '#EXTINF:2.000000,'
  echo 'seg00000.ts'
} > "$last"
case "$dir" in
  *run-0) exit 2 ;;
esac
cat > /dev/null
exit 0
"#;

#[tokio::test]
async fn clean_drain_publishes_segments_and_finalizes() {
    let scratch = tempfile::tempdir().unwrap();
    let script = write_script(scratch.path(), CLEAN_SCRIPT);
    let session = Arc::new(Session::new("mystream", 6, 2));

    let supervisor = TranscoderSupervisor::new(
        &config(&script, 1),
        session.clone(),
        scratch.path().join("mystream"),
    );
    let (frames, receiver) = mpsc::channel(16);
    let handle = tokio::spawn(supervisor.run(receiver));

    for n in 0..3 {
        frames.send(frame(n)).await.unwrap();
    }
    drop(frames);

    handle.await.unwrap().unwrap();

    let store = session.store();
    assert_eq!(store.next_sequence(), 2);
    assert_eq!(store.segment(0).unwrap(), Bytes::from("seg data 0"));
    assert_eq!(store.segment(1).unwrap(), Bytes::from("seg data 1"));
    assert!(store.is_ended());

    let manifest = store.manifest().unwrap();
    assert!(manifest.contains("mystream-0.ts"));
    assert!(manifest.contains("#EXT-X-ENDLIST"));
    assert!(!manifest.contains("#EXT-X-DISCONTINUITY"));

    assert_eq!(session.state(), SessionState::Live);
}

#[tokio::test]
async fn repeated_crashes_exhaust_retries() {
    let scratch = tempfile::tempdir().unwrap();
    let script = write_script(scratch.path(), CRASH_SCRIPT);
    let session = Arc::new(Session::new("mystream", 6, 2));

    let supervisor = TranscoderSupervisor::new(
        &config(&script, 3),
        session.clone(),
        scratch.path().join("mystream"),
    );
    // keep the sender alive so the failure is a crash, not a drain
    let (frames, receiver) = mpsc::channel(16);
    let handle = tokio::spawn(supervisor.run(receiver));

    // three consecutive non-zero exits with a limit of three: the supervisor
    // stops after the third, it never spawns a fourth child
    let result = handle.await.unwrap();
    assert!(matches!(
        result,
        Err(TranscoderError::RetriesExhausted { attempts: 3 })
    ));

    let store = session.store();
    assert!(store.is_ended());
    assert!(store.manifest().is_none());
    assert_eq!(store.next_sequence(), 0);
    drop(frames);
}

#[tokio::test]
async fn restart_flags_discontinuity_and_keeps_sequences() {
    let scratch = tempfile::tempdir().unwrap();
    let script = write_script(scratch.path(), CRASH_ONCE_SCRIPT);
    let session = Arc::new(Session::new("mystream", 6, 2));

    let supervisor = TranscoderSupervisor::new(
        &config(&script, 2),
        session.clone(),
        scratch.path().join("mystream"),
    );
    let (frames, receiver) = mpsc::channel(16);
    let handle = tokio::spawn(supervisor.run(receiver));

    // wait for the restarted child to publish its segment, then drain
    let store = session.store().clone();
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while store.next_sequence() < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("restarted transcoder never published");
    drop(frames);

    handle.await.unwrap().unwrap();

    // sequence numbering continued across the restart
    let window: Vec<u64> = store.window().iter().map(|s| s.sequence).collect();
    assert_eq!(window, vec![0, 1]);

    let manifest = store.manifest().unwrap();
    let disc = manifest.find("#EXT-X-DISCONTINUITY").unwrap();
    let second = manifest.find("mystream-1.ts").unwrap();
    assert!(disc < second, "discontinuity must precede the restarted run's first segment");
    assert_eq!(manifest.matches("#EXT-X-DISCONTINUITY").count(), 1);
    assert!(manifest.contains("#EXT-X-ENDLIST"));
}
