use crate::config::{Config, is_well_formed_key};
use crate::error::{IngestError, TranscoderError};
use crate::flv::MediaFrame;
use crate::registry::StreamRegistry;
use crate::session::{Session, SessionState};
use crate::transcoder::{FRAME_CHANNEL_CAPACITY, TranscoderSupervisor};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BUFFER_SIZE: usize = 4096;

/// Accepts RTMP publishers and runs one task per connection.
pub struct IngestListener {
    config: Arc<Config>,
    registry: Arc<StreamRegistry>,
    sessions_dir: PathBuf,
}

impl IngestListener {
    pub fn new(config: Arc<Config>, registry: Arc<StreamRegistry>, sessions_dir: PathBuf) -> Self {
        Self {
            config,
            registry,
            sessions_dir,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.ingest_port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, app = %self.config.app_name, "Ingest listener ready");

        loop {
            let (socket, peer) = listener.accept().await?;
            debug!(%peer, "Publisher connected");
            let connection = IngestConnection {
                config: self.config.clone(),
                registry: self.registry.clone(),
                sessions_dir: self.sessions_dir.clone(),
                publish: None,
            };
            tokio::spawn(async move {
                if let Err(err) = connection.serve(socket).await {
                    warn!(%peer, %err, "Ingest connection failed");
                }
            });
        }
    }
}

/// Publishing half of one accepted connection. `frames` is dropped to signal
/// drain; `supervisor` is taken once awaited so it is never polled twice.
struct Publishing {
    session: Arc<Session>,
    frames: Option<mpsc::Sender<MediaFrame>>,
    supervisor: Option<JoinHandle<Result<(), TranscoderError>>>,
    dir: PathBuf,
}

struct IngestConnection {
    config: Arc<Config>,
    registry: Arc<StreamRegistry>,
    sessions_dir: PathBuf,
    publish: Option<Publishing>,
}

impl IngestConnection {
    async fn serve(mut self, mut socket: TcpStream) -> Result<(), IngestError> {
        let _ = socket.set_nodelay(true);
        let result = self.run_session(&mut socket).await;
        self.teardown().await;
        result
    }

    async fn run_session(&mut self, socket: &mut TcpStream) -> Result<(), IngestError> {
        let remaining = handshake(socket).await?;

        let (mut rtmp, initial) =
            ServerSession::new(ServerSessionConfig::new()).map_err(protocol_error)?;
        let mut results: VecDeque<ServerSessionResult> = initial.into();
        if !remaining.is_empty() {
            results.extend(rtmp.handle_input(&remaining).map_err(protocol_error)?);
        }

        let mut buffer = [0u8; BUFFER_SIZE];
        loop {
            while let Some(result) = results.pop_front() {
                match result {
                    ServerSessionResult::OutboundResponse(packet) => {
                        socket.write_all(&packet.bytes).await?;
                    }
                    ServerSessionResult::RaisedEvent(event) => {
                        results.extend(self.handle_event(&mut rtmp, event).await?);
                    }
                    ServerSessionResult::UnhandleableMessageReceived(_) => {}
                }
            }

            tokio::select! {
                read = socket.read(&mut buffer) => {
                    let read = read?;
                    if read == 0 {
                        debug!("Publisher disconnected");
                        return Ok(());
                    }
                    results.extend(
                        rtmp.handle_input(&buffer[..read]).map_err(protocol_error)?,
                    );
                }
                result = Self::supervisor_done(&mut self.publish) => {
                    // Ok means the drain we requested finished; Err is a
                    // fatal transcoder failure that closes the session.
                    return result.map_err(IngestError::from);
                }
            }
        }
    }

    /// Resolves when the transcoder task finishes; pends forever while no
    /// publish is active so it can sit in the select loop unconditionally.
    async fn supervisor_done(
        publish: &mut Option<Publishing>,
    ) -> Result<(), TranscoderError> {
        let Some(publishing) = publish.as_mut() else {
            return std::future::pending().await;
        };
        let Some(handle) = publishing.supervisor.as_mut() else {
            return std::future::pending().await;
        };
        let result = handle.await;
        publishing.supervisor = None;
        match result {
            Ok(result) => result,
            Err(join_error) => Err(TranscoderError::Io(std::io::Error::other(join_error))),
        }
    }

    async fn handle_event(
        &mut self,
        rtmp: &mut ServerSession,
        event: ServerSessionEvent,
    ) -> Result<Vec<ServerSessionResult>, IngestError> {
        match event {
            ServerSessionEvent::ConnectionRequested {
                request_id,
                app_name,
            } => {
                if app_name != self.config.app_name {
                    return Err(IngestError::UnknownApp(app_name));
                }
                rtmp.accept_request(request_id).map_err(protocol_error)
            }
            ServerSessionEvent::PublishStreamRequested {
                request_id,
                stream_key,
                ..
            } => {
                self.begin_publish(&stream_key)?;
                info!(key = %stream_key, "Publish accepted");
                rtmp.accept_request(request_id).map_err(protocol_error)
            }
            ServerSessionEvent::PublishStreamFinished { stream_key, .. } => {
                info!(key = %stream_key, "Publish finished, draining");
                if let Some(publish) = &mut self.publish {
                    if publish.session.state() == SessionState::Live {
                        publish.session.advance(SessionState::Draining);
                    }
                    // closing the channel tells the supervisor to drain
                    publish.frames = None;
                }
                Ok(Vec::new())
            }
            ServerSessionEvent::StreamMetadataChanged {
                stream_key,
                metadata,
                ..
            } => {
                debug!(key = %stream_key, ?metadata, "Stream metadata updated");
                Ok(Vec::new())
            }
            ServerSessionEvent::AudioDataReceived {
                data, timestamp, ..
            } => {
                self.forward(MediaFrame::Audio {
                    timestamp: timestamp.value,
                    data,
                })
                .await;
                Ok(Vec::new())
            }
            ServerSessionEvent::VideoDataReceived {
                data, timestamp, ..
            } => {
                self.forward(MediaFrame::Video {
                    timestamp: timestamp.value,
                    data,
                })
                .await;
                Ok(Vec::new())
            }
            other => {
                debug!(?other, "Ignoring rtmp event");
                Ok(Vec::new())
            }
        }
    }

    fn begin_publish(&mut self, key: &str) -> Result<(), IngestError> {
        if self.publish.is_some() {
            return Err(IngestError::Protocol(
                "second publish on one connection".into(),
            ));
        }
        self.authorize_key(key)?;

        let session = self.registry.register(
            key,
            self.config.window_size,
            self.config.segment_duration,
        )?;
        let dir = self.sessions_dir.join(key);
        let (frames, receiver) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let supervisor = TranscoderSupervisor::new(&self.config, session.clone(), dir.clone());
        let handle = tokio::spawn(supervisor.run(receiver));

        self.publish = Some(Publishing {
            session,
            frames: Some(frames),
            supervisor: Some(handle),
            dir,
        });
        Ok(())
    }

    fn authorize_key(&self, key: &str) -> Result<(), IngestError> {
        if !is_well_formed_key(key) {
            return Err(IngestError::InvalidKey(key.to_string()));
        }
        if let Some(allowed) = &self.config.allowed_keys
            && !allowed.iter().any(|k| k == key)
        {
            return Err(IngestError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    async fn forward(&mut self, frame: MediaFrame) {
        let Some(publish) = &self.publish else { return };
        let Some(frames) = &publish.frames else { return };
        // a closed channel means the supervisor ended; the select loop
        // surfaces that on its next turn
        let _ = frames.send(frame).await;
    }

    /// Runs on every exit path. Drains the transcoder if it is still running,
    /// closes the session and releases the key.
    async fn teardown(&mut self) {
        let Some(mut publish) = self.publish.take() else {
            return;
        };
        let key = publish.session.key().to_string();

        // A supervisor that already finished with an error is the hard-fatal
        // path; the session goes Live to Closed directly, never Draining.
        if should_drain(publish.session.state(), publish.supervisor.is_some()) {
            publish.session.advance(SessionState::Draining);
        }
        drop(publish.frames.take());

        if let Some(handle) = publish.supervisor.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%key, %err, "Transcoder ended with error"),
                Err(err) => warn!(%key, %err, "Transcoder task panicked"),
            }
        }

        publish.session.advance(SessionState::Closed);
        self.registry.unregister(&key);
        if let Err(err) = tokio::fs::remove_dir_all(&publish.dir).await {
            debug!(%key, %err, "Session directory cleanup failed");
        }
        info!(%key, "Session closed");
    }
}

async fn handshake(socket: &mut TcpStream) -> Result<Vec<u8>, IngestError> {
    let mut handshake = Handshake::new(PeerType::Server);
    let mut buffer = [0u8; BUFFER_SIZE];
    loop {
        let read = socket.read(&mut buffer).await?;
        if read == 0 {
            return Err(IngestError::Protocol(
                "socket closed during handshake".into(),
            ));
        }
        match handshake.process_bytes(&buffer[..read]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                if !response_bytes.is_empty() {
                    socket.write_all(&response_bytes).await?;
                }
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                debug!("Rtmp handshake completed");
                if !response_bytes.is_empty() {
                    socket.write_all(&response_bytes).await?;
                }
                return Ok(remaining_bytes);
            }
            Err(err) => return Err(protocol_error(err)),
        }
    }
}

fn protocol_error<E: std::fmt::Debug>(err: E) -> IngestError {
    IngestError::Protocol(format!("{err:?}"))
}

/// Draining only applies to a live session whose supervisor is still running
/// and can be asked to flush.
fn should_drain(state: SessionState, supervisor_running: bool) -> bool {
    supervisor_running && state == SessionState::Live
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(config: Config) -> IngestConnection {
        IngestConnection {
            config: Arc::new(config),
            registry: Arc::new(StreamRegistry::new()),
            sessions_dir: PathBuf::from("."),
            publish: None,
        }
    }

    #[test]
    fn any_well_formed_key_allowed_by_default() {
        let conn = connection(Config::default());
        assert!(conn.authorize_key("mystream").is_ok());
        assert!(matches!(
            conn.authorize_key("bad key"),
            Err(IngestError::InvalidKey(_))
        ));
    }

    #[test]
    fn allow_list_restricts_keys() {
        let conn = connection(Config {
            allowed_keys: Some(vec!["mystream".into()]),
            ..Default::default()
        });
        assert!(conn.authorize_key("mystream").is_ok());
        assert!(matches!(
            conn.authorize_key("otherstream"),
            Err(IngestError::InvalidKey(_))
        ));
    }

    #[test]
    fn draining_requires_a_live_session_and_a_running_supervisor() {
        assert!(should_drain(SessionState::Live, true));
        // supervisor already gone: the fatal path, Live goes straight to Closed
        assert!(!should_drain(SessionState::Live, false));
        assert!(!should_drain(SessionState::Connecting, true));
        assert!(!should_drain(SessionState::Draining, true));
    }

    #[tokio::test]
    async fn fatal_teardown_closes_live_session_directly() {
        let mut conn = connection(Config::default());
        let session = conn.registry.register("mystream", 3, 2).unwrap();
        session.store().publish(2000, bytes::Bytes::from("x"), false);
        session.advance(SessionState::Live);

        // after a supervisor failure the select loop has consumed the handle
        conn.publish = Some(Publishing {
            session: session.clone(),
            frames: None,
            supervisor: None,
            dir: std::env::temp_dir().join("live-relay-ingest-test-mystream"),
        });
        conn.teardown().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert!(conn.registry.lookup("mystream").is_err());
    }

    #[test]
    fn second_publish_rejected() {
        let mut conn = connection(Config::default());
        let session = conn.registry.register("mystream", 3, 2).unwrap();
        conn.publish = Some(Publishing {
            session,
            frames: None,
            supervisor: None,
            dir: PathBuf::from("."),
        });
        assert!(matches!(
            conn.begin_publish("otherstream"),
            Err(IngestError::Protocol(_))
        ));
    }
}
