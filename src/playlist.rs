/// Minimal reader for the media playlist the transcoder process writes.
///
/// Only the pieces of the format the supervisor needs: `#EXTINF` durations,
/// segment URIs, and the end marker. Attribute lines it does not know are
/// skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub duration_ms: u64,
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Playlist {
    pub entries: Vec<PlaylistEntry>,
    pub ended: bool,
}

pub fn parse(content: &str) -> Playlist {
    let mut playlist = Playlist::default();
    let mut pending_duration: Option<u64> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration = rest
                .split(',')
                .next()
                .and_then(|d| d.trim().parse::<f64>().ok())
                .unwrap_or(0.0);
            pending_duration = Some((duration * 1000.0).round() as u64);
        } else if line == "#EXT-X-ENDLIST" {
            playlist.ended = true;
        } else if !line.starts_with('#') {
            playlist.entries.push(PlaylistEntry {
                duration_ms: pending_duration.take().unwrap_or(0),
                uri: line.to_string(),
            });
        }
    }

    playlist
}
