use bytes::Bytes;

/// FLV file header (audio + video flags set) followed by PreviousTagSize0.
pub const FLV_HEADER: [u8; 13] = [
    0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

pub const TAG_TYPE_AUDIO: u8 = 8;
pub const TAG_TYPE_VIDEO: u8 = 9;

const TAG_HEADER_LENGTH: usize = 11;
const PREVIOUS_TAG_SIZE_LENGTH: usize = 4;

/// One demuxed media frame as received from the RTMP session, forwarded from
/// the ingest connection to the transcoder supervisor.
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Audio { timestamp: u32, data: Bytes },
    Video { timestamp: u32, data: Bytes },
}

/// Serialize one frame as an FLV tag (header, payload, PreviousTagSize).
pub fn encode_tag(frame: &MediaFrame) -> Vec<u8> {
    let (tag_type, timestamp, data) = match frame {
        MediaFrame::Audio { timestamp, data } => (TAG_TYPE_AUDIO, *timestamp, data),
        MediaFrame::Video { timestamp, data } => (TAG_TYPE_VIDEO, *timestamp, data),
    };

    let mut out = Vec::with_capacity(TAG_HEADER_LENGTH + data.len() + PREVIOUS_TAG_SIZE_LENGTH);
    out.push(tag_type);

    let size = data.len() as u32;
    out.extend_from_slice(&[(size >> 16) as u8, (size >> 8) as u8, size as u8]);

    // 24-bit timestamp plus the extension byte
    out.extend_from_slice(&[
        (timestamp >> 16) as u8,
        (timestamp >> 8) as u8,
        timestamp as u8,
        (timestamp >> 24) as u8,
    ]);

    // stream id, always 0
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(data);

    let tag_size = (TAG_HEADER_LENGTH + data.len()) as u32;
    out.extend_from_slice(&tag_size.to_be_bytes());
    out
}

// Sequence-header sniffing assumes h264/aac, the codecs RTMP publishers
// overwhelmingly send.
pub fn is_video_sequence_header(data: &Bytes) -> bool {
    data.len() >= 2 && data[0] == 0x17 && data[1] == 0x00
}

pub fn is_audio_sequence_header(data: &Bytes) -> bool {
    data.len() >= 2 && data[0] == 0xaf && data[1] == 0x00
}

/// Caches the codec configuration tags so that a restarted transcoder child
/// receives a stream it can decode from its very first byte.
#[derive(Debug, Default)]
pub struct SequenceHeaderCache {
    video: Option<Bytes>,
    audio: Option<Bytes>,
}

impl SequenceHeaderCache {
    pub fn observe(&mut self, frame: &MediaFrame) {
        match frame {
            MediaFrame::Video { data, .. } if is_video_sequence_header(data) => {
                self.video = Some(data.clone());
            }
            MediaFrame::Audio { data, .. } if is_audio_sequence_header(data) => {
                self.audio = Some(data.clone());
            }
            _ => {}
        }
    }

    /// FLV preamble for a (re)started child: file header plus any cached
    /// configuration tags at timestamp zero.
    pub fn preamble(&self) -> Vec<u8> {
        let mut out = FLV_HEADER.to_vec();
        if let Some(data) = &self.video {
            out.extend_from_slice(&encode_tag(&MediaFrame::Video {
                timestamp: 0,
                data: data.clone(),
            }));
        }
        if let Some(data) = &self.audio {
            out.extend_from_slice(&encode_tag(&MediaFrame::Audio {
                timestamp: 0,
                data: data.clone(),
            }));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_layout() {
        let frame = MediaFrame::Video {
            timestamp: 0x0102_0304,
            data: Bytes::from_static(&[0xaa, 0xbb]),
        };
        let tag = encode_tag(&frame);

        assert_eq!(tag.len(), 11 + 2 + 4);
        assert_eq!(tag[0], TAG_TYPE_VIDEO);
        assert_eq!(&tag[1..4], &[0, 0, 2]); // data size
        assert_eq!(&tag[4..8], &[0x02, 0x03, 0x04, 0x01]); // ts + extension
        assert_eq!(&tag[8..11], &[0, 0, 0]); // stream id
        assert_eq!(&tag[11..13], &[0xaa, 0xbb]);
        assert_eq!(&tag[13..], &13u32.to_be_bytes());
    }

    #[test]
    fn sequence_header_detection() {
        assert!(is_video_sequence_header(&Bytes::from_static(&[0x17, 0x00])));
        assert!(!is_video_sequence_header(&Bytes::from_static(&[0x17, 0x01])));
        assert!(is_audio_sequence_header(&Bytes::from_static(&[0xaf, 0x00])));
        assert!(!is_audio_sequence_header(&Bytes::from_static(&[0xaf, 0x01])));
    }

    #[test]
    fn preamble_replays_cached_headers() {
        let mut cache = SequenceHeaderCache::default();
        assert_eq!(cache.preamble(), FLV_HEADER.to_vec());

        cache.observe(&MediaFrame::Video {
            timestamp: 40,
            data: Bytes::from_static(&[0x17, 0x00, 0x00]),
        });
        cache.observe(&MediaFrame::Audio {
            timestamp: 40,
            data: Bytes::from_static(&[0xaf, 0x00, 0x12]),
        });
        // interleaved frames must not displace the cached headers
        cache.observe(&MediaFrame::Video {
            timestamp: 80,
            data: Bytes::from_static(&[0x27, 0x01]),
        });

        let preamble = cache.preamble();
        assert!(preamble.starts_with(&FLV_HEADER));
        assert!(preamble.len() > FLV_HEADER.len());
        // both cached tags present: two tag headers of 11 bytes plus payloads
        let tags_len = preamble.len() - FLV_HEADER.len();
        assert_eq!(tags_len, (11 + 3 + 4) + (11 + 3 + 4));
    }
}
