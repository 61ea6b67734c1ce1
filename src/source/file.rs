//! File replay source.
//!
//! Container parsing is delegated to a [`Demuxer`]; the source contributes
//! the streaming shape: one synthetic metadata packet up front, frames
//! with chained [`FrameId`]s derived from packet durations, end-of-stream
//! mapped to `complete`, and optional looping that restarts the demuxer
//! while continuing the id chain.

use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::media::{EncodedFrame, EncodedMetadata, EncodedPacket, FrameId, ImageSize};
use crate::streams::{generate, Publisher};

/// One demuxed packet: payload plus its duration in stream epochs.
#[derive(Clone, Debug)]
pub struct DemuxedPacket {
    /// Encoded payload.
    pub data: Bytes,
    /// Number of epochs this packet covers. Must be at least 1.
    pub duration: i64,
    /// Capture timestamp in nanoseconds, when the container knows it.
    pub timestamp: Option<i64>,
}

/// Container reader driven by [`file_source`].
pub trait Demuxer {
    /// Codec metadata for the stream.
    fn metadata(&mut self) -> Result<EncodedMetadata>;

    /// Next packet, or [`Error::EndOfStream`] when the container is
    /// exhausted.
    fn next_packet(&mut self) -> Result<DemuxedPacket>;

    /// Restart at the first packet. Only needed for looping replay.
    fn rewind(&mut self) -> Result<()> {
        Err(Error::StreamInitialization(
            "demuxer does not support rewind".into(),
        ))
    }
}

struct FileState<D> {
    demuxer: D,
    sent_metadata: bool,
    next_i1: i64,
    looping: bool,
}

/// Replay a demuxed container as an [`EncodedPacket`] publisher.
///
/// Frame ids chain across packets: the first frame covers
/// `[0, duration - 1]` and each one after starts at the previous `i2 + 1`.
/// With `looping`, end of file rewinds the demuxer and the chain keeps
/// counting.
pub fn file_source<D: Demuxer + 'static>(demuxer: D, looping: bool) -> Publisher<EncodedPacket> {
    generate(
        move || FileState {
            demuxer,
            sent_metadata: false,
            next_i1: 0,
            looping,
        },
        |state, demand, out| {
            let mut emitted = 0;
            let mut just_rewound = false;
            while emitted < demand {
                if !state.sent_metadata {
                    match state.demuxer.metadata() {
                        Ok(metadata) => {
                            state.sent_metadata = true;
                            emitted += 1;
                            out.on_next(EncodedPacket::Metadata(metadata));
                            continue;
                        }
                        Err(error) => {
                            out.on_error(Error::StreamInitialization(error.to_string()));
                            return;
                        }
                    }
                }
                match state.demuxer.next_packet() {
                    Ok(packet) => {
                        just_rewound = false;
                        let duration = packet.duration.max(1);
                        let id = FrameId::new(state.next_i1, state.next_i1 + duration - 1);
                        state.next_i1 = id.i2 + 1;
                        emitted += 1;
                        out.on_next(EncodedPacket::Frame(EncodedFrame {
                            data: packet.data,
                            id,
                            timestamp: packet.timestamp,
                        }));
                    }
                    Err(Error::EndOfStream) => {
                        if !state.looping || just_rewound {
                            // A rewind that yields nothing means the
                            // container has no packets at all.
                            out.on_complete();
                            return;
                        }
                        debug!("end of file, rewinding");
                        if let Err(error) = state.demuxer.rewind() {
                            out.on_error(error);
                            return;
                        }
                        just_rewound = true;
                    }
                    Err(error) => {
                        out.on_error(error);
                        return;
                    }
                }
            }
        },
    )
}

/// Demuxer for the replay file format.
///
/// A replay file starts with one JSON header line:
///
/// ```json
/// {"codecName": "rawvideo", "codecData": "", "width": 320, "height": 240}
/// ```
///
/// followed by binary packet records, each `u32` little-endian payload
/// length, `i64` little-endian duration, then the payload bytes.
pub struct ReplayDemuxer<R> {
    reader: BufReader<R>,
    data_offset: u64,
    header: EncodedMetadata,
}

impl ReplayDemuxer<std::fs::File> {
    /// Open a replay file from disk.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        Self::new(std::fs::File::open(path)?)
    }
}

impl<R: Read + Seek> ReplayDemuxer<R> {
    /// Read the header and position at the first packet.
    pub fn new(source: R) -> Result<Self> {
        let mut reader = BufReader::new(source);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let header: Value = serde_json::from_str(line.trim_end())
            .map_err(|e| Error::StreamInitialization(format!("replay header: {e}")))?;

        let codec_name = header
            .get("codecName")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::StreamInitialization("replay header missing codecName".into()))?
            .to_owned();
        let codec_data = header
            .get("codecData")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let codec_data = {
            use base64::engine::general_purpose::STANDARD as BASE64;
            use base64::Engine as _;
            Bytes::from(
                BASE64
                    .decode(codec_data)
                    .map_err(|e| Error::StreamInitialization(format!("replay codec data: {e}")))?,
            )
        };
        let image_size = match (
            header.get("width").and_then(Value::as_u64),
            header.get("height").and_then(Value::as_u64),
        ) {
            (Some(width), Some(height)) => Some(ImageSize {
                width: width as u32,
                height: height as u32,
            }),
            _ => None,
        };

        let data_offset = reader.stream_position()?;
        Ok(Self {
            reader,
            data_offset,
            header: EncodedMetadata {
                codec_name,
                codec_data,
                image_size,
            },
        })
    }
}

impl<R: Read + Seek> Demuxer for ReplayDemuxer<R> {
    fn metadata(&mut self) -> Result<EncodedMetadata> {
        Ok(self.header.clone())
    }

    fn next_packet(&mut self) -> Result<DemuxedPacket> {
        let mut length = [0u8; 4];
        match self.reader.read_exact(&mut length) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::EndOfStream);
            }
            Err(e) => return Err(e.into()),
        }
        let mut duration = [0u8; 8];
        self.reader.read_exact(&mut duration)?;

        let length = u32::from_le_bytes(length) as usize;
        let mut data = vec![0u8; length];
        self.reader.read_exact(&mut data)?;

        Ok(DemuxedPacket {
            data: Bytes::from(data),
            duration: i64::from_le_bytes(duration),
            timestamp: None,
        })
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(self.data_offset))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Demuxer double emitting fixed durations.
    pub(crate) struct ScriptedDemuxer {
        durations: Vec<i64>,
        index: usize,
    }

    impl ScriptedDemuxer {
        pub(crate) fn new(durations: Vec<i64>) -> Self {
            Self {
                durations,
                index: 0,
            }
        }
    }

    impl Demuxer for ScriptedDemuxer {
        fn metadata(&mut self) -> Result<EncodedMetadata> {
            Ok(EncodedMetadata {
                codec_name: "h264".into(),
                codec_data: Bytes::from_static(&[1, 2, 3]),
                image_size: None,
            })
        }

        fn next_packet(&mut self) -> Result<DemuxedPacket> {
            let Some(&duration) = self.durations.get(self.index) else {
                return Err(Error::EndOfStream);
            };
            self.index += 1;
            Ok(DemuxedPacket {
                data: Bytes::from_static(b"pkt"),
                duration,
                timestamp: None,
            })
        }

        fn rewind(&mut self) -> Result<()> {
            self.index = 0;
            Ok(())
        }
    }

    #[test]
    fn test_emits_metadata_then_chained_frames() {
        let packets = file_source(ScriptedDemuxer::new(vec![10, 20, 5]), false)
            .collect()
            .unwrap();

        assert!(packets[0].is_metadata());
        let ids: Vec<FrameId> = packets[1..]
            .iter()
            .map(|p| match p {
                EncodedPacket::Frame(f) => f.id,
                EncodedPacket::Metadata(_) => panic!("unexpected metadata"),
            })
            .collect();
        assert_eq!(
            ids,
            vec![
                FrameId::new(0, 9),
                FrameId::new(10, 29),
                FrameId::new(30, 34),
            ]
        );
        for pair in ids.windows(2) {
            assert!(pair[0].precedes(pair[1]));
        }
    }

    #[test]
    fn test_looping_continues_id_chain() {
        use crate::streams::take;

        let packets = (file_source(ScriptedDemuxer::new(vec![10]), true) >> take(4))
            .collect()
            .unwrap();

        let ids: Vec<FrameId> = packets[1..]
            .iter()
            .map(|p| match p {
                EncodedPacket::Frame(f) => f.id,
                EncodedPacket::Metadata(_) => panic!("unexpected metadata"),
            })
            .collect();
        assert_eq!(
            ids,
            vec![
                FrameId::new(0, 9),
                FrameId::new(10, 19),
                FrameId::new(20, 29),
            ]
        );
    }

    #[test]
    fn test_replay_demuxer_round_trip() {
        let mut file = Vec::new();
        file.extend_from_slice(
            br#"{"codecName": "rawvideo", "codecData": "", "width": 4, "height": 2}"#,
        );
        file.push(b'\n');
        for (payload, duration) in [(&b"aaaa"[..], 3i64), (&b"bb"[..], 7)] {
            file.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            file.extend_from_slice(&duration.to_le_bytes());
            file.extend_from_slice(payload);
        }

        let mut demuxer = ReplayDemuxer::new(Cursor::new(file)).unwrap();
        let metadata = demuxer.metadata().unwrap();
        assert_eq!(metadata.codec_name, "rawvideo");
        assert_eq!(
            metadata.image_size,
            Some(ImageSize {
                width: 4,
                height: 2
            })
        );

        let first = demuxer.next_packet().unwrap();
        assert_eq!(&first.data[..], b"aaaa");
        assert_eq!(first.duration, 3);
        let second = demuxer.next_packet().unwrap();
        assert_eq!(&second.data[..], b"bb");
        assert_eq!(second.duration, 7);
        assert!(matches!(demuxer.next_packet(), Err(Error::EndOfStream)));

        demuxer.rewind().unwrap();
        assert_eq!(&demuxer.next_packet().unwrap().data[..], b"aaaa");
    }
}
