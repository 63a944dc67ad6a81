use tracing::debug;
use tracing::warn;

/// Marks the end of a frame.
pub(crate) const LF: u8 = 0x0a;
/// Marks a chunk that continues the frame.
pub(crate) const CR: u8 = 0x0d;
/// Optional start-of-frame marker on a leading chunk.
pub(crate) const STX: u8 = 0x02;

/// How a single notification is folded into the frame in progress.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChunkKind {
    /// Ends with LF. Closes the frame.
    Terminator,
    /// Ends with CR. Appended.
    Continuation,
    /// No trailing sentinel. The head of the record, which the transport tends to deliver
    /// after the continuation part, so it is prepended.
    Leading,
}

impl ChunkKind {
    /// Classify a non-empty chunk by its last byte.
    pub fn of(chunk: &[u8]) -> Option<Self> {
        match chunk.last()? {
            &LF => Some(Self::Terminator),
            &CR => Some(Self::Continuation),
            _ => Some(Self::Leading),
        }
    }
}

/// Reassembles one ASCII record from the notifications it was split across.
///
/// The record has no length prefix. Chunk boundaries are only marked by a trailing
/// CR (more to come) or LF (done), and the leading part of the record can arrive after
/// the continuation part. See [`ChunkKind`] for the rules.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    frame: Vec<u8>,
    malformed_chunks: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a chunk into the frame in progress.
    ///
    /// Returns the completed frame when the chunk is a terminator. The buffer is empty
    /// afterwards, whether or not the frame turns out to be decodable.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        if !chunk.is_ascii() {
            self.malformed_chunks += 1;
            warn!(
                chunk = %hex::encode(chunk),
                malformed_chunks = self.malformed_chunks,
                "Dropping non-ASCII chunk"
            );
            return None;
        }

        let Some(kind) = ChunkKind::of(chunk) else {
            debug!("Ignoring empty chunk");
            return None;
        };

        let payload = &chunk[..chunk.len() - 1];
        match kind {
            ChunkKind::Terminator => {
                let payload = payload.strip_suffix(&[CR]).unwrap_or(payload);
                self.frame.extend_from_slice(payload);
                Some(std::mem::take(&mut self.frame))
            }
            ChunkKind::Continuation => {
                self.frame.extend_from_slice(payload);
                None
            }
            ChunkKind::Leading => {
                let payload = chunk.strip_prefix(&[STX]).unwrap_or(chunk);
                self.frame.splice(0..0, payload.iter().copied());
                None
            }
        }
    }

    /// Discard any partial frame. The malformed chunk count is kept.
    pub fn reset(&mut self) {
        self.frame.clear();
    }

    /// The bytes of the frame assembled so far.
    pub fn pending(&self) -> &[u8] {
        &self.frame
    }

    /// How many chunks have been dropped for not being ASCII.
    pub fn malformed_chunks(&self) -> u64 {
        self.malformed_chunks
    }
}

#[test]
fn test_continuation_is_appended() {
    let mut buffer = FrameBuffer::new();
    assert_eq!(buffer.push(b"0011\r"), None);
    assert_eq!(buffer.push(b"28050\r"), None);
    assert_eq!(buffer.pending(), b"001128050");
}

#[test]
fn test_leading_is_prepended() {
    let mut buffer = FrameBuffer::new();
    buffer.push(b"00128000050128\r");
    buffer.push(b"001128050");
    assert_eq!(buffer.pending(), b"00112805000128000050128");
}

#[test]
fn test_leading_stx_is_stripped() {
    let mut buffer = FrameBuffer::new();
    buffer.push(b"tail\r");
    buffer.push(b"\x02head");
    assert_eq!(buffer.pending(), b"headtail");
}

#[test]
fn test_lone_terminator_completes_frame_and_resets() {
    let mut buffer = FrameBuffer::new();
    buffer.push(b"00128000050128\r");
    buffer.push(b"001128050");
    let frame = buffer.push(b"\n").unwrap();
    assert_eq!(frame, b"00112805000128000050128".to_vec());
    assert!(buffer.pending().is_empty());
}

#[test]
fn test_terminator_with_payload_appends_before_completing() {
    let mut buffer = FrameBuffer::new();
    buffer.push(b"abc\r");
    assert_eq!(buffer.push(b"def\r\n").unwrap(), b"abcdef".to_vec());
    assert_eq!(buffer.push(b"\n").unwrap(), Vec::<u8>::new());
}

#[test]
fn test_non_ascii_chunk_leaves_buffer_untouched() {
    let mut buffer = FrameBuffer::new();
    buffer.push(b"abc\r");
    assert_eq!(buffer.push(&[0x41, 0xff, 0x0d]), None);
    assert_eq!(buffer.pending(), b"abc");
    assert_eq!(buffer.malformed_chunks(), 1);

    buffer.reset();
    assert!(buffer.pending().is_empty());
    assert_eq!(buffer.malformed_chunks(), 1);
}

#[test]
fn test_empty_chunk_is_ignored() {
    let mut buffer = FrameBuffer::new();
    buffer.push(b"abc\r");
    assert_eq!(buffer.push(b""), None);
    assert_eq!(buffer.pending(), b"abc");
    assert_eq!(buffer.malformed_chunks(), 0);
}

#[test]
fn test_chunk_kind() {
    assert_eq!(ChunkKind::of(b"\n"), Some(ChunkKind::Terminator));
    assert_eq!(ChunkKind::of(b"12\r"), Some(ChunkKind::Continuation));
    assert_eq!(ChunkKind::of(b"12"), Some(ChunkKind::Leading));
    assert_eq!(ChunkKind::of(b""), None);
}
