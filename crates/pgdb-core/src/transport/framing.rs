//! Wire-level framing: serializes a [`Message`], optionally compresses or
//! splits it, and reassembles split messages on the receiving side
//! (spec.md §4.4, §6).
//!
//! Every frame on the wire is a one-byte tag followed by a `u32` length
//! prefix and that many payload bytes. A frame's payload is always itself
//! a bincode-serialized [`Message`]; `Compressed` additionally zstd-codes
//! that payload before it hits the wire.

use std::collections::HashMap;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::message::Message;

/// How a frame's payload bytes should be interpreted before bincode
/// deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Data,
    Compressed,
}

impl FrameTag {
    fn to_byte(self) -> u8 {
        match self {
            FrameTag::Data => 0,
            FrameTag::Compressed => 1,
        }
    }

    fn from_byte(b: u8) -> io::Result<Self> {
        match b {
            0 => Ok(FrameTag::Data),
            1 => Ok(FrameTag::Compressed),
            other => Err(io::Error::other(format!("unknown frame tag {other}"))),
        }
    }
}

/// Thresholds governing when a message is compressed or split. The zero
/// value disables both (single uncompressed frame for everything).
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    /// Messages serializing larger than this are zstd-compressed and sent
    /// as a single `Compressed` frame instead of being split.
    pub compress_threshold: usize,
    /// Messages serializing larger than this (and not compressed) are
    /// split into `MultiHeader` + N `MultiPayload` sub-messages.
    pub split_threshold: usize,
    /// Payload size of each split chunk.
    pub chunk_size: usize,
    pub zstd_level: i32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        FrameConfig {
            compress_threshold: 64 * 1024,
            split_threshold: 16 * 1024,
            chunk_size: 8 * 1024,
            zstd_level: 3,
        }
    }
}

/// Serializes `msg`, applying compression or splitting per `cfg`, and
/// returns the ordered sequence of frames to write to the wire.
pub fn encode_message(msg: &Message, cfg: &FrameConfig) -> io::Result<Vec<(FrameTag, Vec<u8>)>> {
    let raw = bincode::serialize(msg).map_err(io::Error::other)?;

    if raw.len() > cfg.compress_threshold {
        let compressed = zstd::encode_all(&raw[..], cfg.zstd_level)?;
        return Ok(vec![(FrameTag::Compressed, compressed)]);
    }

    if raw.len() <= cfg.split_threshold {
        return Ok(vec![(FrameTag::Data, raw)]);
    }

    let chunks: Vec<&[u8]> = raw.chunks(cfg.chunk_size.max(1)).collect();
    let mut frames = Vec::with_capacity(chunks.len() + 1);
    let header = Message::MultiHeader { count: chunks.len() as u32 };
    frames.push((FrameTag::Data, bincode::serialize(&header).map_err(io::Error::other)?));
    for chunk in chunks {
        let payload = Message::MultiPayload { data: chunk.to_vec() };
        frames.push((FrameTag::Data, bincode::serialize(&payload).map_err(io::Error::other)?));
    }
    Ok(frames)
}

/// Writes one length-prefixed, tagged frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, tag: FrameTag, bytes: &[u8]) -> io::Result<()> {
    w.write_u8(tag.to_byte()).await?;
    w.write_u32(bytes.len() as u32).await?;
    w.write_all(bytes).await?;
    w.flush().await
}

/// Writes every frame produced by [`encode_message`] in order.
pub async fn send_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message, cfg: &FrameConfig) -> io::Result<()> {
    for (tag, bytes) in encode_message(msg, cfg)? {
        write_frame(w, tag, &bytes).await?;
    }
    Ok(())
}

/// Reads one length-prefixed, tagged frame, decompressing it if tagged
/// `Compressed`. Returns the raw bytes a single [`Message`] bincode-decodes
/// from.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
    let tag = FrameTag::from_byte(r.read_u8().await?)?;
    let len = r.read_u32().await? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    match tag {
        FrameTag::Data => Ok(buf),
        FrameTag::Compressed => zstd::decode_all(&buf[..]),
    }
}

/// Per-source accumulator for split messages. A relay or front-end keeps
/// one of these per child stream.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Option<PendingSplit>,
}

#[derive(Debug)]
struct PendingSplit {
    expected: u32,
    chunks: Vec<Vec<u8>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one frame's decoded bytes in. Returns `Some(message)` once a
    /// complete logical message (single-frame or fully reassembled split)
    /// is available.
    pub fn feed(&mut self, raw: Vec<u8>) -> io::Result<Option<Message>> {
        let msg: Message = bincode::deserialize(&raw).map_err(io::Error::other)?;
        match msg {
            Message::MultiHeader { count } => {
                self.pending = Some(PendingSplit { expected: count, chunks: Vec::with_capacity(count as usize) });
                Ok(None)
            }
            Message::MultiPayload { data } => {
                let pending = self
                    .pending
                    .as_mut()
                    .ok_or_else(|| io::Error::other("multi-payload received with no multi-header"))?;
                pending.chunks.push(data);
                if pending.chunks.len() as u32 == pending.expected {
                    let pending = self.pending.take().expect("checked Some above");
                    let full: Vec<u8> = pending.chunks.into_iter().flatten().collect();
                    let reassembled: Message = bincode::deserialize(&full).map_err(io::Error::other)?;
                    Ok(Some(reassembled))
                } else {
                    Ok(None)
                }
            }
            other => Ok(Some(other)),
        }
    }
}

/// Tracks one [`Reassembler`] per named source (child relay or back-end),
/// so a parent with many children can demultiplex frames arriving on a
/// shared stream without them interleaving into each other's splits.
#[derive(Debug, Default)]
pub struct MultiSourceReassembler {
    sources: HashMap<String, Reassembler>,
}

impl MultiSourceReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, source: &str, raw: Vec<u8>) -> io::Result<Option<Message>> {
        self.sources.entry(source.to_string()).or_default().feed(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::RankTarget;

    fn sample_command(text_len: usize) -> Message {
        Message::Command { target: RankTarget::Broadcast, token: 1, text: "x".repeat(text_len) }
    }

    #[test]
    fn small_message_is_a_single_data_frame() {
        let cfg = FrameConfig::default();
        let frames = encode_message(&sample_command(10), &cfg).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, FrameTag::Data);
    }

    #[test]
    fn oversized_message_compresses_to_one_frame() {
        let cfg = FrameConfig::default();
        let frames = encode_message(&sample_command(200_000), &cfg).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, FrameTag::Compressed);
    }

    #[test]
    fn midsize_message_splits_into_multi_header_and_payloads() {
        let cfg = FrameConfig { compress_threshold: 1 << 30, ..FrameConfig::default() };
        let frames = encode_message(&sample_command(30_000), &cfg).unwrap();
        assert!(frames.len() > 2);
        let header: Message = bincode::deserialize(&frames[0].1).unwrap();
        match header {
            Message::MultiHeader { count } => assert_eq!(count as usize, frames.len() - 1),
            _ => panic!("expected multi-header first"),
        }
    }

    #[test]
    fn reassembler_reconstructs_a_split_message() {
        let cfg = FrameConfig { compress_threshold: 1 << 30, ..FrameConfig::default() };
        let original = sample_command(30_000);
        let frames = encode_message(&original, &cfg).unwrap();
        let mut reasm = Reassembler::new();
        let mut result = None;
        for (_, bytes) in frames {
            if let Some(m) = reasm.feed(bytes).unwrap() {
                result = Some(m);
            }
        }
        match result.unwrap() {
            Message::Command { text, .. } => assert_eq!(text.len(), 30_000),
            _ => panic!("expected reassembled command"),
        }
    }

    #[test]
    fn multi_source_reassembler_keeps_sources_independent() {
        let cfg = FrameConfig { compress_threshold: 1 << 30, ..FrameConfig::default() };
        let a = encode_message(&sample_command(30_000), &cfg).unwrap();
        let b = encode_message(&sample_command(25_000), &cfg).unwrap();
        let mut multi = MultiSourceReassembler::new();
        // Interleave source "a" and "b" frames.
        let mut a_result = None;
        let mut b_result = None;
        for i in 0..a.len().max(b.len()) {
            if let Some(f) = a.get(i) {
                if let Some(m) = multi.feed("a", f.1.clone()).unwrap() {
                    a_result = Some(m);
                }
            }
            if let Some(f) = b.get(i) {
                if let Some(m) = multi.feed("b", f.1.clone()).unwrap() {
                    b_result = Some(m);
                }
            }
        }
        match (a_result.unwrap(), b_result.unwrap()) {
            (Message::Command { text: ta, .. }, Message::Command { text: tb, .. }) => {
                assert_eq!(ta.len(), 30_000);
                assert_eq!(tb.len(), 25_000);
            }
            _ => panic!("expected both commands reassembled"),
        }
    }
}
