//! Short audio clips over the command channel
//!
//! The command channel limits message size, so a clip is split into ordered
//! chunks and rebuilt on the far side. Chunks may arrive in any order; delivery
//! is fire-and-forget with no acknowledgement or retry.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::webrtc::CommandMessage;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("Chunk {index} out of range for {total} chunks")]
    InvalidIndex { index: u32, total: u32 },
    #[error("Chunk totals disagree for clip {0}")]
    TotalMismatch(String),
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Invalid chunk data: {0}")]
    Encoding(String),
    #[error("Clip too large: {total_chunks} chunks, {total_size} bytes")]
    TooLarge { total_chunks: u32, total_size: usize },
}

/// One slice of a clip
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub audio_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub data: Vec<u8>,
    pub total_size: usize,
}

impl AudioChunk {
    /// Decode a `pttLiveAudioChunk` command. Returns `Ok(None)` for other commands.
    pub fn from_command(command: &CommandMessage) -> Result<Option<Self>, AssemblyError> {
        let CommandMessage::PttLiveAudioChunk {
            audio_id,
            chunk_index,
            total_chunks,
            chunk_data,
            chunk_size,
            total_size,
        } = command
        else {
            return Ok(None);
        };

        let data = STANDARD
            .decode(chunk_data)
            .map_err(|e| AssemblyError::Encoding(e.to_string()))?;
        if data.len() != *chunk_size {
            return Err(AssemblyError::SizeMismatch {
                expected: *chunk_size,
                actual: data.len(),
            });
        }

        Ok(Some(Self {
            audio_id: audio_id.clone(),
            chunk_index: *chunk_index,
            total_chunks: *total_chunks,
            data,
            total_size: *total_size,
        }))
    }

    pub fn to_command(&self) -> CommandMessage {
        CommandMessage::PttLiveAudioChunk {
            audio_id: self.audio_id.clone(),
            chunk_index: self.chunk_index,
            total_chunks: self.total_chunks,
            chunk_data: STANDARD.encode(&self.data),
            chunk_size: self.data.len(),
            total_size: self.total_size,
        }
    }
}

/// Split `payload` into chunks of at most `chunk_size` bytes.
/// An empty payload still yields one (empty) chunk so the receiver sees the clip.
pub fn split_clip(audio_id: &str, payload: &[u8], chunk_size: usize) -> Vec<AudioChunk> {
    let chunk_size = chunk_size.max(1);
    let total_chunks = payload.len().div_ceil(chunk_size).max(1) as u32;

    if payload.is_empty() {
        return vec![AudioChunk {
            audio_id: audio_id.to_string(),
            chunk_index: 0,
            total_chunks,
            data: Vec::new(),
            total_size: 0,
        }];
    }

    payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, data)| AudioChunk {
            audio_id: audio_id.to_string(),
            chunk_index: index as u32,
            total_chunks,
            data: data.to_vec(),
            total_size: payload.len(),
        })
        .collect()
}

/// Result of feeding one chunk to the reassembler
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Pending { received: u32, total: u32 },
    Complete(Vec<u8>),
    /// Chunk of a finished clip, or a chunk already received
    Duplicate,
}

struct Assembly {
    total_chunks: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    received_bytes: usize,
    total_size: usize,
    started_at: Instant,
}

/// Clips are tracked per sender: (client id, audio id)
type ClipKey = (String, String);

/// Chunks a clip may declare beyond what its size needs at the observed chunk length
const CHUNK_COUNT_SLACK: usize = 1;

/// Receiver side: one assembly per in-flight clip of each client
pub struct ChunkReassembler {
    assemblies: HashMap<ClipKey, Assembly>,
    /// Finished clips, so late resends are ignored
    processed: HashMap<ClipKey, Instant>,
    ttl: Duration,
    max_clip_bytes: usize,
}

impl ChunkReassembler {
    pub fn new(ttl: Duration, max_clip_bytes: usize) -> Self {
        Self {
            assemblies: HashMap::new(),
            processed: HashMap::new(),
            ttl,
            max_clip_bytes,
        }
    }

    /// Reject chunks whose declared shape is out of bounds before any
    /// storage is set aside for them
    fn check_bounds(&self, chunk: &AudioChunk) -> Result<(), AssemblyError> {
        if chunk.total_chunks == 0 || chunk.chunk_index >= chunk.total_chunks {
            return Err(AssemblyError::InvalidIndex {
                index: chunk.chunk_index,
                total: chunk.total_chunks,
            });
        }

        let too_large = AssemblyError::TooLarge {
            total_chunks: chunk.total_chunks,
            total_size: chunk.total_size,
        };
        if chunk.total_size > self.max_clip_bytes {
            return Err(too_large);
        }
        if chunk.data.len() > chunk.total_size || (chunk.data.is_empty() && chunk.total_size > 0) {
            return Err(AssemblyError::SizeMismatch {
                expected: chunk.total_size,
                actual: chunk.data.len(),
            });
        }

        let max_chunks = chunk.total_size.div_ceil(chunk.data.len().max(1)) + CHUNK_COUNT_SLACK;
        if chunk.total_chunks as usize > max_chunks {
            return Err(too_large);
        }
        Ok(())
    }

    pub fn ingest(
        &mut self,
        client_id: &str,
        chunk: AudioChunk,
        now: Instant,
    ) -> Result<IngestOutcome, AssemblyError> {
        let key = (client_id.to_string(), chunk.audio_id.clone());
        if self.processed.contains_key(&key) {
            tracing::debug!("Ignoring chunk for finished clip {} of {}", chunk.audio_id, client_id);
            return Ok(IngestOutcome::Duplicate);
        }

        self.check_bounds(&chunk)?;

        let assembly = self.assemblies.entry(key.clone()).or_insert_with(|| Assembly {
            total_chunks: chunk.total_chunks,
            chunks: BTreeMap::new(),
            received_bytes: 0,
            total_size: chunk.total_size,
            started_at: now,
        });

        if assembly.total_chunks != chunk.total_chunks || assembly.total_size != chunk.total_size {
            return Err(AssemblyError::TotalMismatch(chunk.audio_id));
        }
        if assembly.chunks.contains_key(&chunk.chunk_index) {
            return Ok(IngestOutcome::Duplicate);
        }
        if assembly.received_bytes + chunk.data.len() > assembly.total_size {
            return Err(AssemblyError::SizeMismatch {
                expected: assembly.total_size,
                actual: assembly.received_bytes + chunk.data.len(),
            });
        }

        assembly.received_bytes += chunk.data.len();
        assembly.chunks.insert(chunk.chunk_index, chunk.data);
        let received = assembly.chunks.len() as u32;

        if received < assembly.total_chunks {
            return Ok(IngestOutcome::Pending {
                received,
                total: assembly.total_chunks,
            });
        }

        // Last distinct chunk: the assembly leaves the table here and only here
        let Some(assembly) = self.assemblies.remove(&key) else {
            return Ok(IngestOutcome::Duplicate);
        };
        self.processed.insert(key, now);

        let payload: Vec<u8> = assembly.chunks.into_values().flatten().collect();
        if payload.len() != assembly.total_size {
            return Err(AssemblyError::SizeMismatch {
                expected: assembly.total_size,
                actual: payload.len(),
            });
        }

        tracing::info!(
            "Clip {} from {} reassembled ({} chunks, {} bytes)",
            chunk.audio_id,
            client_id,
            assembly.total_chunks,
            payload.len()
        );
        Ok(IngestOutcome::Complete(payload))
    }

    /// Drop stalled assemblies and expired guard entries; returns how many
    /// assemblies were abandoned
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.assemblies.len();
        self.assemblies.retain(|(client_id, audio_id), assembly| {
            let keep = now.saturating_duration_since(assembly.started_at) < ttl;
            if !keep {
                tracing::warn!(
                    "Dropping stalled clip {} from {} ({}/{} chunks)",
                    audio_id,
                    client_id,
                    assembly.chunks.len(),
                    assembly.total_chunks
                );
            }
            keep
        });
        self.processed
            .retain(|_, finished| now.saturating_duration_since(*finished) < ttl);
        before - self.assemblies.len()
    }

    /// Forget everything a departed client had in flight
    pub fn drop_client(&mut self, client_id: &str) -> usize {
        let before = self.assemblies.len();
        self.assemblies.retain(|(owner, _), _| owner != client_id);
        self.processed.retain(|(owner, _), _| owner != client_id);
        before - self.assemblies.len()
    }

    pub fn clear(&mut self) {
        self.assemblies.clear();
        self.processed.clear();
    }

    pub fn is_pending(&self, client_id: &str, audio_id: &str) -> bool {
        self.assemblies
            .contains_key(&(client_id.to_string(), audio_id.to_string()))
    }

    pub fn pending_count(&self) -> usize {
        self.assemblies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAX_CLIP: usize = 1024 * 1024;

    fn reassembler() -> ChunkReassembler {
        ChunkReassembler::new(Duration::from_secs(30), MAX_CLIP)
    }

    fn clip(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let payload = clip(50);
        let chunks = split_clip("clip-1", &payload, 10);
        assert_eq!(chunks.len(), 5);

        let mut reassembler = reassembler();
        let now = Instant::now();

        // Chunks 3,1,5,2,4 (1-based)
        let mut outcome = None;
        for index in [2usize, 0, 4, 1, 3] {
            outcome = Some(reassembler.ingest("c1", chunks[index].clone(), now).unwrap());
            if index != 3 {
                assert!(reassembler.is_pending("c1", "clip-1"));
            }
        }

        assert_eq!(outcome, Some(IngestOutcome::Complete(payload)));
        assert!(!reassembler.is_pending("c1", "clip-1"));
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_resend_after_completion_is_ignored() {
        let payload = clip(25);
        let chunks = split_clip("clip-2", &payload, 10);
        let mut reassembler = reassembler();
        let now = Instant::now();

        for chunk in &chunks {
            reassembler.ingest("c1", chunk.clone(), now).unwrap();
        }
        for chunk in &chunks {
            assert_eq!(
                reassembler.ingest("c1", chunk.clone(), now).unwrap(),
                IngestOutcome::Duplicate
            );
        }
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_repeated_chunk_counts_once() {
        let chunks = split_clip("clip-3", &clip(30), 10);
        let mut reassembler = reassembler();
        let now = Instant::now();

        reassembler.ingest("c1", chunks[0].clone(), now).unwrap();
        assert_eq!(
            reassembler.ingest("c1", chunks[0].clone(), now).unwrap(),
            IngestOutcome::Duplicate
        );
        assert_eq!(
            reassembler.ingest("c1", chunks[1].clone(), now).unwrap(),
            IngestOutcome::Pending { received: 2, total: 3 }
        );
    }

    #[test]
    fn test_inconsistent_chunks_are_rejected() {
        let mut reassembler = reassembler();
        let now = Instant::now();
        let mut chunks = split_clip("clip-4", &clip(30), 10);

        let mut bad = chunks[0].clone();
        bad.chunk_index = 7;
        assert_eq!(
            reassembler.ingest("c1", bad, now).unwrap_err(),
            AssemblyError::InvalidIndex { index: 7, total: 3 }
        );

        reassembler.ingest("c1", chunks[0].clone(), now).unwrap();
        chunks[1].total_chunks = 4;
        assert!(matches!(
            reassembler.ingest("c1", chunks[1].clone(), now),
            Err(AssemblyError::TotalMismatch(_))
        ));
    }

    #[test]
    fn test_sweep_drops_stalled_assemblies() {
        let chunks = split_clip("clip-5", &clip(30), 10);
        let mut reassembler = reassembler();
        let start = Instant::now();

        reassembler.ingest("c1", chunks[0].clone(), start).unwrap();
        assert_eq!(reassembler.sweep(start + Duration::from_secs(10)), 0);
        assert!(reassembler.is_pending("c1", "clip-5"));

        assert_eq!(reassembler.sweep(start + Duration::from_secs(31)), 1);
        assert!(!reassembler.is_pending("c1", "clip-5"));
    }

    #[test]
    fn test_command_wire_format() {
        let chunks = split_clip("clip-6", b"hello world", 4);
        let command = chunks[2].to_command();
        match &command {
            CommandMessage::PttLiveAudioChunk {
                chunk_data,
                chunk_size,
                total_size,
                total_chunks,
                ..
            } => {
                assert_eq!(chunk_data, "cmxk");
                assert_eq!(*chunk_size, 3);
                assert_eq!(*total_size, 11);
                assert_eq!(*total_chunks, 3);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let decoded = AudioChunk::from_command(&command).unwrap().unwrap();
        assert_eq!(decoded, chunks[2]);
        assert_eq!(
            AudioChunk::from_command(&CommandMessage::Ducking { active: true }).unwrap(),
            None
        );
    }

    #[test]
    fn test_bad_chunk_data_is_rejected() {
        let command = CommandMessage::PttLiveAudioChunk {
            audio_id: "clip-7".to_string(),
            chunk_index: 0,
            total_chunks: 1,
            chunk_data: "!!not base64!!".to_string(),
            chunk_size: 4,
            total_size: 4,
        };
        assert!(matches!(
            AudioChunk::from_command(&command),
            Err(AssemblyError::Encoding(_))
        ));
    }

    #[test]
    fn test_oversized_declarations_are_rejected() {
        let mut reassembler = reassembler();
        let now = Instant::now();
        let chunk = split_clip("huge", &clip(10), 10).remove(0);

        let mut bad = chunk.clone();
        bad.total_chunks = u32::MAX;
        assert!(matches!(
            reassembler.ingest("c1", bad, now),
            Err(AssemblyError::TooLarge { .. })
        ));

        let mut bad = chunk.clone();
        bad.total_size = MAX_CLIP + 1;
        bad.total_chunks = 2;
        assert!(matches!(
            reassembler.ingest("c1", bad, now),
            Err(AssemblyError::TooLarge { .. })
        ));

        let mut bad = chunk;
        bad.total_size = MAX_CLIP;
        bad.total_chunks = (MAX_CLIP / 10 + 100) as u32;
        assert!(matches!(
            reassembler.ingest("c1", bad, now),
            Err(AssemblyError::TooLarge { .. })
        ));
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_same_clip_id_from_two_clients_stays_separate() {
        let mut reassembler = reassembler();
        let now = Instant::now();
        let from_a = split_clip("ptt-1", b"AAAAAAAA", 4);
        let from_b = split_clip("ptt-1", b"BBBBBBBB", 4);

        assert_eq!(
            reassembler.ingest("a", from_a[0].clone(), now).unwrap(),
            IngestOutcome::Pending { received: 1, total: 2 }
        );
        assert_eq!(
            reassembler.ingest("b", from_b[1].clone(), now).unwrap(),
            IngestOutcome::Pending { received: 1, total: 2 }
        );
        assert_eq!(
            reassembler.ingest("b", from_b[0].clone(), now).unwrap(),
            IngestOutcome::Complete(b"BBBBBBBB".to_vec())
        );
        assert_eq!(
            reassembler.ingest("a", from_a[1].clone(), now).unwrap(),
            IngestOutcome::Complete(b"AAAAAAAA".to_vec())
        );
    }

    #[test]
    fn test_drop_client_forgets_its_clips() {
        let mut reassembler = reassembler();
        let now = Instant::now();
        let chunks = split_clip("clip-8", &clip(30), 10);
        reassembler.ingest("a", chunks[0].clone(), now).unwrap();
        reassembler.ingest("b", chunks[0].clone(), now).unwrap();

        assert_eq!(reassembler.drop_client("a"), 1);
        assert!(!reassembler.is_pending("a", "clip-8"));
        assert!(reassembler.is_pending("b", "clip-8"));

        reassembler.clear();
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_empty_clip() {
        let chunks = split_clip("empty", &[], 10);
        assert_eq!(chunks.len(), 1);
        let mut reassembler = reassembler();
        assert_eq!(
            reassembler.ingest("c1", chunks[0].clone(), Instant::now()).unwrap(),
            IngestOutcome::Complete(Vec::new())
        );
    }

    fn clip_and_order() -> impl Strategy<Value = (Vec<u8>, usize, Vec<usize>)> {
        (prop::collection::vec(any::<u8>(), 1..2000), 1usize..300).prop_flat_map(
            |(payload, chunk_size)| {
                let n = payload.len().div_ceil(chunk_size);
                let order: Vec<usize> = (0..n).collect();
                (Just(payload), Just(chunk_size), Just(order).prop_shuffle())
            },
        )
    }

    proptest! {
        #[test]
        fn prop_reassembly_is_order_independent((payload, chunk_size, order) in clip_and_order()) {
            let chunks = split_clip("prop", &payload, chunk_size);
            prop_assert_eq!(chunks.len(), order.len());

            let mut reassembler = reassembler();
            let now = Instant::now();
            let mut completed = Vec::new();

            for index in &order {
                if let IngestOutcome::Complete(bytes) = reassembler.ingest("c1", chunks[*index].clone(), now).unwrap() {
                    completed.push(bytes);
                }
            }

            prop_assert_eq!(completed.len(), 1);
            prop_assert_eq!(&completed[0], &payload);
            prop_assert!(!reassembler.is_pending("c1", "prop"));
        }
    }
}
