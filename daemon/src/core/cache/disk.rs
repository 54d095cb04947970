use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use guardian_common::{
    block::BlockRef,
    deposit::DepositEvent,
    serializer::{Reader, Serializer, Writer},
};
use serde::{Deserialize, Serialize};

use super::{segment::EventSegment, CacheError};

// Segment file header
const SEGMENT_MAGIC: &[u8; 4] = b"GSEG";
const SEGMENT_VERSION: u8 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const HEAD_FILE: &str = "head.json";

/// Index of sealed segments. The manifest is the source of truth for what
/// sealed history exists and on which chain it was collected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub chain_id: u64,
    pub segments: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub from: u64,
    pub to: u64,
    pub tail: BlockRef,
}

impl ManifestEntry {
    fn file_name(&self) -> String {
        format!("events-{}-{}.bin", self.from, self.to)
    }
}

/// Unsealed tail of the cache, small enough to keep as JSON so an operator
/// can inspect it with less tooling than the sealed binaries need
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeadState {
    pub watermark: u64,
    pub segments: Vec<EventSegment>,
}

pub struct LoadedCache {
    pub sealed: Vec<EventSegment>,
    pub head: HeadState,
}

/// Directory-backed persistence for the event cache.
/// Layout: `<dir>/<chain_id>/{manifest.json, head.json, events-*.bin}`
pub struct CacheStore {
    dir: PathBuf,
    chain_id: u64,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>, chain_id: u64) -> Self {
        let dir = dir.into().join(chain_id.to_string());
        Self { dir, chain_id }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load everything previously persisted. A missing directory is a fresh
    /// start; a manifest for another chain is fatal; a corrupt head.json is
    /// discarded (the unsealed tail is cheap to refetch).
    pub fn open(&self) -> Result<LoadedCache, CacheError> {
        fs::create_dir_all(&self.dir)?;

        let manifest_path = self.dir.join(MANIFEST_FILE);
        let manifest: Manifest = if manifest_path.exists() {
            serde_json::from_slice(&fs::read(&manifest_path)?)?
        } else {
            Manifest {
                chain_id: self.chain_id,
                segments: Vec::new(),
            }
        };

        if manifest.chain_id != self.chain_id {
            return Err(CacheError::ChainMismatch {
                cached: manifest.chain_id,
                configured: self.chain_id,
            });
        }

        let mut sealed = Vec::with_capacity(manifest.segments.len());
        let mut expected_from = None;
        for entry in &manifest.segments {
            if let Some(expected) = expected_from {
                if entry.from != expected {
                    return Err(CacheError::Corrupt {
                        path: MANIFEST_FILE.to_string(),
                        detail: format!(
                            "segment gap: expected range starting at {}, found {}",
                            expected, entry.from
                        ),
                    });
                }
            }
            expected_from = Some(entry.to);

            let path = self.dir.join(entry.file_name());
            let segment = read_segment_file(&path)?;
            if segment.from != entry.from || segment.to != entry.to || segment.tail != entry.tail {
                return Err(CacheError::Corrupt {
                    path: entry.file_name(),
                    detail: "segment header disagrees with manifest".to_string(),
                });
            }
            sealed.push(segment);
        }

        let head_path = self.dir.join(HEAD_FILE);
        let head = if head_path.exists() {
            match serde_json::from_slice::<HeadState>(&fs::read(&head_path)?) {
                Ok(head) => head,
                Err(e) => {
                    warn!("discarding corrupt {}: {}", HEAD_FILE, e);
                    HeadState::default()
                }
            }
        } else {
            HeadState::default()
        };

        Ok(LoadedCache { sealed, head })
    }

    /// Persist a freshly sealed segment and the updated manifest
    pub fn write_sealed_segment(
        &self,
        segment: &EventSegment,
        all_sealed: &[EventSegment],
    ) -> Result<(), CacheError> {
        write_segment_file(&self.dir.join(segment.file_name()), segment)?;

        let manifest = Manifest {
            chain_id: self.chain_id,
            segments: all_sealed
                .iter()
                .map(|s| ManifestEntry {
                    from: s.from,
                    to: s.to,
                    tail: s.tail,
                })
                .collect(),
        };
        write_atomic(
            &self.dir.join(MANIFEST_FILE),
            &serde_json::to_vec_pretty(&manifest)?,
        )?;
        Ok(())
    }

    pub fn write_head(&self, head: &HeadState) -> Result<(), CacheError> {
        write_atomic(&self.dir.join(HEAD_FILE), &serde_json::to_vec(head)?)?;
        Ok(())
    }
}

// Crash safety: never leave a half-written file under its final name
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn write_segment_file(path: &Path, segment: &EventSegment) -> Result<(), CacheError> {
    let mut writer = Writer::new();
    writer.write_bytes(SEGMENT_MAGIC);
    writer.write_u8(SEGMENT_VERSION);
    writer.write_u64(segment.from);
    writer.write_u64(segment.to);
    segment.tail.write(&mut writer);
    writer.write_u32(segment.events.len() as u32);
    for event in &segment.events {
        let bytes = event.to_bytes();
        writer.write_u32(bytes.len() as u32);
        writer.write_bytes(&bytes);
    }
    write_atomic(path, writer.as_bytes())?;
    Ok(())
}

fn read_segment_file(path: &Path) -> Result<EventSegment, CacheError> {
    let display = path.display().to_string();
    let corrupt = |detail: String| CacheError::Corrupt {
        path: display.clone(),
        detail,
    };

    let bytes = fs::read(path)?;
    let mut reader = Reader::new(&bytes);

    let magic = reader
        .read_bytes(4)
        .map_err(|e| corrupt(e.to_string()))?;
    if magic != SEGMENT_MAGIC {
        return Err(corrupt("bad magic".to_string()));
    }
    let version = reader.read_u8().map_err(|e| corrupt(e.to_string()))?;
    if version != SEGMENT_VERSION {
        return Err(corrupt(format!("unsupported version {}", version)));
    }

    let from = reader.read_u64().map_err(|e| corrupt(e.to_string()))?;
    let to = reader.read_u64().map_err(|e| corrupt(e.to_string()))?;
    let tail = BlockRef::read(&mut reader).map_err(|e| corrupt(e.to_string()))?;
    let count = reader.read_u32().map_err(|e| corrupt(e.to_string()))?;

    let mut events = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().map_err(|e| corrupt(e.to_string()))? as usize;
        let record = reader
            .read_bytes(len)
            .map_err(|e| corrupt(e.to_string()))?;
        let event = DepositEvent::from_bytes(record).map_err(|e| corrupt(e.to_string()))?;
        if !(from..to).contains(&event.block.number) {
            return Err(corrupt(format!(
                "event at block {} outside segment range [{}, {})",
                event.block.number, from, to
            )));
        }
        events.push(event);
    }
    if reader.remaining() != 0 {
        return Err(corrupt(format!("{} trailing bytes", reader.remaining())));
    }

    Ok(EventSegment {
        from,
        to,
        tail,
        events,
    })
}
