use crate::config::{CommonConfig, PeerId};
use crate::error::{Result, SwarmError};
use crate::piece::{piece_length, piece_offset};
use async_trait::async_trait;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const FINALIZE_ATTEMPTS: u32 = 5;
const FINALIZE_BACKOFF: Duration = Duration::from_millis(50);

/// Piece-addressed access to the shared file.
///
/// The protocol layer only moves bytes through this; it never inspects them.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Prepare the working directory and, for a leecher, the partial file.
    async fn initialize(&self) -> Result<()>;

    fn piece_length(&self, index: u32) -> u32;

    async fn write_piece(&self, index: u32, data: &[u8]) -> Result<()>;

    async fn read_piece(&self, index: u32) -> Result<Vec<u8>>;

    /// Promote the partial file to its final name.
    async fn finalize(&self) -> Result<()>;

    fn has_complete_file(&self) -> bool;
}

/// Single-file store under `<work_dir>/peer_<id>/`
pub struct FileStore {
    peer_dir: PathBuf,
    final_path: PathBuf,
    part_path: PathBuf,
    file_size: u64,
    piece_size: u32,
    starts_with_file: bool,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(
        work_dir: P,
        peer_id: PeerId,
        config: &CommonConfig,
        starts_with_file: bool,
    ) -> Self {
        let peer_dir = work_dir.as_ref().join(format!("peer_{}", peer_id));
        let final_path = peer_dir.join(&config.file_name);
        let part_path = peer_dir.join(format!("{}.part", config.file_name));

        Self {
            peer_dir,
            final_path,
            part_path,
            file_size: config.file_size,
            piece_size: config.piece_size,
            starts_with_file,
        }
    }

    #[cfg(test)]
    pub fn peer_dir(&self) -> &Path {
        &self.peer_dir
    }

    #[cfg(test)]
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    #[cfg(test)]
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    async fn read_at(&self, path: &Path, offset: u64, length: u32) -> Result<Vec<u8>> {
        let mut file = File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer).await?;
        Ok(buffer)
    }
}

#[async_trait]
impl PieceStore for FileStore {
    async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.peer_dir).await?;

        if self.has_complete_file() {
            info!("Complete file present at {}", self.final_path.display());
            return Ok(());
        }
        if self.starts_with_file {
            return Err(SwarmError::MissingCompleteFile(self.final_path.clone()));
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.part_path)
            .await?;
        if file.metadata().await?.len() != self.file_size {
            file.set_len(self.file_size).await?;
        }

        info!(
            "Partial file ready at {} ({} bytes)",
            self.part_path.display(),
            self.file_size
        );
        Ok(())
    }

    fn piece_length(&self, index: u32) -> u32 {
        piece_length(index, self.piece_size, self.file_size)
    }

    async fn write_piece(&self, index: u32, data: &[u8]) -> Result<()> {
        let expected = self.piece_length(index);
        if expected == 0 {
            return Err(SwarmError::OutOfRange(index));
        }
        if self.has_complete_file() {
            return Err(SwarmError::AlreadyFinalized);
        }
        if data.len() != expected as usize {
            return Err(SwarmError::LengthMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }

        let offset = piece_offset(index, self.piece_size);
        let mut file = OpenOptions::new().write(true).open(&self.part_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;

        debug!("Wrote piece {} at offset {} ({} bytes)", index, offset, data.len());
        Ok(())
    }

    async fn read_piece(&self, index: u32) -> Result<Vec<u8>> {
        let length = self.piece_length(index);
        if length == 0 {
            return Err(SwarmError::OutOfRange(index));
        }

        let offset = piece_offset(index, self.piece_size);
        if self.has_complete_file() {
            return self.read_at(&self.final_path, offset, length).await;
        }

        match self.read_at(&self.part_path, offset, length).await {
            // Renamed underneath us by a concurrent finalize
            Err(SwarmError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                self.read_at(&self.final_path, offset, length).await
            }
            result => result,
        }
    }

    async fn finalize(&self) -> Result<()> {
        let mut delay = FINALIZE_BACKOFF;

        for attempt in 1..=FINALIZE_ATTEMPTS {
            if self.has_complete_file() {
                return Ok(());
            }

            match fs::rename(&self.part_path, &self.final_path).await {
                Ok(()) => {
                    info!("Finalized {}", self.final_path.display());
                    return Ok(());
                }
                Err(e) if attempt == FINALIZE_ATTEMPTS => {
                    return Err(SwarmError::FinalizeFailed(format!(
                        "{} after {} attempts: {}",
                        self.part_path.display(),
                        attempt,
                        e
                    )));
                }
                Err(e) => {
                    warn!("Rename attempt {} failed: {}, retrying", attempt, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        Err(SwarmError::FinalizeFailed(self.part_path.display().to_string()))
    }

    fn has_complete_file(&self) -> bool {
        self.final_path.exists()
    }
}
