//! Opening books.
//!
//! Books are looked up by the Polyglot Zobrist key of a position (see
//! [`Board::key`](crate::board::Board::key)) and answer with a coordinate move. They are
//! read-only once loaded and shared between concurrently running games.

use std::{
    collections::HashMap,
    fmt::Debug,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use rand::{Rng, RngCore};
use tracing::{info, instrument, warn};

use crate::board::{Board, MoveNotation};

pub trait OpeningBook: Send + Sync + Debug {
    /// A book move for the position with `key`, picked with `rng`.
    fn book_move(&self, key: u64, rng: &mut dyn RngCore) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    key: u64,
    mv: u16,
    weight: u16,
}

/// A Polyglot `.bin` book.
///
/// Entries are 16 bytes, big-endian: key `u64`, move `u16`, weight `u16`, learn `u32`.
#[derive(Debug, Clone, Default)]
pub struct PolyglotBook {
    entries: Vec<Entry>,
}

impl PolyglotBook {
    const ENTRY_SIZE: usize = 16;

    #[instrument]
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("could not read opening book '{}'", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("invalid opening book '{}'", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() % Self::ENTRY_SIZE != 0 {
            bail!(
                "size {} is not a multiple of {}",
                bytes.len(),
                Self::ENTRY_SIZE
            );
        }
        let mut entries: Vec<Entry> = bytes
            .chunks_exact(Self::ENTRY_SIZE)
            .map(|chunk| {
                let mut key = [0; 8];
                key.copy_from_slice(&chunk[..8]);
                Entry {
                    key: u64::from_be_bytes(key),
                    mv: u16::from_be_bytes([chunk[8], chunk[9]]),
                    weight: u16::from_be_bytes([chunk[10], chunk[11]]),
                }
            })
            .collect();
        // lookups binary search by key
        entries.sort_by_key(|e| e.key);
        Ok(PolyglotBook { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entries_for(&self, key: u64) -> &[Entry] {
        let start = self.entries.partition_point(|e| e.key < key);
        let end = self.entries.partition_point(|e| e.key <= key);
        &self.entries[start..end]
    }
}

/// Polyglot move bits: to file 0-2, to rank 3-5, from file 6-8, from rank 9-11,
/// promotion 12-14. Castling stays king-takes-rook (`e1h1`).
pub(crate) fn decode_move(mv: u16) -> String {
    let square = |file: u16, rank: u16| {
        format!(
            "{}{}",
            char::from(b'a' + file as u8),
            char::from(b'1' + rank as u8)
        )
    };
    let to = square(mv & 7, (mv >> 3) & 7);
    let from = square((mv >> 6) & 7, (mv >> 9) & 7);
    let promotion = match (mv >> 12) & 7 {
        1 => "n",
        2 => "b",
        3 => "r",
        4 => "q",
        _ => "",
    };
    format!("{from}{to}{promotion}")
}

impl OpeningBook for PolyglotBook {
    fn book_move(&self, key: u64, rng: &mut dyn RngCore) -> Option<String> {
        let candidates = self.entries_for(key);
        let total: u32 = candidates.iter().map(|e| u32::from(e.weight)).sum();
        if total == 0 {
            return candidates.first().map(|e| decode_move(e.mv));
        }
        let mut pick = rng.gen_range(0..total);
        for entry in candidates {
            let weight = u32::from(entry.weight);
            if pick < weight {
                return Some(decode_move(entry.mv));
            }
            pick -= weight;
        }
        None
    }
}

/// Loaded books, one per file path.
#[derive(Debug, Default)]
pub struct BookCache {
    books: HashMap<PathBuf, Option<Arc<dyn OpeningBook>>>,
}

impl BookCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path` once. A book that cannot be read is reported once and then treated
    /// as "no book".
    pub fn add(&mut self, path: impl AsRef<Path>) -> Option<Arc<dyn OpeningBook>> {
        let path = path.as_ref();
        if let Some(book) = self.books.get(path) {
            return book.clone();
        }
        let book = match PolyglotBook::read(path) {
            Ok(book) => {
                info!("loaded {} book entries from {}", book.len(), path.display());
                Some(Arc::new(book) as Arc<dyn OpeningBook>)
            }
            Err(e) => {
                warn!("{e:#}");
                None
            }
        };
        self.books.insert(path.to_path_buf(), book.clone());
        book
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

/// Walk `book` from the current position of `board`, playing at most `depth` plies.
///
/// Returns the moves played, in coordinate notation.
pub fn opening_line(
    board: &mut dyn Board,
    book: &dyn OpeningBook,
    depth: u32,
    rng: &mut dyn RngCore,
) -> Vec<String> {
    let mut line = vec![];
    for _ in 0..depth {
        let Some(mv) = book.book_move(board.key(), rng) else {
            break;
        };
        let Some(mv) = board.parse_move(&mv, MoveNotation::Long) else {
            warn!("illegal book move '{mv}'");
            break;
        };
        if board.make_move(&mv).is_err() {
            break;
        }
        line.push(mv);
    }
    line
}
