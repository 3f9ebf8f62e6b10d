// rust/pipeline-core/src/dataset/layout.rs

//! Discovery of the on-disk dataset layout.
//!
//! A dataset directory holds one file per `(day, kind)` pair named
//! `day_<d>_<kind>[.<ext>]`. Each file is a headerless little-endian array
//! of fixed-width rows, so the row count of a file follows from its size.
//! The maximum day index is reserved for validation and test.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use tracing::debug;

use super::traits::{Phase, DENSE_FEATURE_COUNT, SPARSE_FEATURE_COUNT};
use crate::error::{PipelineError, Result};
use crate::storage::StorageBackend;

/// The three per-day record arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKind {
    Dense,
    Sparse,
    Labels,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Dense, RecordKind::Sparse, RecordKind::Labels];

    /// Width of one row in bytes.
    pub fn row_bytes(&self) -> u64 {
        match self {
            RecordKind::Dense => (DENSE_FEATURE_COUNT * 4) as u64,
            RecordKind::Sparse => (SPARSE_FEATURE_COUNT * 4) as u64,
            RecordKind::Labels => 4,
        }
    }

    /// Parses the kind token of a file name.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "dense" | "int" | "reordered_int" => Some(RecordKind::Dense),
            "sparse" | "cat" | "reordered_cat" => Some(RecordKind::Sparse),
            "labels" | "y" | "reordered_y" => Some(RecordKind::Labels),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Dense => "dense",
            RecordKind::Sparse => "sparse",
            RecordKind::Labels => "labels",
        };
        f.write_str(name)
    }
}

/// Extracts the day index from a `day_<d>_...` file name.
pub fn parse_day(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("day_")?;
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let tail = &rest[digits_end..];
    if !(tail.is_empty() || tail.starts_with('_') || tail.starts_with('.')) {
        return None;
    }
    rest[..digits_end].parse().ok()
}

/// Parses a file name into its day index and record kind.
pub fn parse_file_name(name: &str) -> Option<(u32, RecordKind)> {
    let day = parse_day(name)?;
    let rest = name.strip_prefix("day_")?;
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    let token = rest.strip_prefix('_')?;
    let token = match token.find('.') {
        Some(dot) => &token[..dot],
        None => token,
    };
    RecordKind::from_token(token).map(|kind| (day, kind))
}

/// The dense, sparse and label files of one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup {
    pub day: u32,
    pub dense: String,
    pub sparse: String,
    pub labels: String,
    /// Rows in each of the three files.
    pub rows: u64,
}

impl FileGroup {
    /// File name of the given kind.
    pub fn file(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::Dense => &self.dense,
            RecordKind::Sparse => &self.sparse,
            RecordKind::Labels => &self.labels,
        }
    }
}

/// All file groups of a dataset directory, ordered by day.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    groups: Vec<FileGroup>,
}

impl DatasetLayout {
    /// Builds a layout from already-validated groups.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `groups` is empty or a day repeats.
    pub fn from_groups(mut groups: Vec<FileGroup>) -> Result<Self> {
        if groups.is_empty() {
            return Err(PipelineError::config("dataset contains no day files"));
        }
        groups.sort_by_key(|g| g.day);
        if groups.windows(2).any(|w| w[0].day == w[1].day) {
            return Err(PipelineError::config("dataset lists the same day twice"));
        }
        Ok(Self { groups })
    }

    /// Lists the storage root and groups the files by day.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a day is missing a record kind,
    /// has duplicate files for a kind, has a file whose size is not a
    /// whole number of rows, or has kinds with differing row counts.
    pub fn discover(storage: &dyn StorageBackend) -> Result<Self> {
        let names = storage.list(Path::new(""))?;

        let mut by_day: BTreeMap<u32, BTreeMap<RecordKind, String>> = BTreeMap::new();
        for name in names {
            match parse_file_name(&name) {
                Some((day, kind)) => {
                    let files = by_day.entry(day).or_default();
                    if let Some(existing) = files.insert(kind, name.clone()) {
                        return Err(PipelineError::config(format!(
                            "day {day} has more than one {kind} file: '{existing}' and '{name}'"
                        )));
                    }
                }
                None => debug!(file = %name, "ignoring file outside the day_<d>_<kind> layout"),
            }
        }

        let mut groups = Vec::with_capacity(by_day.len());
        for (day, mut files) in by_day {
            let mut take = |kind: RecordKind| {
                files.remove(&kind).ok_or_else(|| {
                    PipelineError::config(format!("no {kind} file found for day {day}"))
                })
            };
            let dense = take(RecordKind::Dense)?;
            let sparse = take(RecordKind::Sparse)?;
            let labels = take(RecordKind::Labels)?;

            let mut rows = None;
            for (kind, file) in [
                (RecordKind::Dense, &dense),
                (RecordKind::Sparse, &sparse),
                (RecordKind::Labels, &labels),
            ] {
                let size = storage.metadata(Path::new(file))?.size;
                if size % kind.row_bytes() != 0 {
                    return Err(PipelineError::config(format!(
                        "'{file}' is {size} bytes, not a multiple of the {} byte {kind} row",
                        kind.row_bytes()
                    )));
                }
                let file_rows = size / kind.row_bytes();
                match rows {
                    None => rows = Some(file_rows),
                    Some(expected) if expected != file_rows => {
                        return Err(PipelineError::config(format!(
                            "day {day} row counts disagree: {expected} rows in '{dense}', \
                             {file_rows} rows in '{file}'"
                        )));
                    }
                    Some(_) => {}
                }
            }

            groups.push(FileGroup {
                day,
                dense,
                sparse,
                labels,
                rows: rows.unwrap_or(0),
            });
        }

        debug!(days = groups.len(), "discovered dataset layout");
        Self::from_groups(groups)
    }

    /// Day index reserved for validation and test.
    pub fn final_day(&self) -> u32 {
        // from_groups guarantees at least one group, sorted by day
        self.groups.last().map(|g| g.day).unwrap_or(0)
    }

    /// All groups, ordered by day.
    pub fn groups(&self) -> &[FileGroup] {
        &self.groups
    }

    /// The groups a phase reads.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the phase would read nothing, which
    /// happens for training when the dataset holds a single day.
    pub fn phase_groups(&self, phase: Phase) -> Result<Vec<FileGroup>> {
        let final_day = self.final_day();
        let groups: Vec<FileGroup> = self
            .groups
            .iter()
            .filter(|g| match phase {
                Phase::Train => g.day != final_day,
                Phase::Validate | Phase::Test => g.day == final_day,
            })
            .cloned()
            .collect();

        if groups.is_empty() {
            return Err(PipelineError::config(format!(
                "no files match the {phase} phase: the dataset only holds day {final_day}, \
                 which is reserved for validation and test"
            )));
        }
        Ok(groups)
    }
}
