//! Partitioned minibatch reader for sparse text formats.
//!
//! `MinibatchIter` streams fixed-size row blocks from one byte-range
//! partition of a file. Partition `part_id` of `num_parts` covers
//! `[part_id * len / num_parts, (part_id + 1) * len / num_parts)`; a line
//! belongs to the partition that contains its first byte, so the reader
//! skips the leading partial line (unless it is partition 0) and finishes
//! the line that straddles its end boundary. Every line of the file is
//! consumed by exactly one partition.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use sparsefleet_core::{Error, Result};

use crate::row_block::RowBlock;

/// Streams minibatches of up to `mb_size` rows from one file partition.
pub struct MinibatchIter {
    reader: BufReader<File>,
    path: String,
    /// Byte offset of the start of the next unread line.
    pos: u64,
    /// Exclusive upper bound: lines starting at or past this offset belong
    /// to the next partition.
    end: u64,
    mb_size: usize,
    line_no: u64,
}

impl MinibatchIter {
    /// Opens partition `part_id` of `num_parts` of `path` in the given
    /// format, yielding minibatches of `mb_size` rows.
    pub fn new(
        path: impl AsRef<Path>,
        part_id: u32,
        num_parts: u32,
        format: &str,
        mb_size: usize,
    ) -> Result<Self> {
        if format.to_ascii_lowercase() != "libsvm" {
            return Err(Error::UnknownFormat {
                name: format.to_string(),
            });
        }
        if num_parts == 0 || part_id >= num_parts {
            return Err(Error::config(format!(
                "invalid partition {part_id}/{num_parts}"
            )));
        }
        let path_str = path.as_ref().display().to_string();
        let io_err = |source| Error::Io {
            path: path_str.clone(),
            source,
        };

        let file = File::open(path.as_ref()).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        let start = len * part_id as u64 / num_parts as u64;
        let end = len * (part_id + 1) as u64 / num_parts as u64;

        let mut reader = BufReader::new(file);
        let mut pos = start;
        if part_id > 0 && start > 0 {
            // A line belongs to the partition containing its first byte.
            // Starting one byte early and consuming through the next newline
            // skips exactly the lines owned by the previous partition, even
            // when `start` lands on a line boundary.
            reader.seek(SeekFrom::Start(start - 1)).map_err(io_err)?;
            let mut skipped = Vec::new();
            let n = reader.read_until(b'\n', &mut skipped).map_err(io_err)?;
            pos = start - 1 + n as u64;
        } else {
            reader.seek(SeekFrom::Start(start)).map_err(io_err)?;
        }

        Ok(Self {
            reader,
            path: path_str,
            pos,
            end,
            mb_size,
            line_no: 0,
        })
    }

    /// Reads the next minibatch, or `None` once the partition is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<RowBlock>> {
        let mut block = RowBlock {
            offsets: vec![0],
            ..Default::default()
        };

        let mut line = String::new();
        while block.num_rows() < self.mb_size && self.pos < self.end {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .map_err(|source| Error::Io {
                    path: self.path.clone(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            self.pos += n as u64;
            self.line_no += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            self.parse_libsvm_row(trimmed, &mut block)?;
        }

        if block.num_rows() == 0 {
            Ok(None)
        } else {
            Ok(Some(block))
        }
    }

    fn parse_libsvm_row(&self, row: &str, block: &mut RowBlock) -> Result<()> {
        let corrupt = |msg: String| Error::Reader {
            path: self.path.clone(),
            message: format!("line {}: {}", self.line_no, msg),
        };

        let mut tokens = row.split_ascii_whitespace();
        let label_tok = tokens.next().ok_or_else(|| corrupt("empty row".into()))?;
        let label: f32 = label_tok
            .parse()
            .map_err(|_| corrupt(format!("bad label `{label_tok}`")))?;

        for tok in tokens {
            let (idx_str, val_str) = match tok.split_once(':') {
                Some((i, v)) => (i, Some(v)),
                None => (tok, None),
            };
            let idx: u64 = idx_str
                .parse()
                .map_err(|_| corrupt(format!("bad feature index `{idx_str}`")))?;
            let val: f32 = match val_str {
                Some(v) => v
                    .parse()
                    .map_err(|_| corrupt(format!("bad feature value `{v}`")))?,
                None => 1.0,
            };
            block.indices.push(idx);
            block.values.push(val);
        }

        block.labels.push(label);
        block.offsets.push(block.indices.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_libsvm(lines: &[&str]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn read_all(path: &Path, part_id: u32, num_parts: u32, mb: usize) -> Vec<RowBlock> {
        let mut it = MinibatchIter::new(path, part_id, num_parts, "libsvm", mb).unwrap();
        let mut out = Vec::new();
        while let Some(b) = it.next_batch().unwrap() {
            out.push(b);
        }
        out
    }

    #[test]
    fn test_single_partition_batching() {
        let f = write_libsvm(&[
            "1 3:1.5 7:2.0",
            "-1 5:0.5",
            "1 1:1.0 2:1.0 3:1.0",
            "-1 9:4.0",
            "1 11:0.25",
        ]);
        let blocks = read_all(f.path(), 0, 1, 2);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].num_rows(), 2);
        assert_eq!(blocks[0].labels, vec![1.0, -1.0]);
        assert_eq!(blocks[0].indices, vec![3, 7, 5]);
        assert_eq!(blocks[0].values, vec![1.5, 2.0, 0.5]);
        assert_eq!(blocks[2].num_rows(), 1);
    }

    #[test]
    fn test_partitions_cover_file_exactly_once() {
        let lines: Vec<String> = (0..97)
            .map(|i| format!("{} {}:1.0", if i % 2 == 0 { 1 } else { -1 }, i))
            .collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let f = write_libsvm(&refs);

        for num_parts in [1u32, 2, 3, 5] {
            let mut seen = Vec::new();
            for part in 0..num_parts {
                for block in read_all(f.path(), part, num_parts, 10) {
                    seen.extend(block.indices.iter().copied());
                }
            }
            seen.sort_unstable();
            let expected: Vec<u64> = (0..97).collect();
            assert_eq!(seen, expected, "num_parts={num_parts}");
        }
    }

    #[test]
    fn test_weightless_feature_defaults_to_one() {
        let f = write_libsvm(&["1 4 9:2.0"]);
        let blocks = read_all(f.path(), 0, 1, 10);
        assert_eq!(blocks[0].indices, vec![4, 9]);
        assert_eq!(blocks[0].values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_corrupt_row_is_a_reader_error() {
        let f = write_libsvm(&["1 3:1.0", "not-a-label 5:2.0"]);
        let mut it = MinibatchIter::new(f.path(), 0, 1, "libsvm", 10).unwrap();
        match it.next_batch() {
            Err(Error::Reader { message, .. }) => {
                assert!(message.contains("bad label"), "{message}");
            }
            other => panic!("expected reader error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_format_rejected() {
        let f = write_libsvm(&["1 1:1.0"]);
        assert!(matches!(
            MinibatchIter::new(f.path(), 0, 1, "parquet", 10),
            Err(Error::UnknownFormat { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            MinibatchIter::new("/nonexistent/file.libsvm", 0, 1, "libsvm", 10),
            Err(Error::Io { .. })
        ));
    }
}
