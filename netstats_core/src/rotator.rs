//! Dated segment files in a single directory
//!
//! Every segment belonging to a prefix is named `PREFIX.START-END` where the
//! bounds are epoch milliseconds. The one segment still accepting writes has
//! no end yet and is named `PREFIX.START-`. Segments are rewritten by writing
//! a sibling temporary file and renaming it over the original, so a crash
//! leaves either the old or the new contents, never a mixture.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::collection;

const TEMP_SUFFIX: &str = ".tmp";

/// The filesystem operation that failed, for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    /// `fs::create_dir_all`
    CreateDirAll,
    /// `fs::read_dir`
    ReadDir,
    /// `fs::read`
    Read,
    /// `fs::write`
    Write,
    /// `fs::remove_file`
    RemoveFile,
}

/// Errors produced by [`FileRotator`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A filesystem call failed
    #[error("IO error [{path}] during {operation:?}: {err}")]
    Io {
        /// The path being operated on
        path: PathBuf,
        /// The operation
        operation: IoOp,
        /// The error
        err: io::Error,
    },
    /// Renaming a segment failed
    #[error("rename error [{from} -> {to}]: {err}")]
    IoRename {
        /// The path being moved from
        from: PathBuf,
        /// The path being moved to
        to: PathBuf,
        /// The actual error
        err: io::Error,
    },
    /// A segment's contents could not be decoded
    #[error("unable to decode segment {path}: {source}")]
    Decode {
        /// The segment
        path: PathBuf,
        /// Decode failure
        source: collection::Error,
    },
}

/// Consumes the contents of segments.
pub trait SegmentReader {
    /// Absorb one segment's bytes.
    ///
    /// # Errors
    ///
    /// Fails if the bytes cannot be decoded.
    fn read(&mut self, data: &[u8]) -> Result<(), collection::Error>;
}

/// Transforms a segment in place. The rotator calls [`Rewriter::reset`],
/// then [`SegmentReader::read`] with the existing contents if any, then
/// [`Rewriter::write`] if [`Rewriter::should_write`] says so.
pub trait Rewriter: SegmentReader {
    /// Prepare for a new segment
    fn reset(&mut self);
    /// True when the segment must be rewritten
    fn should_write(&self) -> bool;
    /// Produce the new contents
    fn write(&mut self, out: &mut Vec<u8>);
}

/// Parsed segment file name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SegmentName {
    start: i64,
    end: Option<i64>,
}

impl SegmentName {
    fn parse(prefix: &str, file_name: &str) -> Option<Self> {
        let rest = file_name.strip_prefix(prefix)?.strip_prefix('.')?;
        let (start, end) = rest.split_once('-')?;
        let start = start.parse().ok()?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse().ok()?)
        };
        Some(Self { start, end })
    }

    fn build(&self, prefix: &str) -> String {
        match self.end {
            Some(end) => format!("{prefix}.{}-{end}", self.start),
            None => format!("{prefix}.{}-", self.start),
        }
    }

    fn is_active(&self) -> bool {
        self.end.is_none()
    }
}

/// Manages the segment files of one prefix.
#[derive(Debug, Clone)]
pub struct FileRotator {
    dir: PathBuf,
    prefix: String,
    rotate_age_ms: i64,
    delete_age_ms: i64,
}

impl FileRotator {
    /// Manage `PREFIX.*` segments under `dir`, creating `dir` if needed.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created.
    pub fn new(
        dir: &Path,
        prefix: &str,
        rotate_age_ms: i64,
        delete_age_ms: i64,
    ) -> Result<Self, Error> {
        fs::create_dir_all(dir).map_err(|err| Error::Io {
            path: dir.to_path_buf(),
            operation: IoOp::CreateDirAll,
            err,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            rotate_age_ms,
            delete_age_ms,
        })
    }

    /// The file name prefix
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Segments of this prefix, oldest first.
    fn segments(&self) -> Result<Vec<(PathBuf, SegmentName)>, Error> {
        let entries = fs::read_dir(&self.dir).map_err(|err| Error::Io {
            path: self.dir.clone(),
            operation: IoOp::ReadDir,
            err,
        })?;
        let mut segments = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Error::Io {
                path: self.dir.clone(),
                operation: IoOp::ReadDir,
                err,
            })?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = SegmentName::parse(&self.prefix, file_name) {
                segments.push((entry.path(), name));
            }
        }
        segments.sort_by_key(|(_, name)| (name.start, name.end));
        Ok(segments)
    }

    /// Paths of every segment, oldest first
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be listed.
    pub fn segment_paths(&self) -> Result<Vec<PathBuf>, Error> {
        Ok(self.segments()?.into_iter().map(|(path, _)| path).collect())
    }

    /// Delete every segment of this prefix.
    ///
    /// # Errors
    ///
    /// Fails if a segment cannot be removed.
    pub fn delete_all(&self) -> Result<(), Error> {
        for (path, _) in self.segments()? {
            remove(&path)?;
        }
        Ok(())
    }

    /// Rewrite the active segment, starting one at `now` if there is none.
    ///
    /// # Errors
    ///
    /// Fails on IO errors or if the existing segment cannot be decoded, in
    /// which case it is left untouched.
    pub fn rewrite_active(&self, rewriter: &mut dyn Rewriter, now: i64) -> Result<(), Error> {
        let active = self
            .segments()?
            .into_iter()
            .find(|(_, name)| name.is_active())
            .map_or_else(
                || {
                    self.dir
                        .join(SegmentName { start: now, end: None }.build(&self.prefix))
                },
                |(path, _)| path,
            );
        rewrite_single(&active, rewriter)
    }

    /// Rewrite every segment in turn.
    ///
    /// # Errors
    ///
    /// Stops at the first segment that cannot be read, decoded or written.
    pub fn rewrite_all(&self, rewriter: &mut dyn Rewriter) -> Result<(), Error> {
        for (path, _) in self.segments()? {
            rewrite_single(&path, rewriter)?;
        }
        Ok(())
    }

    /// Hand every segment overlapping `[start, end]` to `visit`, oldest
    /// first. `visit` decides what to do with undecodable segments.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be listed or a segment cannot be read.
    pub fn read_matching(
        &self,
        start: i64,
        end: i64,
        visit: &mut dyn FnMut(&Path, &[u8]),
    ) -> Result<(), Error> {
        for (path, name) in self.segments()? {
            let name_end = name.end.unwrap_or(i64::MAX);
            if name.start <= end && start <= name_end {
                let data = read(&path)?;
                visit(&path, &data);
            }
        }
        Ok(())
    }

    /// Close the active segment once it started more than the rotate age
    /// before `now`, and delete closed segments that ended more than the
    /// delete age before `now`.
    ///
    /// # Errors
    ///
    /// Fails if a segment cannot be renamed or removed.
    pub fn maybe_rotate(&self, now: i64) -> Result<(), Error> {
        let rotate_before = now.saturating_sub(self.rotate_age_ms);
        let delete_before = now.saturating_sub(self.delete_age_ms);
        for (path, mut name) in self.segments()? {
            match name.end {
                None if name.start <= rotate_before => {
                    name.end = Some(now);
                    let to = self.dir.join(name.build(&self.prefix));
                    info!(from = %path.display(), to = %to.display(), "rotating segment");
                    fs::rename(&path, &to).map_err(|err| Error::IoRename {
                        from: path.clone(),
                        to,
                        err,
                    })?;
                }
                Some(end) if end <= delete_before => {
                    info!(path = %path.display(), "deleting expired segment");
                    remove(&path)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn read(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|err| Error::Io {
        path: path.to_path_buf(),
        operation: IoOp::Read,
        err,
    })
}

fn remove(path: &Path) -> Result<(), Error> {
    fs::remove_file(path).map_err(|err| Error::Io {
        path: path.to_path_buf(),
        operation: IoOp::RemoveFile,
        err,
    })
}

fn rewrite_single(path: &Path, rewriter: &mut dyn Rewriter) -> Result<(), Error> {
    rewriter.reset();
    match fs::read(path) {
        Ok(data) => rewriter.read(&data).map_err(|source| Error::Decode {
            path: path.to_path_buf(),
            source,
        })?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(Error::Io {
                path: path.to_path_buf(),
                operation: IoOp::Read,
                err,
            });
        }
    }
    if !rewriter.should_write() {
        return Ok(());
    }

    let mut out = Vec::new();
    rewriter.write(&mut out);
    let mut temp = path.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    let temp = PathBuf::from(temp);
    fs::write(&temp, &out).map_err(|err| Error::Io {
        path: temp.clone(),
        operation: IoOp::Write,
        err,
    })?;
    fs::rename(&temp, path).map_err(|err| Error::IoRename {
        from: temp.clone(),
        to: path.to_path_buf(),
        err,
    })?;
    debug!(path = %path.display(), bytes = out.len(), "rewrote segment");
    Ok(())
}
