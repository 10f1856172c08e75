use std::io::{self, Write};
use std::path::Path;

use memmap2::Mmap;
use tempfile::NamedTempFile;

/// A cache entry spilled to its own file and read back through a read-only
/// mapping. Dropping the blob unmaps it and deletes the file.
pub(crate) struct MappedBlob {
    // Field order matters: the map must go before the file.
    map: Mmap,
    _file: NamedTempFile,
}

impl MappedBlob {
    pub(crate) fn write(dir: &Path, bytes: &[u8]) -> io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("entry-")
            .suffix(".bin")
            .tempfile_in(dir)?;
        file.write_all(bytes)?;
        file.flush()?;
        // SAFETY: the file is private to this blob and never written after mapping.
        let map = unsafe { Mmap::map(file.as_file())? };
        Ok(Self { map, _file: file })
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.map
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.len()
    }

    #[cfg(test)]
    fn path(&self) -> &Path {
        self._file.path()
    }
}
