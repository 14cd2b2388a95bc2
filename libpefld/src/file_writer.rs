//! The sized output buffer. The container is written into a buffer of known
//! size backed by a temporary file, then committed by renaming over the
//! destination, so a failed link never replaces an existing output with a
//! truncated one.

use crate::error::Context as _;
use crate::error::Result;
use memmap2::MmapOptions;
use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::ops::DerefMut;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct Output {
    path: PathBuf,
    tmp_path: PathBuf,
}

pub(crate) struct SizedOutput {
    file: Option<File>,
    pub(crate) out: OutputBuffer,
    path: PathBuf,
    tmp_path: PathBuf,
    committed: bool,
}

pub(crate) enum OutputBuffer {
    Mmap(memmap2::MmapMut),
    InMemory(Vec<u8>),
}

impl OutputBuffer {
    fn new(file: &File, file_size: u64) -> Self {
        Self::new_mmapped(file, file_size)
            .unwrap_or_else(|| Self::InMemory(vec![0; file_size as usize]))
    }

    fn new_mmapped(file: &File, file_size: u64) -> Option<Self> {
        file.set_len(file_size).ok()?;
        let mmap = unsafe { MmapOptions::new().map_mut(file) }.ok()?;
        Some(Self::Mmap(mmap))
    }
}

impl Deref for OutputBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap.deref(),
            OutputBuffer::InMemory(vec) => vec.deref(),
        }
    }
}

impl DerefMut for OutputBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap.deref_mut(),
            OutputBuffer::InMemory(vec) => vec.deref_mut(),
        }
    }
}

impl Output {
    pub(crate) fn new(path: &Path) -> Output {
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        Output {
            path: path.to_owned(),
            tmp_path: PathBuf::from(tmp_name),
        }
    }

    #[tracing::instrument(skip_all, name = "Create output file")]
    pub(crate) fn create(&self, file_size: u64) -> Result<SizedOutput> {
        let mut open_options = std::fs::OpenOptions::new();
        // Don't let any subprocess a caller spawns inherit the descriptor.
        std::os::unix::fs::OpenOptionsExt::custom_flags(&mut open_options, libc::O_CLOEXEC);

        let file = open_options
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.tmp_path)
            .with_context(|| format!("Failed to open `{}`", self.tmp_path.display()))?;

        let out = OutputBuffer::new(&file, file_size);

        Ok(SizedOutput {
            file: Some(file),
            out,
            path: self.path.clone(),
            tmp_path: self.tmp_path.clone(),
            committed: false,
        })
    }
}

impl SizedOutput {
    /// Flushes the buffer, marks the file executable and atomically moves it
    /// to its final name.
    #[tracing::instrument(skip_all, name = "Commit output file")]
    pub(crate) fn commit(mut self) -> Result {
        if let OutputBuffer::InMemory(bytes) = &self.out {
            let file = self.file.as_mut().expect("file taken before commit");
            file.write_all(bytes)
                .with_context(|| format!("Failed to write to {}", self.tmp_path.display()))?;
        }
        // Unmap before the rename; holding a writable map across it would
        // leave the committed file locked.
        self.out = OutputBuffer::InMemory(Vec::new());

        if let Some(file) = self.file.take() {
            // Making the file executable is best-effort only.
            let _ = make_executable(&file);
        }

        std::fs::rename(&self.tmp_path, &self.path)
            .with_context(|| format!("Failed to commit `{}`", self.path.display()))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for SizedOutput {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

fn make_executable(file: &File) -> Result {
    use std::os::unix::prelude::PermissionsExt;

    let mut permissions = file.metadata()?.permissions();
    let mut mode = PermissionsExt::mode(&permissions);
    // Set execute permission wherever we currently have read permission.
    mode |= (mode & 0o444) >> 2;
    PermissionsExt::set_mode(&mut permissions, mode);
    file.set_permissions(permissions)?;
    Ok(())
}
