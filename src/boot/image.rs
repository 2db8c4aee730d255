//! Flat-binary guest image loading.
//!
//! Guest images are raw binaries, not ELF: whatever the file contains
//! is copied bytewise to the start address chosen by the paging setup,
//! and the first byte is the entry point (virtual address 0).

use super::memory::GuestMemory;
use super::BootError;
use std::fs::File;
use std::io::Read;

/// Copy size for streaming the image into guest memory.
const CHUNK_SIZE: usize = 1024;

/// Load the image at `path` into guest memory starting at
/// `start_address`.
///
/// The file is streamed in chunks rather than slurped, so images are
/// never held in host memory twice. Returns the number of bytes
/// loaded.
///
/// # Errors
///
/// `BootError::ReadImage` if the file cannot be opened or read,
/// `BootError::ImageTooLarge` if it does not fit between
/// `start_address` and the end of guest memory.
pub fn load_image(memory: &GuestMemory, start_address: u64, path: &str) -> Result<u64, BootError> {
    let mut file = File::open(path).map_err(|source| BootError::ReadImage {
        path: path.to_string(),
        source,
    })?;

    let mut buf = [0u8; CHUNK_SIZE];
    let mut offset = start_address;

    loop {
        let n = file.read(&mut buf).map_err(|source| BootError::ReadImage {
            path: path.to_string(),
            source,
        })?;
        if n == 0 {
            break;
        }

        memory
            .write(offset, &buf[..n])
            .map_err(|_| BootError::ImageTooLarge {
                path: path.to_string(),
            })?;
        offset += n as u64;
    }

    Ok(offset - start_address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    /// Scratch file that cleans up after itself.
    struct ScratchFile(PathBuf);

    impl ScratchFile {
        fn with_bytes(name: &str, bytes: &[u8]) -> Self {
            let path = std::env::temp_dir().join(format!("xenon-image-{}-{}", std::process::id(), name));
            let mut f = File::create(&path).unwrap();
            f.write_all(bytes).unwrap();
            ScratchFile(path)
        }

        fn path(&self) -> &str {
            self.0.to_str().unwrap()
        }
    }

    impl Drop for ScratchFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_load_places_bytes_at_start() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let img = ScratchFile::with_bytes("small", &[0xf4, 0x90, 0x90]);

        let loaded = load_image(&mem, 0x3000, img.path()).unwrap();
        assert_eq!(loaded, 3);

        let mut buf = [0u8; 3];
        mem.read(0x3000, &mut buf).unwrap();
        assert_eq!(buf, [0xf4, 0x90, 0x90]);
    }

    #[test]
    fn test_load_spans_chunks() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let bytes: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let img = ScratchFile::with_bytes("chunked", &bytes);

        let loaded = load_image(&mem, 0x1000, img.path()).unwrap();
        assert_eq!(loaded, 3000);

        let mut buf = vec![0u8; 3000];
        mem.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, bytes);
    }

    #[test]
    fn test_load_missing_file() {
        let mem = GuestMemory::new(0x1000).unwrap();
        assert!(matches!(
            load_image(&mem, 0, "/nonexistent/guest.img"),
            Err(BootError::ReadImage { .. })
        ));
    }

    #[test]
    fn test_load_too_large() {
        let mem = GuestMemory::new(0x1000).unwrap();
        let img = ScratchFile::with_bytes("big", &[0u8; 0x2000]);

        assert!(matches!(
            load_image(&mem, 0x800, img.path()),
            Err(BootError::ImageTooLarge { .. })
        ));
    }
}
