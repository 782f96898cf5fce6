//! Loads the recovery image from the SD card and boots it.
//!
//! Runs in the privileged kernel once the final chain copied it over. The
//! filesystem and the CPU are reached through [`Storage`] and [`Machine`].
//!
//! The image starts with a big-endian [`RecoveryHeader`]; every section is
//! copied to its physical address while interrupts and address
//! translation are off.

use bytes::{Buf, BufMut};
use std::cmp;
use thiserror::Error;

/// `'REC\0'`
pub const RECOVERY_MAGIC: u32 = 0x5245_4300;
pub const MAX_SECTIONS: usize = 14;
pub const SECTION_SIZE: usize = 0x10;
pub const HEADER_SIZE: usize = 0xc + MAX_SECTIONS * SECTION_SIZE;
pub const READ_CHUNK_SIZE: usize = 0x400;

pub const SD_DEVICE_PATH: &str = "/dev/sdcard01";
pub const VOLUME_PATH: &str = "/vol/storage_udpihsd";
pub const RECOVERY_PATH: &str = "/vol/storage_udpihsd/recovery_menu";
/// Global mount.
pub const MOUNT_FLAGS: u32 = 1 << 1;
pub const ENTRY_ARGUMENT: &str = "udpih";

/// A negative status returned by the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("filesystem error {0}")]
pub struct FsError(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(pub i32);

pub trait Storage {
    fn mount(&mut self, device: &str, volume: &str, flags: u32) -> Result<(), FsError>;
    fn unmount(&mut self, volume: &str, flags: u32) -> Result<(), FsError>;
    fn open(&mut self, path: &str, mode: &str) -> Result<FileHandle, FsError>;
    fn seek(&mut self, file: FileHandle, position: u32) -> Result<(), FsError>;
    /// Reads up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, file: FileHandle, buf: &mut [u8]) -> Result<usize, FsError>;
    fn close(&mut self, file: FileHandle) -> Result<(), FsError>;
}

/// The CPU the loader runs on.
pub trait Machine {
    /// Returns the previous interrupt level.
    fn disable_interrupts(&mut self) -> u32;
    fn restore_interrupts(&mut self, level: u32);
    /// Returns the previous control register.
    fn disable_mmu(&mut self) -> u32;
    fn restore_mmu(&mut self, control: u32);
    fn flush_dcache(&mut self, data: &[u8]);
    fn invalidate_dcache(&mut self);
    fn invalidate_icache(&mut self);

    /// Copies `data` to physical memory at `paddr`.
    ///
    /// # Safety
    ///
    /// Translation has to be off and `paddr..paddr + data.len()` must not
    /// overlap anything still in use.
    unsafe fn copy_to_physical(&mut self, paddr: u32, data: &[u8]);

    fn jump(&mut self, entry: u32, argument: &str) -> !;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Section {
    pub vaddr: u32,
    pub paddr: u32,
    pub size: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryHeader {
    pub entry: u32,
    pub sections: Vec<Section>,
}

impl RecoveryHeader {
    pub fn parse(data: &[u8]) -> Result<Self, LoadError> {
        if data.len() < HEADER_SIZE {
            return Err(LoadError::ShortHeader(data.len()));
        }

        let mut buf = &data[..HEADER_SIZE];
        let magic = buf.get_u32();
        if magic != RECOVERY_MAGIC {
            return Err(LoadError::BadMagic(magic));
        }
        let entry = buf.get_u32();
        let count = buf.get_u32();
        if count as usize > MAX_SECTIONS {
            return Err(LoadError::TooManySections(count));
        }

        let sections = (0..count)
            .map(|_| Section {
                vaddr: buf.get_u32(),
                paddr: buf.get_u32(),
                size: buf.get_u32(),
                offset: buf.get_u32(),
            })
            .collect();

        Ok(RecoveryHeader { entry, sections })
    }

    /// Encodes the header, zeroing unused section slots.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0; HEADER_SIZE];
        let mut out = &mut header[..];
        out.put_u32(RECOVERY_MAGIC);
        out.put_u32(self.entry);
        out.put_u32(self.sections.len() as u32);
        for section in self.sections.iter().take(MAX_SECTIONS) {
            out.put_u32(section.vaddr);
            out.put_u32(section.paddr);
            out.put_u32(section.size);
            out.put_u32(section.offset);
        }
        header
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("failed to mount the sd card: {0}")]
    Mount(FsError),
    #[error("failed to open the recovery image: {0}")]
    Open(FsError),
    #[error("failed to read the header: {0}")]
    ReadHeader(FsError),
    #[error("the header ends after {0:#x} bytes")]
    ShortHeader(usize),
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("{0} sections is more than the header holds")]
    TooManySections(u32),
    #[error("failed to load section {index}: {source}")]
    Section { index: usize, source: FsError },
    #[error("section {index} ends after {done:#x} of {size:#x} bytes")]
    Truncated { index: usize, done: u32, size: u32 },
}

impl LoadError {
    /// The negative status handed back to the caller of the loader.
    pub fn code(&self) -> i32 {
        match self {
            LoadError::Mount(err)
            | LoadError::Open(err)
            | LoadError::ReadHeader(err)
            | LoadError::Section { source: err, .. } => err.0,
            _ => -1,
        }
    }
}

/// The mounted volume and the open image; closes and unmounts when dropped.
struct Volume<'a, S: Storage> {
    storage: &'a mut S,
    file: Option<FileHandle>,
}

impl<'a, S: Storage> Volume<'a, S> {
    fn mount(storage: &'a mut S) -> Result<Self, LoadError> {
        storage
            .mount(SD_DEVICE_PATH, VOLUME_PATH, MOUNT_FLAGS)
            .map_err(LoadError::Mount)?;
        Ok(Volume {
            storage,
            file: None,
        })
    }

    fn open(&mut self, path: &str) -> Result<FileHandle, LoadError> {
        let file = self.storage.open(path, "rb").map_err(LoadError::Open)?;
        self.file = Some(file);
        Ok(file)
    }
}

impl<S: Storage> Drop for Volume<'_, S> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = self.storage.close(file) {
                log::warn!("closing the recovery image failed: {}", err);
            }
        }
        if let Err(err) = self.storage.unmount(VOLUME_PATH, MOUNT_FLAGS) {
            log::warn!("unmounting {} failed: {}", VOLUME_PATH, err);
        }
    }
}

pub struct RecoveryLoader<S, M> {
    storage: S,
    machine: M,
    staging: Box<[u8; READ_CHUNK_SIZE]>,
}

impl<S: Storage, M: Machine> RecoveryLoader<S, M> {
    pub fn new(storage: S, machine: M) -> Self {
        RecoveryLoader {
            storage,
            machine,
            staging: Box::new([0; READ_CHUNK_SIZE]),
        }
    }

    /// Copies every section of the image into place.
    pub fn load(&mut self) -> Result<RecoveryHeader, LoadError> {
        let mut volume = Volume::mount(&mut self.storage)?;
        let file = volume.open(RECOVERY_PATH)?;

        let read = volume
            .storage
            .read(file, &mut self.staging[..HEADER_SIZE])
            .map_err(LoadError::ReadHeader)?;
        let header = RecoveryHeader::parse(&self.staging[..cmp::min(read, HEADER_SIZE)])?;
        log::info!(
            "recovery image: entry {:#x}, {} sections",
            header.entry,
            header.sections.len()
        );

        for (index, section) in header.sections.iter().enumerate() {
            load_section(
                &mut volume,
                &mut self.machine,
                &mut self.staging,
                file,
                index,
                section,
            )?;
        }

        self.machine.invalidate_dcache();
        self.machine.invalidate_icache();

        Ok(header)
    }

    /// Loads the image and jumps to its entry. Only returns on failure.
    pub fn boot(mut self) -> LoadError {
        match self.load() {
            Ok(header) => self.machine.jump(header.entry, ENTRY_ARGUMENT),
            Err(err) => err,
        }
    }

    pub fn into_parts(self) -> (S, M) {
        (self.storage, self.machine)
    }
}

fn load_section<S: Storage, M: Machine>(
    volume: &mut Volume<'_, S>,
    machine: &mut M,
    staging: &mut [u8; READ_CHUNK_SIZE],
    file: FileHandle,
    index: usize,
    section: &Section,
) -> Result<(), LoadError> {
    let failed = |source| LoadError::Section { index, source };

    volume.storage.seek(file, section.offset).map_err(failed)?;

    let mut done = 0;
    while done < section.size {
        let chunk = cmp::min(section.size - done, READ_CHUNK_SIZE as u32) as usize;
        let read = cmp::min(volume.storage.read(file, &mut staging[..chunk]).map_err(failed)?, chunk);
        if read == 0 {
            return Err(LoadError::Truncated {
                index,
                done,
                size: section.size,
            });
        }

        machine.flush_dcache(&staging[..]);
        machine.invalidate_dcache();

        let level = machine.disable_interrupts();
        let control = machine.disable_mmu();
        unsafe { machine.copy_to_physical(section.paddr.wrapping_add(done), &staging[..read]) };
        machine.restore_mmu(control);
        machine.restore_interrupts(level);

        done += read as u32;
    }

    log::debug!("section {} loaded to {:#x}", index, section.paddr);
    Ok(())
}
