// Copyright (C) 2025 Paul Hampson
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License version 3 as  published by the
// Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

//! Where images come from.
//!
//! A [`SourceStore`] is shared by every session; the coordinator mounts it when the
//! first session opens an image and unmounts it when the last one is cleaned up.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::rc::Rc;

use busupdate_messages::RawBlobFooter;
use busupdate_messages::footer::{RAW_BLOB_DATA_OFFSET, RAW_BLOB_FOOTER_LEN};
use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind, ReadNorFlash};

/// Size of one slot on the external staging flash.
pub const FW_SLOT_SIZE: u32 = 1024 * 1024;
pub const FW_SLOT_COUNT: usize = 8;
/// Slots from here on hold raw blobs rather than firmware.
pub const FIRST_RAW_SLOT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Firmware image carrying an [`busupdate_messages::ImageFooter`] at its info offset
    Firmware,
    /// Staging slot holding a [`RawBlobFooter`] and the blob data behind it
    RawSlot,
    /// Any other file, sent as-is
    Data,
}

impl SourceKind {
    /// `.bin` files, in any case, are firmware; everything else is data.
    pub fn from_name(name: &str) -> Self {
        if name.to_ascii_lowercase().ends_with(".bin") {
            SourceKind::Firmware
        } else {
            SourceKind::Data
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceError {
    NotMounted,
    NotFound,
    OutOfRange,
    Io(std::io::ErrorKind),
    Flash(NorFlashErrorKind),
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound,
            kind => SourceError::Io(kind),
        }
    }
}

pub trait ImageSource {
    fn kind(&self) -> SourceKind;

    /// Number of bytes that can be read from the source.
    fn len(&self) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buffer.len()` bytes from `offset`, returning how many were read.
    /// Zero means `offset` is at or past the end.
    fn read_at(&mut self, offset: u32, buffer: &mut [u8]) -> Result<usize, SourceError>;

    /// Header stored in front of the data of a raw slot.
    fn blob_footer(&self) -> Option<RawBlobFooter> {
        None
    }
}

pub trait SourceStore {
    type Source: ImageSource;

    fn mount(&mut self) -> Result<(), SourceError>;
    fn unmount(&mut self);
    fn open(&mut self, name: &str) -> Result<Self::Source, SourceError>;
}

/// Read exactly `buffer.len()` bytes or fail.
pub(crate) fn read_exact_at<S: ImageSource + ?Sized>(
    source: &mut S,
    offset: u32,
    buffer: &mut [u8],
) -> Result<(), SourceError> {
    let mut filled = 0;
    while filled < buffer.len() {
        let got = source.read_at(offset + filled as u32, &mut buffer[filled..])?;
        if got == 0 {
            return Err(SourceError::OutOfRange);
        }
        filled += got;
    }
    Ok(())
}

/// Image files in a directory on the host filesystem.
pub struct DirectoryStore {
    root: PathBuf,
    mounted: bool,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), mounted: false }
    }
}

impl SourceStore for DirectoryStore {
    type Source = FileSource;

    fn mount(&mut self) -> Result<(), SourceError> {
        if !self.root.is_dir() {
            log::warn!("Image directory {} does not exist", self.root.display());
            return Err(SourceError::NotFound);
        }
        log::debug!("Mounted image directory {}", self.root.display());
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) {
        log::debug!("Unmounted image directory {}", self.root.display());
        self.mounted = false;
    }

    fn open(&mut self, name: &str) -> Result<FileSource, SourceError> {
        if !self.mounted {
            return Err(SourceError::NotMounted);
        }
        if name.is_empty() || name == ".." || name.contains(['/', '\\']) {
            return Err(SourceError::NotFound);
        }

        let file = File::open(self.root.join(name))?;
        let len = u32::try_from(file.metadata()?.len()).map_err(|_| SourceError::OutOfRange)?;
        Ok(FileSource { file, len, kind: SourceKind::from_name(name) })
    }
}

pub struct FileSource {
    file: File,
    len: u32,
    kind: SourceKind,
}

impl ImageSource for FileSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn len(&self) -> u32 {
        self.len
    }

    fn read_at(&mut self, offset: u32, buffer: &mut [u8]) -> Result<usize, SourceError> {
        if offset >= self.len {
            return Ok(0);
        }
        let want = buffer.len().min((self.len - offset) as usize);
        self.file.seek(SeekFrom::Start(offset as u64))?;

        let mut filled = 0;
        while filled < want {
            match self.file.read(&mut buffer[filled..want])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }
}

#[derive(Debug, Clone)]
struct MemoryImage {
    kind: SourceKind,
    data: Rc<[u8]>,
    footer: Option<RawBlobFooter>,
}

/// Named images held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    images: BTreeMap<String, MemoryImage>,
    mounted: bool,
    pub mount_count: usize,
    pub unmount_count: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image whose kind follows from its name.
    pub fn insert(&mut self, name: &str, data: impl Into<Vec<u8>>) {
        self.insert_with_kind(name, SourceKind::from_name(name), data);
    }

    pub fn insert_with_kind(&mut self, name: &str, kind: SourceKind, data: impl Into<Vec<u8>>) {
        let data: Vec<u8> = data.into();
        let image = MemoryImage { kind, data: Rc::from(data), footer: None };
        self.images.insert(name.to_string(), image);
    }

    /// Add a raw slot: a header describing `data`, which need not agree with it.
    pub fn insert_blob(&mut self, name: &str, footer: RawBlobFooter, data: impl Into<Vec<u8>>) {
        let data: Vec<u8> = data.into();
        let image = MemoryImage {
            kind: SourceKind::RawSlot,
            data: Rc::from(data),
            footer: Some(footer),
        };
        self.images.insert(name.to_string(), image);
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }
}

impl SourceStore for MemoryStore {
    type Source = MemorySource;

    fn mount(&mut self) -> Result<(), SourceError> {
        self.mounted = true;
        self.mount_count += 1;
        Ok(())
    }

    fn unmount(&mut self) {
        self.mounted = false;
        self.unmount_count += 1;
    }

    fn open(&mut self, name: &str) -> Result<MemorySource, SourceError> {
        if !self.mounted {
            return Err(SourceError::NotMounted);
        }
        let image = self.images.get(name).ok_or(SourceError::NotFound)?;
        Ok(MemorySource {
            kind: image.kind,
            data: image.data.clone(),
            footer: image.footer.clone(),
        })
    }
}

pub struct MemorySource {
    kind: SourceKind,
    data: Rc<[u8]>,
    footer: Option<RawBlobFooter>,
}

impl ImageSource for MemorySource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn len(&self) -> u32 {
        self.data.len() as u32
    }

    fn read_at(&mut self, offset: u32, buffer: &mut [u8]) -> Result<usize, SourceError> {
        let start = (offset as usize).min(self.data.len());
        let available = &self.data[start..];
        let n = available.len().min(buffer.len());
        buffer[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn blob_footer(&self) -> Option<RawBlobFooter> {
        self.footer.clone()
    }
}

/// Staging flash divided into [`FW_SLOT_COUNT`] fixed slots named `slot0` to `slot7`.
pub struct SlotStore<F> {
    flash: Rc<RefCell<F>>,
    mounted: bool,
}

impl<F: ReadNorFlash> SlotStore<F> {
    pub fn new(flash: F) -> Self {
        Self { flash: Rc::new(RefCell::new(flash)), mounted: false }
    }

    pub fn slot_address(slot: usize) -> u32 {
        slot as u32 * FW_SLOT_SIZE
    }

    fn parse_slot(name: &str) -> Option<usize> {
        name.strip_prefix("slot")?
            .parse::<usize>()
            .ok()
            .filter(|&slot| slot < FW_SLOT_COUNT)
    }
}

impl<F: ReadNorFlash> SourceStore for SlotStore<F> {
    type Source = SlotSource<F>;

    fn mount(&mut self) -> Result<(), SourceError> {
        if self.flash.borrow().capacity() < FW_SLOT_SIZE as usize {
            log::warn!("Staging flash is smaller than one slot");
            return Err(SourceError::NotFound);
        }
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) {
        self.mounted = false;
    }

    fn open(&mut self, name: &str) -> Result<SlotSource<F>, SourceError> {
        if !self.mounted {
            return Err(SourceError::NotMounted);
        }
        let slot = Self::parse_slot(name).ok_or(SourceError::NotFound)?;
        let base = Self::slot_address(slot);
        if base as usize + FW_SLOT_SIZE as usize > self.flash.borrow().capacity() {
            return Err(SourceError::OutOfRange);
        }

        if slot < FIRST_RAW_SLOT {
            return Ok(SlotSource {
                flash: self.flash.clone(),
                kind: SourceKind::Firmware,
                base,
                len: FW_SLOT_SIZE,
                footer: None,
            });
        }

        let mut header = [0u8; RAW_BLOB_FOOTER_LEN];
        self.flash
            .borrow_mut()
            .read(base, &mut header)
            .map_err(|e| SourceError::Flash(e.kind()))?;
        let footer = RawBlobFooter::from_bytes(&header).ok();
        let len = footer
            .as_ref()
            .map(|f| f.size.min(FW_SLOT_SIZE - RAW_BLOB_DATA_OFFSET))
            .unwrap_or(0);

        Ok(SlotSource {
            flash: self.flash.clone(),
            kind: SourceKind::RawSlot,
            base: base + RAW_BLOB_DATA_OFFSET,
            len,
            footer,
        })
    }
}

pub struct SlotSource<F> {
    flash: Rc<RefCell<F>>,
    kind: SourceKind,
    base: u32,
    len: u32,
    footer: Option<RawBlobFooter>,
}

impl<F: ReadNorFlash> ImageSource for SlotSource<F> {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn len(&self) -> u32 {
        self.len
    }

    fn read_at(&mut self, offset: u32, buffer: &mut [u8]) -> Result<usize, SourceError> {
        if offset >= self.len {
            return Ok(0);
        }
        let n = buffer.len().min((self.len - offset) as usize);
        self.flash
            .borrow_mut()
            .read(self.base + offset, &mut buffer[..n])
            .map_err(|e| SourceError::Flash(e.kind()))?;
        Ok(n)
    }

    fn blob_footer(&self) -> Option<RawBlobFooter> {
        self.footer.clone()
    }
}
