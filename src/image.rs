//! Loaded binary images and the lookup from a code address to its image.
//!
//! The table is captured once, at install time, by a host provider
//! ([`macho`] or [`elf`]). At crash time it is only read.

#[cfg(target_os = "linux")]
pub mod elf;
#[cfg(target_vendor = "apple")]
pub mod macho;

use alloc::vec::Vec;
use core::ffi::CStr;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::log::CrashLog;
use crate::memory;

/// Images past this many are dropped from the table.
pub const MAX_IMAGES: usize = 1024;

/// A span of an image's memory, such as one of its sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub address: usize,
    pub size: usize,
}

impl Region {
    pub const fn new(address: usize, size: usize) -> Self {
        Self { address, size }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, address: usize) -> bool {
        address
            .checked_sub(self.address)
            .is_some_and(|offset| offset < self.size)
    }

    /// The region's bytes.
    ///
    /// # Safety
    ///
    /// The region must be mapped and readable for as long as the slice is
    /// used, which holds for sections of an image that stays loaded.
    pub unsafe fn as_bytes<'a>(&self) -> Result<&'a [u8]> {
        if self.is_empty() {
            return Err(Error::MissingUnwindInfo);
        }
        memory::check_span(self.address, self.size)?;
        // SAFETY: The caller promises the region is mapped.
        Ok(unsafe {
            core::slice::from_raw_parts(
                core::ptr::with_exposed_provenance(self.address),
                self.size,
            )
        })
    }
}

/// What the unwinder knows about one loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Owned by the dynamic loader, valid while the image stays loaded.
    pub path: Option<&'static CStr>,
    pub load_address: usize,
    /// Size of the executable text, starting at `load_address`.
    pub text_size: usize,
    pub slide: usize,
    pub uuid: [u8; 16],
    /// `__unwind_info`
    pub unwind_info: Region,
    /// `__eh_frame` or `.eh_frame`
    pub eh_frame: Region,
    /// `.eh_frame_hdr`
    pub eh_frame_hdr: Region,
}

impl ImageDescriptor {
    pub const fn new(load_address: usize, text_size: usize) -> Self {
        Self {
            path: None,
            load_address,
            text_size,
            slide: 0,
            uuid: [0; 16],
            unwind_info: Region::new(0, 0),
            eh_frame: Region::new(0, 0),
            eh_frame_hdr: Region::new(0, 0),
        }
    }

    pub fn contains(&self, address: usize) -> bool {
        Region::new(self.load_address, self.text_size).contains(address)
    }

    /// A metadata region by section name, without the leading `__` or `.`.
    pub fn section(&self, name: &str) -> Option<Region> {
        let region = match name {
            "unwind_info" => self.unwind_info,
            "eh_frame" => self.eh_frame,
            "eh_frame_hdr" => self.eh_frame_hdr,
            _ => return None,
        };
        (!region.is_empty()).then_some(region)
    }
}

impl fmt::Display for ImageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self
            .path
            .map(|path| path.to_str().unwrap_or("<invalid utf-8>"))
            .unwrap_or("<unknown>");
        write!(
            f,
            "path: {path}, address: {:#x}, size: {:#x}, slide: {:#x}, uuid: ",
            self.load_address, self.text_size, self.slide
        )?;
        for byte in self.uuid {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Fixed capacity list of images.
#[derive(Debug, Clone)]
pub struct ImageTable {
    images: Vec<ImageDescriptor>,
}

impl Default for ImageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageTable {
    pub fn new() -> Self {
        Self {
            images: Vec::with_capacity(MAX_IMAGES),
        }
    }

    /// The images of the current process.
    pub fn capture() -> Self {
        let mut table = Self::new();
        #[cfg(target_os = "linux")]
        elf::capture(&mut table);
        #[cfg(target_vendor = "apple")]
        macho::capture(&mut table);
        debug!("captured {} images", table.len());
        table
    }

    /// Adds an image. Returns `false` once the table is full.
    pub fn push(&mut self, image: ImageDescriptor) -> bool {
        if self.images.len() == MAX_IMAGES {
            warn!("image table full, dropping image at {:#x}", image.load_address);
            return false;
        }
        self.images.push(image);
        true
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn as_slice(&self) -> &[ImageDescriptor] {
        &self.images
    }
}

/// Lookup state shared by every walk in the process.
#[derive(Debug)]
pub struct LocatorCache {
    /// `usize::MAX` until the first hit.
    last_found: AtomicUsize,
    /// Images below this index were already written to the crash log.
    logged: AtomicUsize,
}

impl LocatorCache {
    pub const fn new() -> Self {
        Self {
            last_found: AtomicUsize::new(usize::MAX),
            logged: AtomicUsize::new(0),
        }
    }

    pub fn logged(&self) -> usize {
        self.logged.load(Ordering::Relaxed)
    }
}

impl Default for LocatorCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Finds the image owning a code address.
#[derive(Debug, Clone, Copy)]
pub struct ImageLocator<'a> {
    images: &'a [ImageDescriptor],
    cache: &'a LocatorCache,
}

impl<'a> ImageLocator<'a> {
    pub fn new(images: &'a [ImageDescriptor], cache: &'a LocatorCache) -> Self {
        Self { images, cache }
    }

    /// The image whose text contains `address`.
    ///
    /// The last hit is tried first. Otherwise every image is scanned, and
    /// each one not yet in the crash log is written to it on the way.
    pub fn find(&self, address: usize, log: &mut dyn CrashLog) -> Result<&'a ImageDescriptor> {
        let last = self.cache.last_found.load(Ordering::Relaxed);
        if let Some(image) = self.images.get(last).filter(|image| image.contains(address)) {
            return Ok(image);
        }

        let mut found = None;
        for (index, image) in self.images.iter().enumerate() {
            if index >= self.cache.logged.load(Ordering::Relaxed) {
                log.image(image);
                self.cache.logged.store(index + 1, Ordering::Relaxed);
            }
            if found.is_none() && image.contains(address) {
                found = Some(index);
            }
        }

        let index = found.ok_or(Error::ImageNotFound(address))?;
        self.cache.last_found.store(index, Ordering::Relaxed);
        Ok(&self.images[index])
    }

    /// Writes every image not yet in the crash log.
    pub fn log_remaining(&self, log: &mut dyn CrashLog) {
        let logged = self.cache.logged.load(Ordering::Relaxed);
        for image in self.images.iter().skip(logged) {
            log.image(image);
        }
        self.cache.logged.store(self.images.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::testing::LineLog;

    fn table() -> ImageTable {
        let mut table = ImageTable::new();
        table.push(ImageDescriptor::new(0x1_0000_0000, 0x4000));
        table.push(ImageDescriptor::new(0x2_0000_0000, 0x8000));
        table.push(ImageDescriptor::new(0x3_0000_0000, 0x1000));
        table
    }

    #[test]
    fn containment_is_half_open() {
        let image = ImageDescriptor::new(0x1000, 0x100);
        assert!(!image.contains(0xfff));
        assert!(image.contains(0x1000));
        assert!(image.contains(0x10ff));
        assert!(!image.contains(0x1100));
    }

    #[test]
    fn full_scan_logs_each_image_once() {
        let table = table();
        let cache = LocatorCache::new();
        let locator = ImageLocator::new(table.as_slice(), &cache);
        let mut log = LineLog::default();

        let image = locator.find(0x2_0000_0010, &mut log).unwrap();
        assert_eq!(image.load_address, 0x2_0000_0000);
        assert_eq!(log.starting_with("[Binary:Load]").len(), 3);
        assert_eq!(cache.logged(), 3);

        // Cache hit, nothing new to report.
        locator.find(0x2_0000_7fff, &mut log).unwrap();
        locator.find(0x1_0000_0000, &mut log).unwrap();
        assert_eq!(log.lines.len(), 3);
    }

    #[test]
    fn first_lookup_in_the_first_image_still_logs_every_image() {
        let table = table();
        let cache = LocatorCache::default();
        let locator = ImageLocator::new(table.as_slice(), &cache);
        let mut log = LineLog::default();

        let image = locator.find(0x1_0000_0020, &mut log).unwrap();
        assert_eq!(image.load_address, 0x1_0000_0000);
        assert_eq!(log.starting_with("[Binary:Load]").len(), 3);
        assert_eq!(cache.logged(), 3);

        locator.log_remaining(&mut log);
        assert_eq!(log.lines.len(), 3);
    }

    #[test]
    fn images_are_logged_even_when_the_lookup_fails() {
        let table = table();
        let cache = LocatorCache::new();
        let locator = ImageLocator::new(table.as_slice(), &cache);
        let mut log = LineLog::default();

        assert_eq!(
            locator.find(0x42, &mut log),
            Err(Error::ImageNotFound(0x42))
        );
        assert_eq!(log.lines.len(), 3);
        locator.log_remaining(&mut log);
        assert_eq!(log.lines.len(), 3);
    }

    #[test]
    fn table_capacity() {
        let mut table = ImageTable::new();
        for i in 0..MAX_IMAGES {
            assert!(table.push(ImageDescriptor::new(0x1000 * (i + 1), 0x1000)));
        }
        assert!(!table.push(ImageDescriptor::new(0x1, 0x1)));
        assert_eq!(table.len(), MAX_IMAGES);
    }

    #[test]
    fn sections_by_name() {
        let mut image = ImageDescriptor::new(0x1000, 0x100);
        image.unwind_info = Region::new(0x1080, 0x10);
        assert_eq!(image.section("unwind_info"), Some(Region::new(0x1080, 0x10)));
        assert_eq!(image.section("eh_frame"), None);
        assert_eq!(image.section("text"), None);
    }

    #[test]
    fn region_bytes_are_guarded() {
        assert_eq!(
            unsafe { Region::new(0x10, 4).as_bytes() },
            Err(Error::PointerInvalid(0x10))
        );
        assert_eq!(
            unsafe { Region::new(0x1000, 0).as_bytes() },
            Err(Error::MissingUnwindInfo)
        );

        let data = [1u8, 2, 3, 4];
        let region = Region::new(data.as_ptr().addr(), data.len());
        assert_eq!(unsafe { region.as_bytes() }, Ok(&data[..]));
    }
}
