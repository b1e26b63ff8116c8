//! Walking a whole stack, one frame at a time.
//!
//! For every frame the unwind metadata of the owning image is tried first:
//! compact unwind when the image has it (possibly delegating to DWARF),
//! otherwise the FDE found through `.eh_frame_hdr`. When there is no image,
//! no metadata, or the metadata cannot be applied, the frame pointer chain
//! is followed instead.

pub mod fp;


use crate::arch::{CompactStep, Registers, Step};
use crate::compact;
use crate::dwarf::{self, divination::EhFrameHeader};
use crate::error::{Error, Result};
use crate::image::{ImageDescriptor, ImageLocator};
use crate::log::CrashLog;
use crate::memory::Memory;

/// Walks longer than this are reported as failures.
pub const DEFAULT_MAX_FRAMES: usize = 512;

/// Which unwind source produced a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMethod {
    /// Compact unwind info, without delegating to DWARF.
    Compact,
    /// An FDE, found through compact unwind info or `.eh_frame`.
    Dwarf,
    FramePointer,
}

pub struct Unwinder<'a, M> {
    locator: ImageLocator<'a>,
    memory: M,
    max_frames: usize,
}

impl<'a, M: Memory> Unwinder<'a, M> {
    /// # Safety
    ///
    /// Every metadata region of every image the locator knows must be mapped
    /// for as long as the unwinder is used.
    pub unsafe fn new(locator: ImageLocator<'a>, memory: M, max_frames: usize) -> Self {
        Self {
            locator,
            memory,
            max_frames,
        }
    }

    /// Logs every frame from `registers` down to the end of the stack and
    /// returns how many there were.
    ///
    /// A walk that stops early says why in the crash log.
    pub fn walk<R: Registers>(&self, registers: &R, log: &mut dyn CrashLog) -> Result<usize> {
        let mut registers = registers.clone();
        for index in 0..self.max_frames {
            log.frame(R::strip_pointer(registers.ip()), registers.sp(), registers.fp());
            match self.step(&registers, index == 0, log) {
                Ok(Step::Caller(caller)) => registers = caller,
                Ok(Step::EndOfStack) => return Ok(index + 1),
                Err(err) => {
                    trace!("failed to step registers at frame {index}: {err}");
                    log.unwind_failed(index, err);
                    return Err(err);
                }
            }
        }
        let err = Error::FrameLimit(self.max_frames);
        log.unwind_failed(self.max_frames, err);
        Err(err)
    }

    /// Steps from one frame to its caller.
    ///
    /// Only the interrupted frame's instruction pointer is looked up as is.
    /// Every other one is a return address, which can already belong to the
    /// next function when the call was the last instruction.
    pub fn step<R: Registers>(&self, registers: &R, first: bool, log: &mut dyn CrashLog) -> Result<Step<R>> {
        self.step_with_method(registers, first, log).map(|(step, _)| step)
    }

    /// Like [`Self::step`], also telling which unwind source was used.
    #[instrument(level = "trace", skip_all, fields(ip = format_args!("{:#x}", registers.ip())))]
    pub fn step_with_method<R: Registers>(
        &self,
        registers: &R,
        first: bool,
        log: &mut dyn CrashLog,
    ) -> Result<(Step<R>, StepMethod)> {
        let ip = R::strip_pointer(registers.ip());
        let pc = if first { ip } else { ip.saturating_sub(1) };

        match self.step_with_metadata(registers, pc, log) {
            Ok(step) => return Ok(step),
            Err(Error::MissingUnwindInfo) => trace!("no unwind info for {pc:#x}"),
            Err(err) => trace!("unwind info for {pc:#x} unusable: {err}"),
        }
        fp::step(registers, &self.memory).map(|step| (step, StepMethod::FramePointer))
    }

    fn step_with_metadata<R: Registers>(
        &self,
        registers: &R,
        pc: usize,
        log: &mut dyn CrashLog,
    ) -> Result<(Step<R>, StepMethod)> {
        let image = self.locator.find(pc, log)?;
        if pc <= image.load_address {
            return Err(Error::ArgumentInvalid("pc at or before the image load address"));
        }

        let fde_offset = match image.section("unwind_info") {
            Some(unwind_info) => {
                // SAFETY: Regions are mapped, see `new`.
                let unwind_info = unsafe { unwind_info.as_bytes()? };
                match compact::step(unwind_info, image.load_address, pc, registers, &self.memory)? {
                    CompactStep::Step(step) => return Ok((step, StepMethod::Compact)),
                    CompactStep::Dwarf(offset) => {
                        trace!("compact unwind delegates to the FDE at {offset:#x}");
                        offset as usize
                    }
                }
            }
            None => self.find_fde(image, pc)?,
        };
        let step = self.step_dwarf(image, fde_offset, pc, registers)?;
        Ok((step, StepMethod::Dwarf))
    }

    fn find_fde(&self, image: &ImageDescriptor, pc: usize) -> Result<usize> {
        let eh_frame = image.section("eh_frame").ok_or(Error::MissingUnwindInfo)?;
        let Some(hdr) = image.section("eh_frame_hdr") else {
            // SAFETY: Regions are mapped, see `new`.
            return dwarf::find_fde(unsafe { eh_frame.as_bytes()? }, pc);
        };

        // SAFETY: Regions are mapped, see `new`.
        let header = EhFrameHeader::parse(unsafe { hdr.as_bytes()? })?;
        let address = header.find_fde(pc)?;
        address
            .checked_sub(eh_frame.address)
            .filter(|&offset| offset < eh_frame.size)
            .ok_or(Error::InconsistentData("FDE outside of .eh_frame"))
    }

    fn step_dwarf<R: Registers>(
        &self,
        image: &ImageDescriptor,
        fde_offset: usize,
        pc: usize,
        registers: &R,
    ) -> Result<Step<R>> {
        let eh_frame = image.section("eh_frame").ok_or(Error::MissingUnwindInfo)?;
        // SAFETY: Regions are mapped, see `new`.
        let eh_frame = unsafe { eh_frame.as_bytes()? };
        dwarf::step_registers(eh_frame, fde_offset, pc, registers, &self.memory)
    }
}
