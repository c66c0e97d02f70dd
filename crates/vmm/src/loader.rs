//! Executable loading: building a fresh address space from an ELF image.
//!
//! Parsing is deliberately minimal — 64-bit little-endian `ET_EXEC` images
//! with `PT_LOAD` segments — and completely separated from mapping: parse
//! errors are [`ImageError`], mapping errors are [`Fault`], and a failure
//! anywhere tears the partially built space back down. The kernel never
//! panics on a bad image.

use alloc::vec::Vec;

use crate::addr::AddressTranslator;
use crate::frames::FrameAllocator;
use crate::kernel_space::KernelSpace;
use crate::space::{AddressSpace, SharedSpace};
use crate::{Fault, ImageError, Protection, VirtAddr, arch};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const DATA_LITTLE_ENDIAN: u8 = 1;
const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;

/// One loadable piece of an executable.
pub struct Segment<'a> {
    /// Where the segment lives in user space.
    pub vaddr: VirtAddr,
    /// Total size in memory; anything past `data` is zero-filled.
    pub mem_size: usize,
    /// File-backed bytes, copied to the start of the segment.
    pub data: &'a [u8],
    /// Protection for the mapping (always includes `USER`).
    pub prot: Protection,
}

/// A parsed executable: entry point plus loadable segments.
pub struct Image<'a> {
    /// The program entry point.
    pub entry: VirtAddr,
    /// The loadable segments, in file order.
    pub segments: Vec<Segment<'a>>,
}

fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, ImageError> {
    let raw = bytes
        .get(offset..offset + 2)
        .ok_or(ImageError::Truncated)?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, ImageError> {
    let raw = bytes
        .get(offset..offset + 4)
        .ok_or(ImageError::Truncated)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64, ImageError> {
    let raw = bytes
        .get(offset..offset + 8)
        .ok_or(ImageError::Truncated)?;
    let mut word = [0u8; 8];
    word.copy_from_slice(raw);
    Ok(u64::from_le_bytes(word))
}

/// Validates that `[addr, addr + size)` is a canonical user range.
fn user_range(addr: u64, size: u64) -> Result<VirtAddr, ImageError> {
    let addr = addr as usize;
    let end = addr.checked_add(size as usize).ok_or(ImageError::BadSegment)?;
    if !arch::validate_virtual(addr) || end > arch::USER_SPACE_END {
        return Err(ImageError::BadSegment);
    }
    Ok(VirtAddr::new(addr))
}

impl<'a> Image<'a> {
    /// Parses an ELF64 executable without touching any address space.
    pub fn parse_elf(bytes: &'a [u8]) -> Result<Self, ImageError> {
        let ident = bytes.get(0..6).ok_or(ImageError::Truncated)?;
        if ident[0..4] != ELF_MAGIC {
            return Err(ImageError::BadMagic);
        }
        if ident[4] != CLASS_64 || ident[5] != DATA_LITTLE_ENDIAN {
            return Err(ImageError::UnsupportedClass);
        }
        if read_u16(bytes, 16)? != ET_EXEC {
            return Err(ImageError::UnsupportedType);
        }

        let entry = user_range(read_u64(bytes, 24)?, 0)?;
        let phoff = read_u64(bytes, 32)? as usize;
        let phentsize = read_u16(bytes, 54)? as usize;
        let phnum = read_u16(bytes, 56)? as usize;

        let mut segments = Vec::new();
        for index in 0..phnum {
            let base = phoff + index * phentsize;
            if read_u32(bytes, base)? != PT_LOAD {
                continue;
            }
            let flags = read_u32(bytes, base + 4)?;
            let offset = read_u64(bytes, base + 8)? as usize;
            let vaddr = read_u64(bytes, base + 16)?;
            let file_size = read_u64(bytes, base + 32)? as usize;
            let mem_size = read_u64(bytes, base + 40)? as usize;

            if mem_size < file_size {
                return Err(ImageError::BadSegment);
            }
            let vaddr = user_range(vaddr, mem_size as u64)?;
            let data = bytes
                .get(offset..offset + file_size)
                .ok_or(ImageError::Truncated)?;

            let mut prot = Protection::USER;
            if flags & PF_W != 0 {
                prot |= Protection::WRITE;
            }
            if flags & PF_X != 0 {
                prot |= Protection::EXEC;
            }
            segments.push(Segment {
                vaddr,
                mem_size,
                data,
                prot,
            });
        }

        Ok(Self { entry, segments })
    }
}

/// A process image placed into a fresh address space.
pub struct LoadedImage {
    /// The populated space, ready to be handed to a task.
    pub space: SharedSpace,
    /// The program entry point.
    pub entry: VirtAddr,
    /// The first address past the user stack.
    pub stack_top: VirtAddr,
}

/// Builds a fresh address space holding `image` and a user stack of
/// `stack_size` bytes ending at the architecture's stack top.
///
/// On any failure the partially built space is destroyed — its frames go
/// back to the allocator — and the error propagates to the process
/// creation path.
pub fn load(
    image: &Image<'_>,
    kernel: &KernelSpace,
    stack_size: usize,
    frames: &mut dyn FrameAllocator,
) -> Result<LoadedImage, Fault> {
    let mut space = AddressSpace::new(kernel, frames)?;

    match populate(&mut space, image, stack_size, frames) {
        Ok(stack_top) => {
            log::debug!(
                "loaded image: {} segments, entry {}, stack {}",
                image.segments.len(),
                image.entry,
                stack_top,
            );
            Ok(LoadedImage {
                space: space.into_shared(),
                entry: image.entry,
                stack_top,
            })
        }
        Err(fault) => {
            space.destroy(frames);
            Err(fault)
        }
    }
}

fn populate(
    space: &mut AddressSpace,
    image: &Image<'_>,
    stack_size: usize,
    frames: &mut dyn FrameAllocator,
) -> Result<VirtAddr, Fault> {
    for segment in &image.segments {
        let start = segment.vaddr.align_down(arch::PAGE_SIZE);
        let span = (segment.vaddr - start) + segment.mem_size;
        space.map_user_range(start, span, segment.prot, frames)?;
        copy_into(space, segment.vaddr, segment.data)?;
    }

    let stack_size = (stack_size + arch::PAGE_SIZE - 1) & !(arch::PAGE_SIZE - 1);
    let stack_base = VirtAddr::new(arch::USER_STACK_TOP - stack_size);
    space.map_user_range(
        stack_base,
        stack_size,
        Protection::WRITE,
        frames,
    )?;

    Ok(VirtAddr::new(arch::USER_STACK_TOP))
}

/// Copies file bytes into a space that is not necessarily active, going
/// page by page through the direct map.
fn copy_into(space: &AddressSpace, vaddr: VirtAddr, data: &[u8]) -> Result<(), Fault> {
    let translator = AddressTranslator::current();
    let mut copied = 0;
    while copied < data.len() {
        let virt = vaddr + copied;
        let phys = space.translate(virt).ok_or(Fault::NotMapped)?;
        let page_remaining = arch::PAGE_SIZE - virt.page_offset();
        let chunk = page_remaining.min(data.len() - copied);
        // SAFETY: The destination frames were just allocated for this
        // space and nothing else references them yet.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data[copied..].as_ptr(),
                translator.phys_to_ptr::<u8>(phys.as_usize()),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::EmulatedFrames;
    use crate::kernel_space::{BootMap, MemoryRegion};
    use crate::paging::read_current;
    use crate::PhysAddr;

    fn setup() -> (KernelSpace, EmulatedFrames) {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(64 * 1024));
        }
        let mut frames = EmulatedFrames::new();
        let map = BootMap {
            normal: &[MemoryRegion::new(PhysAddr::new(0), 4 * arch::PAGE_SIZE)],
            device: &[],
        };
        let kernel = KernelSpace::bootstrap(&map, offset(), &mut frames);
        (kernel, frames)
    }

    fn offset() -> usize {
        arch::canonicalize_virtual(arch::USER_SPACE_END)
    }

    /// Builds a minimal ELF64 executable from (vaddr, mem_size, data,
    /// p_flags) descriptions.
    fn build_elf(entry: usize, segments: &[(usize, usize, &[u8], u32)]) -> Vec<u8> {
        const EHSIZE: usize = 64;
        const PHENTSIZE: usize = 56;

        let mut bytes = vec![0u8; EHSIZE + segments.len() * PHENTSIZE];
        bytes[0..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = CLASS_64;
        bytes[5] = DATA_LITTLE_ENDIAN;
        bytes[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        bytes[24..32].copy_from_slice(&(entry as u64).to_le_bytes());
        bytes[32..40].copy_from_slice(&(EHSIZE as u64).to_le_bytes());
        bytes[54..56].copy_from_slice(&(PHENTSIZE as u16).to_le_bytes());
        bytes[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes());

        for (index, (vaddr, mem_size, data, flags)) in segments.iter().enumerate() {
            let base = EHSIZE + index * PHENTSIZE;
            let offset = bytes.len();
            bytes.extend_from_slice(data);

            let phdr = &mut bytes[base..base + PHENTSIZE];
            phdr[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
            phdr[4..8].copy_from_slice(&flags.to_le_bytes());
            phdr[8..16].copy_from_slice(&(offset as u64).to_le_bytes());
            phdr[16..24].copy_from_slice(&(*vaddr as u64).to_le_bytes());
            phdr[32..40].copy_from_slice(&(data.len() as u64).to_le_bytes());
            phdr[40..48].copy_from_slice(&(*mem_size as u64).to_le_bytes());
        }
        bytes
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(
            Image::parse_elf(&[0u8; 8]).err(),
            Some(ImageError::BadMagic)
        );
        assert_eq!(Image::parse_elf(&[]).err(), Some(ImageError::Truncated));

        let mut relocatable = build_elf(0x100, &[]);
        relocatable[16] = 1; // ET_REL
        assert_eq!(
            Image::parse_elf(&relocatable).err(),
            Some(ImageError::UnsupportedType)
        );

        let mut wide = build_elf(0x100, &[]);
        wide[4] = 1; // 32-bit class
        assert_eq!(
            Image::parse_elf(&wide).err(),
            Some(ImageError::UnsupportedClass)
        );
    }

    #[test]
    fn parse_rejects_kernel_half_segments() {
        let elf = build_elf(
            0x100,
            &[(arch::USER_SPACE_END - arch::PAGE_SIZE, 2 * arch::PAGE_SIZE, &[], PF_W)],
        );
        assert_eq!(
            Image::parse_elf(&elf).err(),
            Some(ImageError::BadSegment)
        );
    }

    #[test]
    fn parse_extracts_segments_and_protection() {
        let code = [0x90u8; 16];
        let elf = build_elf(
            2 * arch::PAGE_SIZE,
            &[
                (2 * arch::PAGE_SIZE, 32, &code, PF_X),
                (4 * arch::PAGE_SIZE, 64, &[1, 2, 3], PF_W),
            ],
        );
        let image = Image::parse_elf(&elf).unwrap();
        assert_eq!(image.entry.as_usize(), 2 * arch::PAGE_SIZE);
        assert_eq!(image.segments.len(), 2);

        let text = &image.segments[0];
        assert!(text.prot.contains(Protection::EXEC | Protection::USER));
        assert!(!text.prot.contains(Protection::WRITE));
        assert_eq!(text.data, &code);
        assert_eq!(text.mem_size, 32);

        let data = &image.segments[1];
        assert!(data.prot.contains(Protection::WRITE));
        assert!(!data.prot.contains(Protection::EXEC));
    }

    #[test]
    fn load_places_segments_stack_and_zeroed_bss() {
        let (kernel, mut frames) = setup();
        let payload = [0xAB, 0xCD, 0xEF, 0x12];
        let vaddr = 2 * arch::PAGE_SIZE;
        // One page of file bytes, one page of BSS.
        let elf = build_elf(vaddr, &[(vaddr, 2 * arch::PAGE_SIZE, &payload, PF_W)]);
        let image = Image::parse_elf(&elf).unwrap();

        let loaded = load(&image, &kernel, 2 * arch::PAGE_SIZE, &mut frames).unwrap();
        assert_eq!(loaded.entry.as_usize(), vaddr);
        assert_eq!(loaded.stack_top.as_usize(), arch::USER_STACK_TOP);

        let space = loaded.space.lock();
        space.activate();
        let base = VirtAddr::new(vaddr);
        assert_eq!(
            read_current::<[u8; 4]>(base),
            Some(payload)
        );
        // Past the file bytes everything reads zero.
        assert_eq!(read_current::<u32>(base + 8), Some(0));
        assert_eq!(
            read_current::<u32>(base + arch::PAGE_SIZE),
            Some(0)
        );

        // The stack is mapped and writable, right below the top.
        let stack_page = VirtAddr::new(arch::USER_STACK_TOP - arch::PAGE_SIZE);
        assert!(space.translate(stack_page).is_some());
        let vma = space.find_vma(stack_page).unwrap();
        assert!(vma.prot().contains(Protection::WRITE));
        assert!(!vma.prot().contains(Protection::EXEC));
    }

    #[test]
    fn load_failure_destroys_the_partial_space() {
        let (kernel, mut frames) = setup();
        let baseline = frames.outstanding();

        let vaddr = 2 * arch::PAGE_SIZE;
        let elf = build_elf(vaddr, &[(vaddr, 4 * arch::PAGE_SIZE, &[0xFF], PF_W)]);
        let image = Image::parse_elf(&elf).unwrap();

        // Enough for the root and the first pages, not the whole image.
        frames.fail_after(4);
        let result = load(&image, &kernel, arch::PAGE_SIZE, &mut frames);
        assert!(matches!(result, Err(Fault::OutOfMemory)));
        assert_eq!(frames.outstanding(), baseline);
    }

    #[test]
    fn overlapping_segments_fail_as_already_mapped() {
        let (kernel, mut frames) = setup();
        let vaddr = 2 * arch::PAGE_SIZE;
        let elf = build_elf(
            vaddr,
            &[
                (vaddr, arch::PAGE_SIZE, &[], PF_X),
                (vaddr, arch::PAGE_SIZE, &[], PF_W),
            ],
        );
        let image = Image::parse_elf(&elf).unwrap();
        let result = load(&image, &kernel, arch::PAGE_SIZE, &mut frames);
        assert!(matches!(result, Err(Fault::AlreadyMapped)));
    }
}
