//! Placement of the kernel image and device tree into RAM, plus the boot
//! register convention.

use goblin::elf::{program_header::PT_LOAD, Elf};

use crate::cpu::Cpu;
use crate::dram::{Dram, MemoryError};
use crate::registers::{REG_A0, REG_A1};
use crate::VmError;

const ELF_MAGIC: &[u8; 4] = b"\x7FELF";

/// Where the boot images ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    pub entry: u32,
    /// One past the last RAM offset occupied by the kernel.
    pub kernel_end: u64,
    pub dtb_addr: Option<u32>,
}

/// Copy a kernel into RAM and return `(entry, kernel_end_offset)`.
///
/// ELF images are placed segment by segment at their physical addresses.
/// Anything else is treated as a flat `Image` loaded at the RAM base.
pub fn load_kernel(dram: &mut Dram, image: &[u8]) -> Result<(u32, u64), MemoryError> {
    if image.starts_with(ELF_MAGIC) {
        log::info!("Detected ELF payload, loading program segments...");
        return load_elf(dram, image);
    }

    if image.len() > dram.size() {
        return Err(MemoryError::ImageTooLarge {
            what: "kernel image".to_string(),
            len: image.len(),
            capacity: dram.size(),
        });
    }
    dram.write_bytes(0, image)?;
    log::info!(
        "Loaded raw kernel image ({} bytes) at 0x{:08x}",
        image.len(),
        dram.base
    );
    Ok((dram.base, image.len() as u64))
}

fn load_elf(dram: &mut Dram, buffer: &[u8]) -> Result<(u32, u64), MemoryError> {
    let elf = Elf::parse(buffer).map_err(|e| MemoryError::Elf(e.to_string()))?;
    let base = dram.base as u64;
    let dram_end = base + dram.size() as u64;
    let mut kernel_end = 0u64;

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_size = ph.p_filesz as usize;
        let mem_size = ph.p_memsz as usize;
        let file_offset = ph.p_offset as usize;
        let file_end = file_offset
            .checked_add(file_size)
            .filter(|end| *end <= buffer.len())
            .ok_or_else(|| {
                MemoryError::Elf(format!(
                    "segment exceeds file bounds (offset 0x{file_offset:x})"
                ))
            })?;

        let target_addr = if ph.p_paddr != 0 { ph.p_paddr } else { ph.p_vaddr };
        if target_addr < base {
            return Err(MemoryError::OutOfBounds(target_addr));
        }
        let seg_end = target_addr
            .checked_add(mem_size as u64)
            .filter(|end| *end <= dram_end)
            .ok_or_else(|| MemoryError::ImageTooLarge {
                what: format!("ELF segment at 0x{target_addr:08x}"),
                len: mem_size,
                capacity: dram.size(),
            })?;

        let dram_offset = target_addr - base;
        if file_size > 0 {
            dram.write_bytes(dram_offset, &buffer[file_offset..file_end])?;
        }
        if mem_size > file_size {
            dram.zero_range(dram_offset + file_size as u64, mem_size - file_size)?;
        }
        kernel_end = kernel_end.max(seg_end - base);
        log::debug!(
            "Loaded segment: addr=0x{:x}, filesz=0x{:x}, memsz=0x{:x}",
            target_addr,
            file_size,
            mem_size
        );
    }

    let entry = u32::try_from(elf.entry).map_err(|_| MemoryError::OutOfBounds(elf.entry))?;
    Ok((entry, kernel_end))
}

/// Copy the device-tree blob into the last `dtb.len()` bytes of RAM and
/// return its physical address.
pub fn place_device_tree(dram: &mut Dram, dtb: &[u8], kernel_end: u64) -> Result<u32, MemoryError> {
    let capacity = dram.size();
    if dtb.len() > capacity {
        return Err(MemoryError::ImageTooLarge {
            what: "device tree".to_string(),
            len: dtb.len(),
            capacity,
        });
    }
    let dtb_offset = (capacity - dtb.len()) as u64;
    if dtb_offset < kernel_end {
        return Err(MemoryError::Overlap {
            kernel_end,
            dtb_offset,
        });
    }
    dram.write_bytes(dtb_offset, dtb)?;

    let addr = dram.base.wrapping_add(dtb_offset as u32);
    log::info!("Device tree ({} bytes) placed at 0x{:08x}", dtb.len(), addr);
    Ok(addr)
}

/// Load the boot images and set up the hart the way Linux expects on entry:
/// PC at the kernel entry, a0 = hart id, a1 = DTB address.
pub fn boot(cpu: &mut Cpu, dram: &mut Dram, kernel: &[u8], dtb: Option<&[u8]>) -> Result<BootInfo, VmError> {
    let (entry, kernel_end) = load_kernel(dram, kernel)?;
    let dtb_addr = dtb
        .map(|blob| place_device_tree(dram, blob, kernel_end))
        .transpose()?;

    cpu.regs.pc = entry;
    cpu.write_reg(REG_A0, 0);
    cpu.write_reg(REG_A1, dtb_addr.unwrap_or(0));
    log::info!("Starting execution at 0x{entry:08x}");

    Ok(BootInfo {
        entry,
        kernel_end,
        dtb_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0x8000_0000;

    fn make_dram() -> Dram {
        Dram::new(BASE, 64 * 1024)
    }

    /// Minimal little-endian ELF32 executable with a single PT_LOAD segment.
    fn elf32_image(entry: u32, paddr: u32, payload: &[u8], memsz: u32) -> Vec<u8> {
        const EHDR_SIZE: u32 = 52;
        const PHDR_SIZE: u32 = 32;
        let data_offset = EHDR_SIZE + PHDR_SIZE;

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&0xF3u16.to_le_bytes()); // EM_RISCV
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&entry.to_le_bytes());
        out.extend_from_slice(&EHDR_SIZE.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        out.extend_from_slice(&40u16.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

        out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        out.extend_from_slice(&data_offset.to_le_bytes());
        out.extend_from_slice(&paddr.to_le_bytes()); // p_vaddr
        out.extend_from_slice(&paddr.to_le_bytes()); // p_paddr
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&memsz.to_le_bytes());
        out.extend_from_slice(&5u32.to_le_bytes()); // R+X
        out.extend_from_slice(&4u32.to_le_bytes());

        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn raw_image_loads_at_ram_base() {
        let mut dram = make_dram();
        let image = [0x97, 0x02, 0x00, 0x00, 0x13, 0x00, 0x00, 0x00];
        let (entry, end) = load_kernel(&mut dram, &image).unwrap();
        assert_eq!(entry, BASE);
        assert_eq!(end, 8);
        assert_eq!(&dram.data[..8], &image);
    }

    #[test]
    fn oversized_image_is_rejected() {
        let mut dram = Dram::new(BASE, 16);
        assert!(matches!(
            load_kernel(&mut dram, &[0u8; 17]),
            Err(MemoryError::ImageTooLarge { len: 17, capacity: 16, .. })
        ));
    }

    #[test]
    fn elf_segments_load_at_physical_address_with_bss_zeroed() {
        let mut dram = make_dram();
        dram.data[0x110..0x120].fill(0xAA);
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let image = elf32_image(BASE + 0x104, BASE + 0x100, &payload, 0x20);

        let (entry, end) = load_kernel(&mut dram, &image).unwrap();
        assert_eq!(entry, BASE + 0x104);
        assert_eq!(end, 0x120);
        assert_eq!(&dram.data[0x100..0x108], &payload);
        assert!(dram.data[0x108..0x120].iter().all(|b| *b == 0));
    }

    #[test]
    fn elf_segment_below_ram_is_rejected() {
        let mut dram = make_dram();
        let image = elf32_image(0x1000, 0x1000, &[0; 4], 4);
        assert_eq!(load_kernel(&mut dram, &image), Err(MemoryError::OutOfBounds(0x1000)));
    }

    #[test]
    fn device_tree_goes_to_top_of_ram() {
        let mut dram = make_dram();
        let dtb = [0xD0, 0x0D, 0xFE, 0xED];
        let addr = place_device_tree(&mut dram, &dtb, 0x100).unwrap();
        assert_eq!(addr, BASE + 64 * 1024 - 4);
        assert_eq!(&dram.data[64 * 1024 - 4..], &dtb);
    }

    #[test]
    fn device_tree_overlapping_kernel_is_rejected() {
        let mut dram = Dram::new(BASE, 32);
        assert_eq!(
            place_device_tree(&mut dram, &[0; 8], 28),
            Err(MemoryError::Overlap {
                kernel_end: 28,
                dtb_offset: 24
            })
        );
    }

    #[test]
    fn boot_sets_linux_entry_registers() {
        let mut dram = make_dram();
        let mut cpu = Cpu::new(0);
        cpu.write_reg(REG_A0, 0x55);

        let info = boot(&mut cpu, &mut dram, &[0x13, 0, 0, 0], Some(&[0xD0u8; 16][..])).unwrap();
        let dtb_addr = BASE + 64 * 1024 - 16;
        assert_eq!(info.dtb_addr, Some(dtb_addr));
        assert_eq!(cpu.pc(), BASE);
        assert_eq!(cpu.read_reg(REG_A0), 0);
        assert_eq!(cpu.read_reg(REG_A1), dtb_addr);

        let mut cpu = Cpu::new(0);
        let info = boot(&mut cpu, &mut dram, &[0x13, 0, 0, 0], None).unwrap();
        assert_eq!(info.dtb_addr, None);
        assert_eq!(cpu.read_reg(REG_A1), 0);
    }
}
