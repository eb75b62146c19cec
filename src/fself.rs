use anyhow::Result;
use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, info};
use sha1::{Digest, Sha1};
use std::io::Write;

use crate::elf::{ElfFile, ElfHeader};

// Unsigned SELF container accepted by loaders that skip signature checks (RPCS3).
// Every field is big-endian, offsets count from the start of the output file.
// Offsets taken from the ELF are not validated; out-of-range values wrap.

// --- SCE Header ---

pub const SCE_MAGIC: u32 = 0x5343_4500;

pub struct SceHeader {
	pub magic: u32,
	pub version: u32,
	pub key_revision: u16,
	pub header_type: u16,
	pub metadata_offset: u32,
	pub header_length: u64,
	pub data_length: u64,
}

impl SceHeader {
	pub const SIZE: u64 = 0x20;

	fn write<W: Write>(&self, w: &mut W) -> Result<()> {
		w.write_u32::<BigEndian>(self.magic)?;
		w.write_u32::<BigEndian>(self.version)?;
		w.write_u16::<BigEndian>(self.key_revision)?;
		w.write_u16::<BigEndian>(self.header_type)?;
		w.write_u32::<BigEndian>(self.metadata_offset)?;
		w.write_u64::<BigEndian>(self.header_length)?;
		w.write_u64::<BigEndian>(self.data_length)?;
		Ok(())
	}
}

// --- SELF Header ---

pub struct SelfHeader {
	pub header_type: u64,
	pub app_info_offset: u64,
	pub elf_offset: u64,
	pub program_header_offset: u64,
	pub section_header_offset: u64,
	pub section_info_offset: u64,
	pub sce_version_offset: u64,
	pub control_info_offset: u64,
	pub control_info_size: u64,
}

impl SelfHeader {
	pub const SIZE: u64 = 0x50;

	fn write<W: Write>(&self, w: &mut W) -> Result<()> {
		w.write_u64::<BigEndian>(self.header_type)?;
		w.write_u64::<BigEndian>(self.app_info_offset)?;
		w.write_u64::<BigEndian>(self.elf_offset)?;
		w.write_u64::<BigEndian>(self.program_header_offset)?;
		w.write_u64::<BigEndian>(self.section_header_offset)?;
		w.write_u64::<BigEndian>(self.section_info_offset)?;
		w.write_u64::<BigEndian>(self.sce_version_offset)?;
		w.write_u64::<BigEndian>(self.control_info_offset)?;
		w.write_u64::<BigEndian>(self.control_info_size)?;
		w.write_u64::<BigEndian>(0)?; // padding
		Ok(())
	}
}

// --- App Info ---

pub struct AppInfo {
	pub auth_id: u64,
	pub vendor_id: u32,
	pub self_type: u32,
	pub version: u64,
}

impl AppInfo {
	pub const SIZE: u64 = 0x20;

	fn write<W: Write>(&self, w: &mut W) -> Result<()> {
		w.write_u64::<BigEndian>(self.auth_id)?;
		w.write_u32::<BigEndian>(self.vendor_id)?;
		w.write_u32::<BigEndian>(self.self_type)?;
		w.write_u64::<BigEndian>(self.version)?;
		w.write_u64::<BigEndian>(0)?; // padding
		Ok(())
	}
}

impl Default for AppInfo {
	fn default() -> Self {
		Self {
			auth_id: 0x1010_0000_0100_0003,
			vendor_id: 0x0100_0002,
			self_type: 4, // application
			version: 0x0001_0000_0000_0000,
		}
	}
}

// --- Segment Info ---

pub struct SegmentInfo {
	pub offset: u64,
	pub size: u64,
	pub compressed: u32,
	pub encrypted: u32,
}

impl SegmentInfo {
	pub const SIZE: u64 = 0x20;

	fn write<W: Write>(&self, w: &mut W) -> Result<()> {
		w.write_u64::<BigEndian>(self.offset)?;
		w.write_u64::<BigEndian>(self.size)?;
		w.write_u32::<BigEndian>(self.compressed)?;
		w.write_u32::<BigEndian>(0)?;
		w.write_u32::<BigEndian>(0)?;
		w.write_u32::<BigEndian>(self.encrypted)?;
		Ok(())
	}
}

// --- SCE Version ---

pub struct SceVersionInfo;

impl SceVersionInfo {
	pub const SIZE: u64 = 0x10;

	fn write<W: Write>(&self, w: &mut W) -> Result<()> {
		w.write_u32::<BigEndian>(1)?; // sub header type
		w.write_u32::<BigEndian>(0)?; // present
		w.write_u32::<BigEndian>(Self::SIZE as u32)?;
		w.write_u32::<BigEndian>(0)?;
		Ok(())
	}
}

pub struct SceVersionData;

impl SceVersionData {
	pub const SIZE: u64 = 0x10;

	fn write<W: Write>(&self, w: &mut W) -> Result<()> {
		w.write_u16::<BigEndian>(1)?;
		w.write_u16::<BigEndian>(0)?;
		w.write_u32::<BigEndian>(0)?;
		w.write_u64::<BigEndian>(0)?;
		Ok(())
	}
}

// --- Control Info ---

// Placeholder digest found in working fake SELFs, not derived from the input.
pub const CONTROL_DIGEST: [u8; 20] = [
	0x62, 0x7C, 0xB1, 0x80, 0x8A, 0xB9, 0x38, 0xE3, 0x2C, 0x8C, 0x09, 0x17, 0x08, 0x72, 0x6A, 0x57, 0x9E, 0x25, 0x86, 0xE4,
];

pub struct ControlInfo {
	pub ty: u32,
	pub next: u64,
	pub digest: [u8; 20],
	pub elf_digest: [u8; 20],
}

impl ControlInfo {
	pub const SIZE: u64 = 0x40;

	pub fn for_elf(elf: &[u8]) -> Self {
		Self {
			ty: 2, // file digest
			next: 0,
			digest: CONTROL_DIGEST,
			elf_digest: Sha1::digest(elf).into(),
		}
	}

	fn write<W: Write>(&self, w: &mut W) -> Result<()> {
		w.write_u32::<BigEndian>(self.ty)?;
		w.write_u32::<BigEndian>(Self::SIZE as u32)?;
		w.write_u64::<BigEndian>(self.next)?;
		w.write_all(&self.digest)?;
		w.write_all(&self.elf_digest)?;
		w.write_all(&[0u8; 8])?;
		Ok(())
	}
}

// --- Layout ---

pub const PREAMBLE_SIZE: u64 = SceHeader::SIZE + SelfHeader::SIZE + AppInfo::SIZE;

/// Offsets of every region in the synthesized file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfLayout {
	pub elf_offset: u64,
	pub program_header_offset: u64,
	pub section_info_offset: u64,
	pub sce_version_offset: u64,
	pub control_info_offset: u64,
	/// Where the embedded ELF image starts.
	pub header_length: u64,
}

impl SelfLayout {
	pub fn new(header: &ElfHeader) -> Self {
		let elf_offset = PREAMBLE_SIZE;
		let program_header_offset = elf_offset.wrapping_add(header.program_header_offset);
		let section_info_offset = elf_offset + header.header_size as u64 + header.program_header_table_size();
		let sce_version_offset = section_info_offset + header.program_header_count as u64 * SegmentInfo::SIZE;
		let control_info_offset = sce_version_offset + SceVersionInfo::SIZE + SceVersionData::SIZE;
		let header_length = control_info_offset + ControlInfo::SIZE;

		Self {
			elf_offset,
			program_header_offset,
			section_info_offset,
			sce_version_offset,
			control_info_offset,
			header_length,
		}
	}
}

/// Wraps a decrypted ELF into an unsigned SELF.
pub fn synthesize(elf: &[u8]) -> Result<Vec<u8>> {
	let parsed = ElfFile::parse(elf)?;
	let header = &parsed.header;
	let layout = SelfLayout::new(header);
	debug!("SELF layout: {layout:X?}");

	let sce_header = SceHeader {
		magic: SCE_MAGIC,
		version: 2,
		key_revision: 0x8000, // fake signed
		header_type: 1,       // SELF
		metadata_offset: 0,
		header_length: layout.header_length,
		data_length: elf.len() as u64,
	};

	let self_header = SelfHeader {
		header_type: 3,
		app_info_offset: SceHeader::SIZE + SelfHeader::SIZE,
		elf_offset: layout.elf_offset,
		program_header_offset: layout.program_header_offset,
		section_header_offset: header.section_header_offset.wrapping_add(layout.header_length),
		section_info_offset: layout.section_info_offset,
		sce_version_offset: layout.sce_version_offset,
		control_info_offset: layout.control_info_offset,
		control_info_size: ControlInfo::SIZE,
	};

	let mut out = Vec::with_capacity(layout.header_length as usize + elf.len());
	sce_header.write(&mut out)?;
	self_header.write(&mut out)?;
	AppInfo::default().write(&mut out)?;

	let header_end = (header.header_size as usize).min(elf.len());
	out.extend_from_slice(&elf[..header_end]);
	let table_start = header.program_header_offset as usize;
	let table_end = table_start.checked_add(header.program_header_table_size() as usize);
	if let Some(table) = table_end.and_then(|end| elf.get(table_start..end)) {
		out.extend_from_slice(table);
	}

	for ph in &parsed.program_headers {
		SegmentInfo {
			offset: ph.offset.wrapping_add(layout.header_length),
			size: ph.file_size,
			compressed: 1,
			encrypted: 1,
		}
		.write(&mut out)?;
	}

	SceVersionInfo.write(&mut out)?;
	SceVersionData.write(&mut out)?;
	ControlInfo::for_elf(elf).write(&mut out)?;

	out.extend_from_slice(elf);
	info!("Built fake SELF: 0x{:X} byte header, 0x{:X} byte ELF", layout.header_length, elf.len());
	Ok(out)
}
