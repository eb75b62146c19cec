use anyhow::{Result, bail};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha1::{Digest, Sha1};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;

// --- ELF Header ---

pub struct ElfHeader {
	pub ident: [u8; 16],
	pub ty: u16,
	pub machine: u16,
	pub entry: u64,
	pub program_header_offset: u64,
	pub section_header_offset: u64,
	pub flags: u32,
	pub header_size: u16,
	pub program_header_entry_size: u16,
	pub program_header_count: u16,
	pub section_header_entry_size: u16,
	pub section_header_count: u16,
	pub section_header_string_index: u16,
}

impl ElfHeader {
	pub const SIZE: usize = 0x40;

	// Only the identity bytes are checked, everything else is taken as found.
	pub fn parse<R: Read>(r: &mut R) -> Result<Self> {
		let mut ident = [0u8; 16];
		r.read_exact(&mut ident)?;
		if ident[..4] != ELF_MAGIC {
			bail!("Invalid ELF magic");
		}
		if ident[4] != ELFCLASS64 {
			bail!("Invalid ELF class (got {}, expected {ELFCLASS64})", ident[4]);
		}

		let ty = r.read_u16::<BigEndian>()?;
		let machine = r.read_u16::<BigEndian>()?;
		let _version = r.read_u32::<BigEndian>()?;

		Ok(Self {
			ident,
			ty,
			machine,
			entry: r.read_u64::<BigEndian>()?,
			program_header_offset: r.read_u64::<BigEndian>()?,
			section_header_offset: r.read_u64::<BigEndian>()?,
			flags: r.read_u32::<BigEndian>()?,
			header_size: r.read_u16::<BigEndian>()?,
			program_header_entry_size: r.read_u16::<BigEndian>()?,
			program_header_count: r.read_u16::<BigEndian>()?,
			section_header_entry_size: r.read_u16::<BigEndian>()?,
			section_header_count: r.read_u16::<BigEndian>()?,
			section_header_string_index: r.read_u16::<BigEndian>()?,
		})
	}

	pub fn program_header_table_size(&self) -> u64 {
		self.program_header_count as u64 * self.program_header_entry_size as u64
	}
}

// --- Program Header ---

pub const PT_LOAD: u32 = 1;

pub struct ElfProgramHeader {
	pub ty: u32,
	pub flags: u32,
	pub offset: u64,
	pub virtual_address: u64,
	pub physical_address: u64,
	pub file_size: u64,
	pub memory_size: u64,
	pub alignment: u64,
}

impl ElfProgramHeader {
	pub const SIZE: usize = 0x38;

	fn parse<R: Read>(r: &mut R) -> Result<Self> {
		Ok(Self {
			ty: r.read_u32::<BigEndian>()?,
			flags: r.read_u32::<BigEndian>()?,
			offset: r.read_u64::<BigEndian>()?,
			virtual_address: r.read_u64::<BigEndian>()?,
			physical_address: r.read_u64::<BigEndian>()?,
			file_size: r.read_u64::<BigEndian>()?,
			memory_size: r.read_u64::<BigEndian>()?,
			alignment: r.read_u64::<BigEndian>()?,
		})
	}
}

// --- ELF File ---

pub struct ElfFile {
	pub header: ElfHeader,
	pub program_headers: Vec<ElfProgramHeader>,
}

impl ElfFile {
	pub fn parse(data: &[u8]) -> Result<Self> {
		let mut cursor = Cursor::new(data);
		let header = ElfHeader::parse(&mut cursor)?;

		let mut program_headers = Vec::with_capacity(header.program_header_count as usize);
		for i in 0..header.program_header_count as u64 {
			cursor.seek(SeekFrom::Start(header.program_header_offset.wrapping_add(i * header.program_header_entry_size as u64)))?;
			program_headers.push(ElfProgramHeader::parse(&mut cursor)?);
		}

		Ok(Self { header, program_headers })
	}

	// Same digest RPCS3 keys its patch entries on ("PPU-<hash>").
	pub fn ppu_hash(&self, data: &[u8]) -> Result<[u8; 20]> {
		let mut hasher = Sha1::new();
		for ph in &self.program_headers {
			let mut fields = Vec::with_capacity(24);
			fields.write_u32::<BigEndian>(ph.ty)?;
			fields.write_u32::<BigEndian>(ph.flags)?;

			if ph.ty == PT_LOAD && ph.memory_size != 0 {
				fields.write_u64::<BigEndian>(ph.virtual_address)?;
				fields.write_u64::<BigEndian>(ph.memory_size)?;
				hasher.update(&fields);

				let start = ph.offset as usize;
				let end = start.saturating_add(ph.file_size as usize);
				if end > data.len() {
					bail!("Segment at 0x{start:X} (size 0x{:X}) extends past end of file", ph.file_size);
				}
				hasher.update(&data[start..end]);
			} else {
				hasher.update(&fields);
			}
		}

		Ok(hasher.finalize().into())
	}
}

pub fn ppu_hash_hex(data: &[u8]) -> Result<String> {
	let hash = ElfFile::parse(data)?.ppu_hash(data)?;
	Ok(hash.iter().map(|b| format!("{b:02x}")).collect())
}

// Best-effort class check used by verification, leaves the stream position untouched.
pub fn is_elf64<R: Read + Seek>(r: &mut R) -> Result<bool> {
	let position = r.stream_position()?;
	r.seek(SeekFrom::Start(0))?;

	let mut ident = [0u8; 5];
	let result = match r.read_exact(&mut ident) {
		Ok(()) => Ok(ident[..4] == ELF_MAGIC && ident[4] == ELFCLASS64),
		Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
		Err(e) => Err(e.into()),
	};

	r.seek(SeekFrom::Start(position))?;
	result
}
