use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::io::{Read, Seek, SeekFrom};

const WINDOW_SIZE: usize = 8;
const WORD_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicWord {
	Http,
	Cook,
	Lbpk,
}

impl MagicWord {
	pub const ALL: [MagicWord; 3] = [MagicWord::Http, MagicWord::Cook, MagicWord::Lbpk];

	pub fn value(self) -> u32 {
		let bytes = match self {
			MagicWord::Http => b"http",
			MagicWord::Cook => b"cook",
			MagicWord::Lbpk => b"lbpk",
		};
		LittleEndian::read_u32(bytes)
	}
}

/// Start offsets of every magic word occurrence, ascending.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MagicOffsets {
	pub http: Vec<u64>,
	pub cook: Vec<u64>,
	pub lbpk: Vec<u64>,
}

impl MagicOffsets {
	fn push(&mut self, word: MagicWord, offset: u64) {
		match word {
			MagicWord::Http => self.http.push(offset),
			MagicWord::Cook => self.cook.push(offset),
			MagicWord::Lbpk => self.lbpk.push(offset),
		}
	}
}

pub fn scan<R: Read + Seek>(r: &mut R) -> Result<MagicOffsets> {
	r.seek(SeekFrom::Start(0))?;
	let mut data = Vec::new();
	r.read_to_end(&mut data)?;

	let offsets = scan_bytes(&data);
	debug!(
		"Scanned 0x{:X} bytes: {} http, {} cook, {} lbpk",
		data.len(),
		offsets.http.len(),
		offsets.cook.len(),
		offsets.lbpk.len()
	);
	Ok(offsets)
}

/// Finds every magic word by checking each 8-byte window's 5 word starts.
///
/// After a hit the scan resumes right behind the matched word, otherwise at the
/// first start the window could not check. Every byte offset is examined, so the
/// result is a superset of what stepping a full 8 bytes past an empty window finds.
pub fn scan_bytes(data: &[u8]) -> MagicOffsets {
	let mut offsets = MagicOffsets::default();
	let mut position = 0usize;

	while position + WORD_SIZE <= data.len() {
		let window = &data[position..(position + WINDOW_SIZE).min(data.len())];
		let starts = window.len() - WORD_SIZE + 1;

		let hit = (0..starts).find_map(|start| {
			let word = LittleEndian::read_u32(&window[start..start + WORD_SIZE]);
			MagicWord::ALL.into_iter().find(|magic| magic.value() == word).map(|magic| (start, magic))
		});

		match hit {
			Some((start, magic)) => {
				let offset = position + start;
				offsets.push(magic, offset as u64);
				position = offset + WORD_SIZE;
			}
			None => position += starts,
		}
	}

	offsets
}
