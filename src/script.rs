use anyhow::{Context, Result};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Virtual address the executable's first segment is mapped at.
pub const LOAD_BIAS: u64 = 0x10000;
pub const PATCH_FORMAT_VERSION: &str = "1.2";

const PATCH_NAME: &str = "Custom Server";
const AUTHOR: &str = "eboot_patcher";
const NOTES: &str = "Redirects the game to a custom server.";

/// Labels copied into the patch block, nothing here affects the bytes patched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameMetadata {
	pub title: String,
	/// Either a bare serial (`BCUS98148`) or a full content id (`UP9000-BCUS98148_00-...`).
	pub content_id: String,
	pub version: String,
}

impl GameMetadata {
	pub fn serial(&self) -> &str {
		let id = self.content_id.as_str();
		if id.is_empty() {
			return "All";
		}
		match (id.as_bytes().get(6), id.get(7..16)) {
			(Some(b'-'), Some(serial)) => serial,
			_ => id,
		}
	}

	fn title(&self) -> &str {
		if self.title.is_empty() { "All" } else { &self.title }
	}

	fn version(&self) -> &str {
		if self.version.is_empty() { "All" } else { &self.version }
	}
}

pub struct PatchScript {
	ppu_hash: String,
	metadata: GameMetadata,
	entries: Vec<(u64, String)>,
}

impl PatchScript {
	pub fn new(ppu_hash: impl Into<String>, metadata: GameMetadata) -> Self {
		Self {
			ppu_hash: ppu_hash.into(),
			metadata,
			entries: Vec::new(),
		}
	}

	/// Adds a string write at file offset `offset`.
	pub fn push(&mut self, offset: u64, value: &str) {
		self.entries.push((offset + LOAD_BIAS, value.to_string()));
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn render(&self) -> String {
		self.to_string()
	}

	/// Appends the block to `path`, starting a new file with the format version line.
	pub fn append_to(&self, path: &Path) -> Result<()> {
		let mut file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(path)
			.with_context(|| format!("opening patch file: {}", path.display()))?;

		let mut text = String::new();
		if file.metadata()?.len() == 0 {
			text.push_str(&format!("Version: {PATCH_FORMAT_VERSION}\n\n"));
		}
		text.push_str(&self.render());

		file.write_all(text.as_bytes())
			.with_context(|| format!("writing patch file: {}", path.display()))?;
		Ok(())
	}
}

impl fmt::Display for PatchScript {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "PPU-{}:", self.ppu_hash)?;
		writeln!(f, "  \"{PATCH_NAME}\":")?;
		writeln!(f, "    Games:")?;
		writeln!(f, "      \"{}\":", escape(self.metadata.title()))?;
		writeln!(f, "        {}: [ {} ]", self.metadata.serial(), self.metadata.version())?;
		writeln!(f, "    Author: \"{AUTHOR}\"")?;
		writeln!(f, "    Notes: \"{NOTES}\"")?;
		writeln!(f, "    Patch Version: 1.0")?;
		writeln!(f, "    Patch:")?;
		for (address, value) in &self.entries {
			writeln!(f, "      - [ utf8, 0x{address:x}, \"{}\\0\" ]", escape(value))?;
		}
		writeln!(f)
	}
}

fn escape(value: &str) -> String {
	value.replace('\\', "\\\\").replace('"', "\\\"")
}
