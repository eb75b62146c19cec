use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchTargetKind {
	/// Full `http(s)://host[:port][/path]` string.
	Url,
	/// Bare server hostname, rewritten with the host part of the new URL.
	Host,
	/// 18-character key stored next to a `cookie` marker.
	Digest,
}

/// One rewritable string region of the executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTargetInfo {
	/// Absolute file offset of the first byte.
	pub offset: u64,
	/// Bytes that may be overwritten: the string plus its NUL padding, minus the final terminator.
	pub length: usize,
	pub data: String,
	pub kind: PatchTargetKind,
}

impl PatchTargetInfo {
	pub fn new(offset: u64, length: usize, data: String, kind: PatchTargetKind) -> Self {
		debug_assert!(length >= data.len());
		Self { offset, length, data, kind }
	}

	pub fn fits(&self, value: &str) -> bool {
		value.len() <= self.length
	}
}

impl fmt::Display for PatchTargetKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			PatchTargetKind::Url => "url",
			PatchTargetKind::Host => "host",
			PatchTargetKind::Digest => "digest",
		};
		f.pad(name)
	}
}

impl fmt::Display for PatchTargetInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:<6} 0x{:08X} [{:>3}] {}", self.kind, self.offset, self.length, self.data)
	}
}
