use anyhow::Result;
use byteorder::ReadBytesExt;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

use crate::scanner;
use crate::target::{PatchTargetInfo, PatchTargetKind};

pub const MAX_URL_LENGTH: usize = 100;
pub const PLACEHOLDER_HOST: &str = "lbpk.ps3.online.scea.com";
pub const MAX_HOST_LENGTH: usize = PLACEHOLDER_HOST.len() + 1;

pub const DIGEST_LENGTH: usize = 18;
pub const COOKIE_MARKER: &[u8; 8] = b"cookie\0\0";
// Centered on the marker.
pub const DIGEST_WINDOW: u64 = 1000;

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?[^\p{Cc}]//[A-Za-z0-9.:]+(/.*)?$").unwrap());
static HOST_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^lbpk\.ps3\.online\.sce[a-z]\.com$").unwrap());

/// Scans the whole stream and returns every patch target, URLs first, then hosts, then digests.
pub fn classify<R: Read + Seek>(r: &mut R) -> Result<Vec<PatchTargetInfo>> {
	let offsets = scanner::scan(r)?;

	let mut targets = filter_valid_urls(r, &offsets.http)?;
	let hosts = find_lbpk_domains(r, &offsets.lbpk)?;
	let (nested, hosts): (Vec<_>, Vec<_>) = hosts.into_iter().partition(|host| inside_url(&targets, host.offset));
	for host in &nested {
		debug!("Skipping host at 0x{:X}, already covered by a URL", host.offset);
	}
	targets.extend(hosts);
	targets.extend(find_digest_around_cookie(r, &offsets.cook)?);

	for target in &targets {
		info!("Found {} target at 0x{:X} ({} bytes): {}", target.kind, target.offset, target.length, target.data);
	}
	Ok(targets)
}

// A host inside a URL region is rewritten as part of that URL.
fn inside_url(urls: &[PatchTargetInfo], offset: u64) -> bool {
	urls.iter().any(|url| offset >= url.offset && offset <= url.offset + url.length as u64)
}

pub fn filter_valid_urls<R: Read + Seek>(r: &mut R, offsets: &[u64]) -> Result<Vec<PatchTargetInfo>> {
	let mut targets = Vec::new();
	for &offset in offsets {
		let Some((text, length)) = read_terminated_string(r, offset, MAX_URL_LENGTH)? else {
			continue;
		};

		// printf templates such as "http://%s/%s" share the prefix but are never the server URL
		if text.contains('%') {
			debug!("Skipping format string at 0x{offset:X}: {text}");
			continue;
		}
		if !URL_PATTERN.is_match(&text) {
			debug!("Skipping non-URL at 0x{offset:X}: {text}");
			continue;
		}

		targets.push(PatchTargetInfo::new(offset, length, text, PatchTargetKind::Url));
	}
	Ok(targets)
}

pub fn find_lbpk_domains<R: Read + Seek>(r: &mut R, offsets: &[u64]) -> Result<Vec<PatchTargetInfo>> {
	let mut targets = Vec::new();
	for &offset in offsets {
		let Some((text, length)) = read_terminated_string(r, offset, MAX_HOST_LENGTH)? else {
			continue;
		};

		if !HOST_PATTERN.is_match(&text) {
			debug!("Skipping non-host at 0x{offset:X}: {text}");
			continue;
		}

		targets.push(PatchTargetInfo::new(offset, length, text, PatchTargetKind::Host));
	}
	Ok(targets)
}

pub fn find_digest_around_cookie<R: Read + Seek>(r: &mut R, offsets: &[u64]) -> Result<Vec<PatchTargetInfo>> {
	let mut seen = BTreeSet::new();
	let mut targets = Vec::new();

	for &offset in offsets {
		r.seek(SeekFrom::Start(offset))?;
		let mut marker = [0u8; 8];
		match r.read_exact(&mut marker) {
			Ok(()) => {}
			Err(e) if e.kind() == ErrorKind::UnexpectedEof => continue,
			Err(e) => return Err(e.into()),
		}
		if &marker != COOKIE_MARKER {
			continue;
		}

		let window_start = offset.saturating_sub(DIGEST_WINDOW / 2);
		r.seek(SeekFrom::Start(window_start))?;
		let mut window = Vec::with_capacity(DIGEST_WINDOW as usize);
		(&mut *r).take(DIGEST_WINDOW).read_to_end(&mut window)?;

		let mut position = 0u64;
		for run in window.split(|&b| b == 0) {
			let run_offset = window_start + position;
			position += run.len() as u64 + 1;

			if run.len() != DIGEST_LENGTH || !run.iter().all(|&b| is_digest_char(b)) {
				continue;
			}
			if !seen.insert(run_offset) {
				continue;
			}

			let text = String::from_utf8_lossy(run).into_owned();
			targets.push(PatchTargetInfo::new(run_offset, DIGEST_LENGTH, text, PatchTargetKind::Digest));
		}
	}

	Ok(targets)
}

fn is_digest_char(b: u8) -> bool {
	matches!(b,
		b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9'
		| b'!' | b'@' | b'#' | b'$' | b'%' | b'^' | b'&' | b'*' | b'(' | b')'
		| b'?' | b'/' | b'<' | b'>' | b'~' | b'[' | b']')
}

// Reads the NUL-terminated string at `offset` and measures the NUL padding behind it.
// Returns the text and the writable length (text + padding, minus one kept terminator),
// or None if the string runs past `max_length`, hits end of file, or is not UTF-8.
fn read_terminated_string<R: Read + Seek>(r: &mut R, offset: u64, max_length: usize) -> Result<Option<(String, usize)>> {
	r.seek(SeekFrom::Start(offset))?;

	let mut bytes = Vec::new();
	loop {
		match read_byte(r)? {
			None => return Ok(None),
			Some(0) => break,
			Some(b) => {
				bytes.push(b);
				if bytes.len() > max_length {
					return Ok(None);
				}
			}
		}
	}

	let mut padding = 1;
	while let Some(0) = read_byte(r)? {
		padding += 1;
	}

	let length = bytes.len() + padding - 1;
	Ok(String::from_utf8(bytes).ok().map(|text| (text, length)))
}

fn read_byte<R: Read>(r: &mut R) -> Result<Option<u8>> {
	match r.read_u8() {
		Ok(b) => Ok(Some(b)),
		Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
		Err(e) => Err(e.into()),
	}
}
