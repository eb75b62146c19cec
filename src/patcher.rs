use anyhow::{Context, Result, bail};
use log::{debug, error, info, warn};
use sha1::{Digest, Sha1};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use url::Url;

use crate::classifier::{self, DIGEST_LENGTH};
use crate::elf;
use crate::script::{GameMetadata, PatchScript};
use crate::target::{PatchTargetInfo, PatchTargetKind};

/// Written over every digest key when digest patching is requested.
pub const CUSTOM_DIGEST: &str = "CustomServerDigest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
	Warning,
	Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub level: MessageLevel,
	pub text: String,
}

impl Message {
	fn warning(text: impl Into<String>) -> Self {
		Self { level: MessageLevel::Warning, text: text.into() }
	}

	fn error(text: impl Into<String>) -> Self {
		Self { level: MessageLevel::Error, text: text.into() }
	}

	pub fn is_error(&self) -> bool {
		self.level == MessageLevel::Error
	}
}

/// Where an RPCS3 patch block goes and how it is labeled.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
	pub path: PathBuf,
	pub metadata: GameMetadata,
}

pub enum PatchMode {
	/// Overwrite the strings in the stream itself.
	DirectRewrite,
	/// Leave the stream alone and append an RPCS3 patch describing the same writes.
	EmitPatchScript(ScriptOutput),
}

pub struct EbootPatcher<S: Read + Write + Seek> {
	stream: S,
	mode: PatchMode,
	targets: Option<Vec<PatchTargetInfo>>,
}

impl<S: Read + Write + Seek> EbootPatcher<S> {
	pub fn new(mut stream: S, mode: PatchMode) -> Result<Self> {
		let length = stream.seek(SeekFrom::End(0)).context("Executable stream is not seekable")?;
		stream.seek(SeekFrom::Start(0)).context("Executable stream is not seekable")?;
		stream.flush().context("Executable stream is not writable")?;
		debug!("Opened executable stream (0x{length:X} bytes)");

		Ok(Self { stream, mode, targets: None })
	}

	pub fn into_inner(self) -> S {
		self.stream
	}

	/// Every patch target in the executable. Scanned on first use, cached afterwards.
	pub fn targets(&mut self) -> Result<&[PatchTargetInfo]> {
		self.load_targets()?;
		Ok(self.targets.as_deref().unwrap_or_default())
	}

	fn load_targets(&mut self) -> Result<()> {
		if self.targets.is_none() {
			self.targets = Some(classifier::classify(&mut self.stream)?);
		}
		Ok(())
	}

	/// Checks whether `patch` can redirect this executable to `url`. Only reads from the stream.
	pub fn verify(&mut self, url: &str, patch_digest: bool) -> Result<Vec<Message>> {
		let mut messages = Vec::new();

		if !elf::is_elf64(&mut self.stream)? {
			messages.push(Message::warning("Executable is not a decrypted 64-bit ELF, patching anyway"));
		}

		if url.ends_with('/') {
			messages.push(Message::error(format!("Server URL must not end with a slash: {url}")));
		}

		let host = match Url::parse(url) {
			Ok(parsed) => match parsed.host_str() {
				Some(host) => Some(host.to_string()),
				None => {
					messages.push(Message::error(format!("Server URL has no host: {url}")));
					None
				}
			},
			Err(e) => {
				messages.push(Message::error(format!("Server URL is not a valid absolute URL ({e}): {url}")));
				None
			}
		};

		self.load_targets()?;
		let targets = self.targets.as_deref().unwrap_or_default();

		if !targets.iter().any(|t| matches!(t.kind, PatchTargetKind::Url | PatchTargetKind::Host)) {
			messages.push(Message::error("No server URL or host found in executable"));
		}

		for target in targets {
			match target.kind {
				PatchTargetKind::Url if !target.fits(url) => {
					messages.push(Message::error(format!(
						"URL at 0x{:X} holds {} bytes but {url} needs {}",
						target.offset,
						target.length,
						url.len()
					)));
				}
				PatchTargetKind::Host => {
					if let Some(host) = host.as_deref().filter(|host| !target.fits(host)) {
						messages.push(Message::error(format!(
							"Host at 0x{:X} holds {} bytes but host {host} needs {}",
							target.offset,
							target.length,
							host.len()
						)));
					}
				}
				_ => {}
			}
		}

		if patch_digest && !targets.iter().any(|t| t.kind == PatchTargetKind::Digest) {
			messages.push(Message::warning("No digest key found, the digest will stay unpatched"));
		}

		for message in &messages {
			match message.level {
				MessageLevel::Warning => warn!("{}", message.text),
				MessageLevel::Error => error!("{}", message.text),
			}
		}
		Ok(messages)
	}

	/// Redirects every target to `url`. Call `verify` first; bytes already written stay
	/// written if a later target fails.
	pub fn patch(&mut self, url: &str, patch_digest: bool) -> Result<()> {
		let parsed = Url::parse(url).with_context(|| format!("Invalid server URL: {url}"))?;
		let host = parsed.host_str().with_context(|| format!("Server URL has no host: {url}"))?.to_string();

		self.load_targets()?;
		let Self { stream, mode, targets } = self;
		let targets = targets.as_deref().unwrap_or_default();
		let replacements = Replacements { url, host: &host, patch_digest };

		match mode {
			PatchMode::DirectRewrite => rewrite(stream, targets, &replacements),
			PatchMode::EmitPatchScript(output) => emit_script(stream, output, targets, &replacements),
		}
	}
}

struct Replacements<'a> {
	url: &'a str,
	host: &'a str,
	patch_digest: bool,
}

impl Replacements<'_> {
	fn value_for(&self, target: &PatchTargetInfo) -> Option<&str> {
		match target.kind {
			PatchTargetKind::Url => Some(self.url),
			PatchTargetKind::Host => Some(self.host),
			PatchTargetKind::Digest => self.patch_digest.then_some(CUSTOM_DIGEST),
		}
	}
}

fn rewrite<S: Write + Seek>(stream: &mut S, targets: &[PatchTargetInfo], replacements: &Replacements) -> Result<()> {
	for target in targets {
		let Some(value) = replacements.value_for(target) else {
			continue;
		};
		if target.kind == PatchTargetKind::Digest {
			assert_eq!(target.length, DIGEST_LENGTH, "digest target at 0x{:X} has the wrong size", target.offset);
		}

		write_padded(stream, target, value)?;
		info!("Patched {} at 0x{:X}: {} -> {value}", target.kind, target.offset, target.data);
	}

	stream.flush()?;
	Ok(())
}

// Writes `value` followed by NULs, exactly `target.length` bytes.
fn write_padded<S: Write + Seek>(stream: &mut S, target: &PatchTargetInfo, value: &str) -> Result<()> {
	if !target.fits(value) {
		bail!("{} at 0x{:X} holds {} bytes, {value} needs {}", target.kind, target.offset, target.length, value.len());
	}

	let mut bytes = Vec::with_capacity(target.length);
	bytes.extend_from_slice(value.as_bytes());
	bytes.resize(target.length, 0);

	stream.seek(SeekFrom::Start(target.offset))?;
	stream.write_all(&bytes)?;
	Ok(())
}

fn emit_script<S: Read + Seek>(stream: &mut S, output: &ScriptOutput, targets: &[PatchTargetInfo], replacements: &Replacements) -> Result<()> {
	stream.seek(SeekFrom::Start(0))?;
	let mut data = Vec::new();
	stream.read_to_end(&mut data)?;

	let ppu_hash = match elf::ppu_hash_hex(&data) {
		Ok(hash) => hash,
		Err(e) => {
			warn!("Cannot compute PPU hash ({e}), keying the patch on the file hash");
			Sha1::digest(&data).iter().map(|b| format!("{b:02x}")).collect()
		}
	};

	let mut script = PatchScript::new(ppu_hash, output.metadata.clone());
	for target in targets {
		if let Some(value) = replacements.value_for(target) {
			if !target.fits(value) {
				bail!("{} at 0x{:X} holds {} bytes, {value} needs {}", target.kind, target.offset, target.length, value.len());
			}
			script.push(target.offset, value);
		}
	}

	script.append_to(&output.path)?;
	info!("Wrote {} patch entries to {}", script.len(), output.path.display());
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::elf::tests::build_elf;
	use crate::script::LOAD_BIAS;
	use std::io::{self, Cursor};

	const OLD_URL: &[u8] = b"http://old.example.com";
	const NEW_URL: &str = "http://new.example.org";
	const DIGEST: &[u8] = b"A1b2C3d4!@#$%^&*()";

	// Payload offset inside a one-segment test ELF.
	const PAYLOAD: u64 = 0x40 + 0x38;
	const URL_AT: u64 = PAYLOAD + 4;
	const HOST_AT: u64 = PAYLOAD + 64;
	const DIGEST_AT: u64 = PAYLOAD + 128;

	fn eboot(with_host: bool, with_digest: bool) -> Vec<u8> {
		let mut payload = vec![0u8; 512];
		payload[..4].copy_from_slice(&[0x38, 0x60, 0x00, 0x01]);
		payload[4..4 + OLD_URL.len()].copy_from_slice(OLD_URL);
		// 10 NULs of padding, then unrelated data
		payload[36] = 0x4E;
		if with_host {
			payload[64..88].copy_from_slice(b"lbpk.ps3.online.scea.com");
			payload[90] = 0x4E;
		}
		if with_digest {
			payload[128..146].copy_from_slice(DIGEST);
			payload[200..208].copy_from_slice(b"cookie\0\0");
		}
		build_elf(1, &payload)
	}

	fn patcher(data: Vec<u8>) -> EbootPatcher<Cursor<Vec<u8>>> {
		EbootPatcher::new(Cursor::new(data), PatchMode::DirectRewrite).unwrap()
	}

	fn errors(messages: &[Message]) -> Vec<&str> {
		messages.iter().filter(|m| m.is_error()).map(|m| m.text.as_str()).collect()
	}

	fn warnings(messages: &[Message]) -> Vec<&str> {
		messages.iter().filter(|m| !m.is_error()).map(|m| m.text.as_str()).collect()
	}

	fn bytes_at(data: &[u8], offset: u64, len: usize) -> &[u8] {
		&data[offset as usize..offset as usize + len]
	}

	#[test]
	fn finds_targets_once() {
		let mut patcher = patcher(eboot(true, true));
		let targets = patcher.targets().unwrap().to_vec();
		assert_eq!(targets.len(), 3);
		assert_eq!(targets[0], PatchTargetInfo::new(URL_AT, 31, "http://old.example.com".into(), PatchTargetKind::Url));
		assert_eq!(targets[1], PatchTargetInfo::new(HOST_AT, 25, "lbpk.ps3.online.scea.com".into(), PatchTargetKind::Host));
		assert_eq!(targets[2].kind, PatchTargetKind::Digest);
		assert_eq!(targets[2].offset, DIGEST_AT);

		// Cached: mutating the stream behind the patcher does not change the list.
		patcher.stream.get_mut()[URL_AT as usize] = b'X';
		assert_eq!(patcher.targets().unwrap(), &targets[..]);
	}

	#[test]
	fn verify_accepts_good_url() {
		let mut patcher = patcher(eboot(true, true));
		let messages = patcher.verify(NEW_URL, true).unwrap();
		assert!(messages.is_empty(), "{messages:?}");
	}

	#[test]
	fn verify_does_not_mutate() {
		let original = eboot(true, true);
		let mut patcher = patcher(original.clone());
		patcher.verify(NEW_URL, true).unwrap();
		patcher.verify("http://a-much-longer-hostname.example.org/with/a/path/", true).unwrap();
		assert_eq!(patcher.into_inner().into_inner(), original);
	}

	#[test]
	fn verify_rejects_bad_urls() {
		let mut patcher = patcher(eboot(false, false));

		let messages = patcher.verify("http://new.example.org/", false).unwrap();
		assert_eq!(errors(&messages).len(), 1);
		assert!(errors(&messages)[0].contains("slash"));

		let messages = patcher.verify("new.example.org", false).unwrap();
		assert_eq!(errors(&messages).len(), 1);
		assert!(errors(&messages)[0].contains("absolute"));
	}

	#[test]
	fn verify_without_targets() {
		let mut patcher = patcher(build_elf(1, &[0u8; 64]));
		let messages = patcher.verify(NEW_URL, false).unwrap();
		assert_eq!(errors(&messages), vec!["No server URL or host found in executable"]);
	}

	#[test]
	fn verify_length_boundary() {
		let mut patcher = patcher(eboot(false, false));

		// Target capacity is 31 bytes.
		let exact = format!("http://{}", "a".repeat(24));
		assert_eq!(exact.len(), 31);
		assert!(errors(&patcher.verify(&exact, false).unwrap()).is_empty());

		let over = format!("http://{}", "a".repeat(25));
		let messages = patcher.verify(&over, false).unwrap();
		assert_eq!(errors(&messages).len(), 1);
		assert!(errors(&messages)[0].starts_with(&format!("URL at 0x{URL_AT:X} holds 31 bytes")));
	}

	#[test]
	fn verify_host_capacity() {
		let mut patcher = patcher(eboot(true, false));
		let url = "http://lbp.server.example.org";
		assert_eq!(url.len(), 29);

		let messages = patcher.verify(url, false).unwrap();
		assert!(errors(&messages).is_empty());

		// A 26-byte host cannot fit the 25-byte slot; the URL slot overflows along with it.
		let long_host = "http://ab.long.server.example.org";
		let messages = patcher.verify(long_host, false).unwrap();
		assert_eq!(errors(&messages).len(), 2);
		assert!(errors(&messages)[0].starts_with("URL at"));
		assert!(errors(&messages)[1].starts_with(&format!("Host at 0x{HOST_AT:X} holds 25 bytes")));
	}

	#[test]
	fn verify_host_exact_fit() {
		let mut patcher = patcher(eboot(true, false));
		// Host fills its 25-byte slot exactly; the 32-byte URL overflows its 31-byte slot.
		let url = "http://lbp.server.example.org.uk";
		assert_eq!(Url::parse(url).unwrap().host_str().unwrap().len(), 25);

		let messages = patcher.verify(url, false).unwrap();
		assert_eq!(errors(&messages).len(), 1, "{messages:?}");
		assert!(errors(&messages)[0].starts_with("URL at"));
	}

	#[test]
	fn verify_url_without_host() {
		let mut patcher = patcher(eboot(false, false));
		let messages = patcher.verify("mailto:admin", false).unwrap();
		assert_eq!(errors(&messages), vec!["Server URL has no host: mailto:admin"]);
	}

	#[test]
	fn url_with_placeholder_host_is_rewritten_whole() {
		let mut payload = vec![0u8; 64];
		payload[8..39].copy_from_slice(b"http://lbpk.ps3.online.scea.com");
		payload[45] = 0x4E;
		let url_at = PAYLOAD + 8;

		let mut patcher = patcher(build_elf(1, &payload));
		let targets = patcher.targets().unwrap().to_vec();
		assert_eq!(targets, vec![PatchTargetInfo::new(url_at, 36, "http://lbpk.ps3.online.scea.com".into(), PatchTargetKind::Url)]);

		let new_url = "https://new.org:10061/x";
		assert!(patcher.verify(new_url, false).unwrap().is_empty());
		patcher.patch(new_url, false).unwrap();

		let data = patcher.into_inner().into_inner();
		assert_eq!(bytes_at(&data, url_at, new_url.len()), new_url.as_bytes());
		assert_eq!(data[(url_at + 37) as usize], 0x4E);

		let mut rescanned = self::patcher(data);
		let targets = rescanned.targets().unwrap();
		assert_eq!(targets.len(), 1);
		assert_eq!(targets[0].data, new_url);
		assert_eq!(targets[0].length, 36);
	}

	#[test]
	fn verify_warnings() {
		let mut patcher = patcher(eboot(false, false));
		let messages = patcher.verify(NEW_URL, true).unwrap();
		assert!(errors(&messages).is_empty());
		assert_eq!(warnings(&messages), vec!["No digest key found, the digest will stay unpatched"]);

		let mut data = eboot(false, false);
		data[4] = 1;
		let mut patcher = self::patcher(data);
		let messages = patcher.verify(NEW_URL, false).unwrap();
		assert!(errors(&messages).is_empty());
		assert_eq!(warnings(&messages).len(), 1);
	}

	#[test]
	fn patch_rewrites_url_with_padding() {
		let mut patcher = patcher(eboot(false, false));
		patcher.patch(NEW_URL, false).unwrap();
		let data = patcher.into_inner().into_inner();

		assert_eq!(bytes_at(&data, URL_AT, 22), NEW_URL.as_bytes());
		assert_eq!(bytes_at(&data, URL_AT + 22, 10), &[0u8; 10]);
		assert_eq!(data[(URL_AT + 32) as usize], 0x4E);
	}

	#[test]
	fn shorter_url_leaves_no_trailing_garbage() {
		let mut patcher = patcher(eboot(true, false));
		patcher.patch("http://a.io", false).unwrap();
		let data = patcher.into_inner().into_inner();
		assert_eq!(bytes_at(&data, HOST_AT, 4), b"a.io");
		assert_eq!(bytes_at(&data, HOST_AT + 4, 22), &[0u8; 22]);

		let mut rescanned = self::patcher(data);
		let targets = rescanned.targets().unwrap();
		assert_eq!(targets.len(), 1);
		assert_eq!(targets[0].data, "http://a.io");
		assert_eq!(targets[0].length, 31);
	}

	#[test]
	fn patch_round_trip() {
		let mut patcher = patcher(eboot(true, false));
		patcher.patch("https://lbp.example.net", false).unwrap();

		let mut rescanned = self::patcher(patcher.into_inner().into_inner());
		let targets = rescanned.targets().unwrap();
		assert_eq!(targets[0].kind, PatchTargetKind::Url);
		assert_eq!(targets[0].data, "https://lbp.example.net");
		assert_eq!(targets[0].length, 31);
	}

	#[test]
	fn patch_rewrites_host() {
		let mut patcher = patcher(eboot(true, false));
		patcher.patch("http://new.example.org:10061/LITTLEBIGPLANETPS3_XML", false).unwrap_err();

		let mut patcher = self::patcher(eboot(true, false));
		patcher.patch(NEW_URL, false).unwrap();
		let data = patcher.into_inner().into_inner();
		assert_eq!(bytes_at(&data, HOST_AT, 15), b"new.example.org");
		assert_eq!(bytes_at(&data, HOST_AT + 15, 11), &[0u8; 11]);
		assert_eq!(data[(HOST_AT + 26) as usize], 0x4E);
	}

	#[test]
	fn patch_is_idempotent() {
		let mut first = patcher(eboot(true, true));
		first.patch(NEW_URL, true).unwrap();
		let first = first.into_inner().into_inner();

		let mut second = patcher(eboot(true, true));
		second.patch(NEW_URL, true).unwrap();
		second.patch(NEW_URL, true).unwrap();
		assert_eq!(second.into_inner().into_inner(), first);
	}

	#[test]
	fn patch_digest() {
		let mut patcher = patcher(eboot(false, true));
		assert!(warnings(&patcher.verify(NEW_URL, true).unwrap()).is_empty());

		patcher.patch(NEW_URL, true).unwrap();
		let data = patcher.into_inner().into_inner();
		assert_eq!(bytes_at(&data, DIGEST_AT, 18), CUSTOM_DIGEST.as_bytes());
		assert_eq!(data[(DIGEST_AT + 18) as usize], 0);
	}

	#[test]
	fn digest_untouched_unless_requested() {
		let mut patcher = patcher(eboot(false, true));
		patcher.patch(NEW_URL, false).unwrap();
		let data = patcher.into_inner().into_inner();
		assert_eq!(bytes_at(&data, DIGEST_AT, 18), DIGEST);
	}

	#[test]
	fn emits_patch_script() {
		let path = std::env::temp_dir().join(format!("eboot_patcher_patch_{}.yml", std::process::id()));
		let _ = std::fs::remove_file(&path);

		let original = eboot(true, true);
		let output = ScriptOutput {
			path: path.clone(),
			metadata: GameMetadata {
				title: "LittleBigPlanet".into(),
				content_id: "BCUS98148".into(),
				version: "01.30".into(),
			},
		};
		let mut patcher = EbootPatcher::new(Cursor::new(original.clone()), PatchMode::EmitPatchScript(output)).unwrap();
		patcher.patch(NEW_URL, false).unwrap();
		patcher.patch(NEW_URL, true).unwrap();
		assert_eq!(patcher.into_inner().into_inner(), original);

		let text = std::fs::read_to_string(&path).unwrap();
		std::fs::remove_file(&path).unwrap();

		let hash = elf::ppu_hash_hex(&original).unwrap();
		assert!(text.starts_with(&format!("Version: 1.2\n\nPPU-{hash}:\n")));
		assert!(text.contains("        BCUS98148: [ 01.30 ]\n"));

		let url_line = format!("      - [ utf8, 0x{:x}, \"{NEW_URL}\\0\" ]\n", URL_AT + LOAD_BIAS);
		let host_line = format!("      - [ utf8, 0x{:x}, \"new.example.org\\0\" ]\n", HOST_AT + LOAD_BIAS);
		let digest_line = format!("      - [ utf8, 0x{:x}, \"{CUSTOM_DIGEST}\\0\" ]\n", DIGEST_AT + LOAD_BIAS);
		assert_eq!(text.matches(&url_line).count(), 2);
		assert_eq!(text.matches(&host_line).count(), 2);
		assert_eq!(text.matches(&digest_line).count(), 1);
	}

	struct Unseekable(Vec<u8>);

	impl Read for Unseekable {
		fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
			self.0.as_slice().read(buf)
		}
	}

	impl Write for Unseekable {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			self.0.write(buf)
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	impl Seek for Unseekable {
		fn seek(&mut self, _: SeekFrom) -> io::Result<u64> {
			Err(io::Error::new(io::ErrorKind::Unsupported, "pipe"))
		}
	}

	#[test]
	fn rejects_unseekable_stream() {
		let result = EbootPatcher::new(Unseekable(eboot(false, false)), PatchMode::DirectRewrite);
		assert!(result.is_err());
	}
}
