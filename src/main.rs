use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use eboot_patcher::{EbootPatcher, GameMetadata, PatchMode, ScriptOutput, fself};
use log::{info, warn};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "eboot_patcher")]
#[command(about = "Redirect a decrypted PS3 EBOOT to a custom server, or wrap an ELF into a fake SELF.")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// List every patchable string found in the executable
	Targets { eboot: PathBuf },

	/// Check that the executable can be patched to the given server
	Verify {
		eboot: PathBuf,
		#[arg(short, long)]
		url: String,
		/// Also replace the digest key
		#[arg(short, long)]
		digest: bool,
	},

	/// Patch the executable, or write an RPCS3 patch for it
	Patch {
		eboot: PathBuf,
		#[arg(short, long)]
		url: String,
		#[arg(short, long)]
		digest: bool,
		/// Patch a copy instead of the input file
		#[arg(short, long)]
		output: Option<PathBuf>,
		/// Append an RPCS3 patch to this file instead of touching the executable
		#[arg(long)]
		rpcs3_patch: Option<PathBuf>,
		#[arg(long, default_value = "")]
		title: String,
		#[arg(long, default_value = "")]
		content_id: String,
		#[arg(long, default_value = "")]
		app_version: String,
	},

	/// Wrap a decrypted ELF into a fake signed SELF
	Fself { elf: PathBuf, output: PathBuf },
}

fn open_eboot(path: &Path, mode: PatchMode) -> Result<EbootPatcher<File>> {
	let file = OpenOptions::new()
		.read(true)
		.write(true)
		.open(path)
		.with_context(|| format!("opening executable: {}", path.display()))?;
	EbootPatcher::new(file, mode)
}

// Partial writes are not rolled back, the copy absorbs them. Script mode never writes.
fn patch_destination(eboot: PathBuf, output: Option<PathBuf>, mode: &PatchMode) -> Result<PathBuf> {
	match output {
		Some(output) if matches!(mode, PatchMode::EmitPatchScript(_)) => {
			warn!("Writing an RPCS3 patch, {} is not created", output.display());
			Ok(eboot)
		}
		Some(output) => {
			fs::copy(&eboot, &output).with_context(|| format!("copying {} to {}", eboot.display(), output.display()))?;
			Ok(output)
		}
		None => Ok(eboot),
	}
}

fn main() -> Result<()> {
	env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
	let cli = Cli::parse();

	match cli.command {
		Command::Targets { eboot } => {
			let mut patcher = open_eboot(&eboot, PatchMode::DirectRewrite)?;
			for target in patcher.targets()? {
				println!("{target}");
			}
		}
		Command::Verify { eboot, url, digest } => {
			let mut patcher = open_eboot(&eboot, PatchMode::DirectRewrite)?;
			let messages = patcher.verify(&url, digest)?;
			if messages.iter().any(|m| m.is_error()) {
				bail!("{} cannot be patched to {url}", eboot.display());
			}
			println!("{} can be patched to {url}", eboot.display());
		}
		Command::Patch { eboot, url, digest, output, rpcs3_patch, title, content_id, app_version } => {
			let mode = match rpcs3_patch {
				Some(path) => PatchMode::EmitPatchScript(ScriptOutput {
					path,
					metadata: GameMetadata { title, content_id, version: app_version },
				}),
				None => PatchMode::DirectRewrite,
			};

			let target = patch_destination(eboot, output, &mode)?;

			let mut patcher = open_eboot(&target, mode)?;
			let messages = patcher.verify(&url, digest)?;
			if messages.iter().any(|m| m.is_error()) {
				bail!("{} cannot be patched to {url}", target.display());
			}
			patcher.patch(&url, digest)?;
			info!("Patched {}", target.display());
		}
		Command::Fself { elf, output } => {
			let data = fs::read(&elf).with_context(|| format!("reading ELF: {}", elf.display()))?;
			let self_data = fself::synthesize(&data)?;
			fs::write(&output, self_data).with_context(|| format!("writing SELF: {}", output.display()))?;
			info!("Wrote fake SELF to {}", output.display());
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::env::temp_dir;

	fn scratch(name: &str) -> PathBuf {
		let path = temp_dir().join(format!("eboot_patcher_main_{}_{name}", std::process::id()));
		let _ = fs::remove_file(&path);
		path
	}

	#[test]
	fn output_is_a_copy_in_rewrite_mode() {
		let eboot = scratch("rewrite.elf");
		let output = scratch("rewrite_out.elf");
		fs::write(&eboot, b"elf bytes").unwrap();

		let target = patch_destination(eboot.clone(), Some(output.clone()), &PatchMode::DirectRewrite).unwrap();
		assert_eq!(target, output);
		assert_eq!(fs::read(&output).unwrap(), b"elf bytes");

		fs::remove_file(&eboot).unwrap();
		fs::remove_file(&output).unwrap();
	}

	#[test]
	fn script_mode_skips_the_copy() {
		let eboot = scratch("script.elf");
		let output = scratch("script_out.elf");
		fs::write(&eboot, b"elf bytes").unwrap();
		let mode = PatchMode::EmitPatchScript(ScriptOutput { path: scratch("script.yml"), metadata: GameMetadata::default() });

		let target = patch_destination(eboot.clone(), Some(output.clone()), &mode).unwrap();
		assert_eq!(target, eboot);
		assert!(!output.exists());

		fs::remove_file(&eboot).unwrap();
	}
}
