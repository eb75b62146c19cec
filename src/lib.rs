pub mod classifier;
pub mod elf;
pub mod fself;
pub mod patcher;
pub mod scanner;
pub mod script;
pub mod target;

pub use patcher::{CUSTOM_DIGEST, EbootPatcher, Message, MessageLevel, PatchMode, ScriptOutput};
pub use script::GameMetadata;
pub use target::{PatchTargetInfo, PatchTargetKind};
