//! Manual exerciser for the `ess` engine: format/mount/check a file-backed device
//! and create/read/delete/rename/list sections against it. Not part of the engine's
//! public contract (`spec.md` excludes "any CLI, logging, or glue" from scope) — this
//! just gives a hands-on way to drive `Engine` the way `rfs-cli` drives `RFS`.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use block_device::FileDevice;
use ess::{Engine, StreamReader, StreamWriter};

#[derive(Parser)]
#[command(name = "ess-cli", about = "Drive an EEPROM Section System image from the command line")]
struct Cli {
    /// Path to the backing device file (created if it doesn't exist).
    #[arg(short, long, default_value = "ess.img")]
    device: PathBuf,

    /// Total device size in bytes, used only by `format` (and to size a fresh file).
    #[arg(long, default_value_t = 1 << 20)]
    size: u64,

    /// Device page size in bytes; 0 means "no page constraint" (§6.2).
    #[arg(long, default_value_t = 0)]
    page_size: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wipe the device and format it with the given block size.
    Format {
        #[arg(long, default_value_t = 128)]
        block_size: u32,
    },
    /// Mount (step 1) then run the full check & repair (step 2); reports the final state.
    Check,
    /// Create (or overwrite) a section from a file, or from stdin with `-`.
    Create {
        name: String,
        #[arg(long)]
        overwrite: bool,
        #[arg(long, default_value = "-")]
        from: PathBuf,
    },
    /// Read a section's full contents to a file, or to stdout with `-`.
    Read {
        name: String,
        #[arg(long, default_value = "-")]
        to: PathBuf,
    },
    /// Delete a section.
    Delete { name: String },
    /// Rename a section in place, preserving its data chain.
    Rename { old: String, new: String },
    /// List every section name, sorted.
    Ls,
    /// Report free space in bytes.
    Df,
}

fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let cli = Cli::parse();
    let device = FileDevice::open(&cli.device, cli.size, cli.page_size)
        .with_context(|| format!("opening device file {}", cli.device.display()))?;
    let engine = Engine::new(device);

    match cli.command {
        Command::Format { block_size } => {
            engine.format(block_size)?;
            info!("formatted {} ({} bytes, block size {block_size})", cli.device.display(), cli.size);
        }
        Command::Check => {
            engine.mount_step1()?;
            engine.mount_step2()?;
            println!("state: {}", engine.state());
        }
        Command::Create { name, overwrite, from } => {
            engine.mount_step1()?;
            engine.mount_step2()?;
            let payload = read_input(&from)?;
            let mut writer = engine.create(&name, overwrite)?;
            writer.write_bytes(&payload)?;
            writer.close()?;
            info!("wrote {} bytes to section {name:?}", payload.len());
        }
        Command::Read { name, to } => {
            engine.mount_step1()?;
            engine.mount_step2()?;
            let (payload_bytes, _) = engine.determine_size(&name)?;
            let mut reader = engine.open(&name)?;
            let data = if payload_bytes == 0 {
                Vec::new()
            } else {
                reader.read_bytes(payload_bytes as usize)?
            };
            reader.close()?;
            write_output(&to, &data)?;
        }
        Command::Delete { name } => {
            engine.mount_step1()?;
            engine.mount_step2()?;
            engine.delete(&name)?;
            info!("deleted section {name:?}");
        }
        Command::Rename { old, new } => {
            engine.mount_step1()?;
            engine.mount_step2()?;
            engine.rename(&old, &new)?;
            info!("renamed {old:?} -> {new:?}");
        }
        Command::Ls => {
            engine.mount_step1()?;
            engine.mount_step2()?;
            for name in engine.enumerate()? {
                println!("{name}");
            }
        }
        Command::Df => {
            engine.mount_step1()?;
            engine.mount_step2()?;
            println!("{} bytes free", engine.get_free_space()?);
        }
    }
    Ok(())
}

fn read_input(path: &PathBuf) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read(path).map_err(|e| anyhow!("reading {}: {e}", path.display()))
    }
}

fn write_output(path: &PathBuf, data: &[u8]) -> Result<()> {
    if path.as_os_str() == "-" {
        io::stdout().write_all(data)?;
        Ok(())
    } else {
        std::fs::write(path, data).map_err(|e| anyhow!("writing {}: {e}", path.display()).into())
    }
}
