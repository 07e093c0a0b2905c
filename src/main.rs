//! vcomputer: host-side tools for virtual computers.
//!
//! The scripting engine is linked by embedders, so this binary covers the
//! parts that stand on their own:
//!
//! - `inspect`: decode raw remote-terminal frames from stdin and show the
//!   mirrored windows
//! - `resolve`: show where a guest path lands in a computer's mount table
//! - `find`: expand a guest wildcard pattern

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vcomputer::computer::{self, ComputerId};
use vcomputer::config::HostConfig;
use vcomputer::paths::HostPaths;
use vcomputer::remote::raw::Message;
use vcomputer::remote::WindowMirror;
use vcomputer::vfs::{ResolveOptions, SandboxFs, VirtualEntry, VirtualRegistry};

/// Virtual computer host tools
#[derive(Parser, Debug)]
#[command(name = "vcomputer", version, about = "Virtual computer host tools")]
struct Args {
    /// Host configuration file (defaults to the user config if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Computer whose mount table to use
    #[arg(long, default_value_t = 0)]
    id: ComputerId,

    /// JSON virtual image to register; the Nth image is mountable as `N:`
    #[arg(long = "image")]
    images: Vec<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode raw frames from stdin
    Inspect {
        /// Checksum decoded payloads instead of base64 text
        #[arg(long)]
        binary_checksum: bool,
    },
    /// Resolve a guest path
    Resolve {
        path: String,
        /// Resolve for writing
        #[arg(long)]
        write: bool,
    },
    /// Expand a wildcard pattern
    Find { pattern: String },
}

fn main() -> Result<()> {
    let _guard = vcomputer::logging::init();
    let args = Args::parse();

    match args.command {
        Command::Inspect { binary_checksum } => inspect(binary_checksum),
        Command::Resolve { ref path, write } => {
            let fs = sandbox(&args)?;
            let opts = if write { ResolveOptions::write() } else { ResolveOptions::all() };
            match fs.resolve(path, opts) {
                Ok(resolved) => {
                    let mount = if resolved.mount.is_empty() {
                        "/".to_string()
                    } else {
                        resolved.mount.join("/")
                    };
                    println!("mount: {mount}{}", if resolved.read_only { " (read-only)" } else { "" });
                    for candidate in &resolved.candidates {
                        println!("  {candidate}");
                    }
                }
                Err(e) => println!("{e}"),
            }
            Ok(())
        }
        Command::Find { ref pattern } => {
            let fs = sandbox(&args)?;
            for path in fs.find(pattern)? {
                println!("{path}");
            }
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> Result<HostConfig> {
    if let Some(path) = &args.config {
        return HostConfig::load(path);
    }
    match HostPaths::resolve().map(|p| p.config_file()) {
        Some(path) if path.exists() => HostConfig::load(&path),
        _ => Ok(HostConfig::default()),
    }
}

/// Images named on the command line, else every `*.json` in the host image
/// directory in file name order (ids follow that order).
fn image_files(args: &Args) -> Result<Vec<PathBuf>> {
    if !args.images.is_empty() {
        return Ok(args.images.clone());
    }
    let Some(dir) = HostPaths::resolve().map(|p| p.images()) else {
        return Ok(Vec::new());
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

fn sandbox(args: &Args) -> Result<SandboxFs> {
    let config = load_config(args)?;
    let images = VirtualRegistry::new();
    for path in &image_files(args)? {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read image {}", path.display()))?;
        let image = VirtualEntry::from_json(&text)
            .with_context(|| format!("Failed to parse image {}", path.display()))?;
        let id = images.register(image);
        info!(image = %id, path = %path.display(), "registered virtual image");
    }
    let table = computer::mount_table(&config, &images, args.id, &[])?;
    Ok(SandboxFs::new(Arc::new(Mutex::new(table)), Arc::new(images)))
}

fn inspect(binary_checksum: bool) -> Result<()> {
    let mut mirror = WindowMirror::new(binary_checksum);
    for (n, line) in std::io::stdin().lock().lines().enumerate() {
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let frame = match mirror.receive(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(line = n + 1, error = %e, "rejected frame");
                println!("{:>5}  error: {e}", n + 1);
                continue;
            }
        };
        let summary = match &frame.message {
            Message::Terminal(snap) => format!("terminal {}x{} {:?}", snap.width, snap.height, snap.mode),
            Message::Key { key, up, .. } => format!("key {key}{}", if *up { " up" } else { "" }),
            Message::Mouse { kind, button, x, y } => format!("mouse {kind:?} button {button} at {x},{y}"),
            Message::Event(event) => format!("event {}", event.name),
            Message::Window(change) if change.closing => "window closed".to_string(),
            Message::Window(change) => {
                format!("window {}x{} {:?}", change.width, change.height, change.title)
            }
            Message::Message { title, text, .. } => format!("message {title:?}: {text}"),
            Message::Features { flags, .. } => format!("features {flags:#06x}"),
        };
        println!("{:>5}  [{}] {summary}", n + 1, frame.window);
        if let Message::Terminal(_) = frame.message {
            if let Some(window) = mirror.window(frame.window) {
                println!("{}", window.text());
            }
        }
    }
    Ok(())
}
