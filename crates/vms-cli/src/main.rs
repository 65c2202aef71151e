#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use vms_block::AccessMode;
use vms_core::{VmConfig, VmSession, VolumeManagerKind};
use vms_disk::DiskDescriptor;
use vms_fs::{FileKind, FileSystem};

/// Environment variable holding the log filter, e.g. `VMSCAN_LOG=vms_fs=debug`.
const LOG_ENV: &str = "VMSCAN_LOG";

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "vmscan", about = "Inspect virtual machine disk images offline")]
struct Cli {
    /// Log at debug level when VMSCAN_LOG is unset.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarise disks, partitions, volumes, filesystems and OS roots.
    Inspect {
        #[command(flatten)]
        vm: VmArgs,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List a directory of a guest root.
    Ls {
        #[command(flatten)]
        vm: VmArgs,
        /// Path inside the guest, e.g. /etc or C:\Windows.
        path: String,
        /// Show kind, size and modification time.
        #[arg(short, long)]
        long: bool,
    },
    /// Write a guest file to stdout.
    Cat {
        #[command(flatten)]
        vm: VmArgs,
        /// Path inside the guest.
        path: String,
    },
}

#[derive(Args)]
struct VmArgs {
    /// Disk images in controller order; they become scsi0:0, scsi0:1, ...
    #[arg(required = true, num_args = 1..)]
    images: Vec<PathBuf>,
    /// Open images writable. Inspection never needs this.
    #[arg(long)]
    read_write: bool,
    /// Open the base disk of each snapshot chain instead of the leaf.
    #[arg(long)]
    base_only: bool,
    /// Treat images as flat disks without probing formats.
    #[arg(long)]
    raw: bool,
    /// Use the host's device-mapper nodes under this directory instead of
    /// decoding LVM metadata.
    #[arg(long, value_name = "DIR")]
    dev_root: Option<PathBuf>,
    /// Which OS root to use when the VM has several.
    #[arg(long, default_value_t = 0)]
    root: usize,
}

impl VmArgs {
    fn access_mode(&self) -> AccessMode {
        if self.read_write {
            AccessMode::ReadWrite
        } else {
            AccessMode::ReadOnly
        }
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut out = io::stdout().lock();
    match cli.command {
        Command::Inspect { vm, json } => inspect(&vm, json, &mut out),
        Command::Ls { vm, path, long } => ls(&vm, &path, long, &mut out),
        Command::Cat { vm, path } => cat(&vm, &path, &mut out),
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

// ── Commands ────────────────────────────────────────────────────────────────

fn open_session(vm: &VmArgs) -> Result<VmSession> {
    let mode = vm.access_mode();
    let disks = vm
        .images
        .iter()
        .enumerate()
        .map(|(i, path)| {
            DiskDescriptor::local(path)
                .with_mode(mode)
                .with_base_only(vm.base_only)
                .with_raw(vm.raw)
                .with_hardware_id(format!("scsi0:{i}"))
        })
        .collect();
    let mut config = VmConfig::new(disks);
    if let Some(dev_root) = &vm.dev_root {
        config = config.with_volume_manager(VolumeManagerKind::Native {
            dev_root: dev_root.clone(),
        });
    }
    debug!(images = vm.images.len(), ?mode, "opening VM");
    VmSession::open(config)
        .with_context(|| format!("failed to open VM from {} image(s)", vm.images.len()))
}

fn inspect(vm: &VmArgs, json: bool, out: &mut dyn Write) -> Result<()> {
    let mut session = open_session(vm)?;
    let report = session.report();
    if json {
        writeln!(
            out,
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        )?;
    } else {
        write!(out, "{report}")?;
    }
    session.unmount().context("failed to close VM")?;
    Ok(())
}

fn ls(vm: &VmArgs, path: &str, long: bool, out: &mut dyn Write) -> Result<()> {
    let mut session = open_session(vm)?;
    {
        let tree = pick_root(&session, vm.root)?;
        let mut names = tree
            .dir_entries(path)
            .with_context(|| format!("cannot list {path}"))?;
        names.sort();
        for name in names {
            if !long {
                writeln!(out, "{name}")?;
                continue;
            }
            let child = format!("{}/{name}", path.trim_end_matches(['/', '\\']));
            let st = tree
                .stat(&child)
                .with_context(|| format!("cannot stat {child}"))?;
            let kind = match st.kind {
                FileKind::File => '-',
                FileKind::Directory => 'd',
                FileKind::Symlink => 'l',
                FileKind::Other => '?',
            };
            write!(out, "{kind} {:o} {:>12} {:>12} {name}", st.mode & 0o7777, st.size, st.mtime)?;
            if st.kind == FileKind::Symlink {
                write!(out, " -> {}", tree.read_link(&child)?)?;
            }
            writeln!(out)?;
        }
    }
    session.unmount().context("failed to close VM")?;
    Ok(())
}

fn cat(vm: &VmArgs, path: &str, out: &mut dyn Write) -> Result<()> {
    let mut session = open_session(vm)?;
    {
        let tree = pick_root(&session, vm.root)?;
        let mut file = tree
            .open(path)
            .with_context(|| format!("cannot open {path}"))?;
        io::copy(&mut file, out).with_context(|| format!("cannot read {path}"))?;
    }
    session.unmount().context("failed to close VM")?;
    Ok(())
}

fn pick_root(session: &VmSession, index: usize) -> Result<&dyn FileSystem> {
    let roots = session.root_trees();
    if roots.is_empty() {
        bail!("no operating system root found on the VM's volumes");
    }
    let tree = roots
        .get(index)
        .with_context(|| format!("root {index} out of range; the VM has {}", roots.len()))?;
    Ok(tree as &dyn FileSystem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write as _;
    use vms_harness::ext4::Ext4Builder;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn trailing_path_follows_the_images() {
        let cli = Cli::try_parse_from(["vmscan", "ls", "a.vmdk", "b.vmdk", "/etc", "--long"])
            .expect("parse");
        let Command::Ls { vm, path, long } = cli.command else {
            panic!("expected ls");
        };
        assert_eq!(vm.images, vec![PathBuf::from("a.vmdk"), PathBuf::from("b.vmdk")]);
        assert_eq!(path, "/etc");
        assert!(long);
    }

    #[test]
    fn images_open_read_only_unless_asked() {
        let cli = Cli::try_parse_from(["vmscan", "inspect", "a.vmdk"]).expect("parse");
        let Command::Inspect { vm, .. } = cli.command else {
            panic!("expected inspect");
        };
        assert_eq!(vm.access_mode(), AccessMode::ReadOnly);

        let cli = Cli::try_parse_from(["vmscan", "cat", "a.vmdk", "/etc/motd", "--read-write"])
            .expect("parse");
        let Command::Cat { vm, .. } = cli.command else {
            panic!("expected cat");
        };
        assert_eq!(vm.access_mode(), AccessMode::ReadWrite);
    }

    fn image() -> tempfile::NamedTempFile {
        let bytes = Ext4Builder::new()
            .label("root")
            .file("/etc/fstab", b"LABEL=root / ext4 defaults 0 1\n")
            .file("/etc/motd", b"welcome\n")
            .symlink("/etc/issue", "motd")
            .build();
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&bytes).expect("write image");
        file.flush().expect("flush");
        file
    }

    fn vm_args(file: &tempfile::NamedTempFile) -> VmArgs {
        VmArgs {
            images: vec![file.path().to_path_buf()],
            read_write: false,
            base_only: false,
            raw: false,
            dev_root: None,
            root: 0,
        }
    }

    #[test]
    fn ls_and_cat_read_the_guest() {
        let file = image();
        let vm = vm_args(&file);

        let mut listing = Vec::new();
        ls(&vm, "/etc", false, &mut listing).expect("ls");
        assert_eq!(String::from_utf8_lossy(&listing), "fstab\nissue\nmotd\n");

        let mut long = Vec::new();
        ls(&vm, "/etc/", true, &mut long).expect("ls -l");
        let long = String::from_utf8_lossy(&long);
        assert!(long.lines().any(|l| l.starts_with('l') && l.ends_with("issue -> motd")));

        let mut body = Vec::new();
        cat(&vm, "/etc/issue", &mut body).expect("cat");
        assert_eq!(body, b"welcome\n");
    }

    #[test]
    fn inspect_emits_json() {
        let file = image();
        let mut out = Vec::new();
        inspect(&vm_args(&file), true, &mut out).expect("inspect");
        let json: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(json["roots"][0]["os"], "linux");
        assert_eq!(json["filesystems"][0]["label"], "root");
    }

    #[test]
    fn missing_root_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&vec![0_u8; 1 << 16]).expect("write");
        file.flush().expect("flush");
        let err = ls(&vm_args(&file), "/", false, &mut Vec::new()).expect_err("no root");
        assert!(err.to_string().contains("no operating system root"));
    }
}
