//! sealfs - Transparent encrypting overlay filesystem
//!
//! Usage:
//!   sealfs mount <passphrase> <backing_dir> <mount_point>  - Mount the filesystem
//!   sealfs unmount <mount_point>                          - Unmount it again
//!   sealfs inspect <backing_file>                         - Show how a file is stored
//!   sealfs config                                         - Show the effective configuration

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sealfs::{
    config::Config,
    crypto::{plaintext_len, StreamHeader},
    fs::{marker, mount, SealFs},
    session::canonical_dir,
    MountSession,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "sealfs")]
#[command(author = "sealfs Contributors")]
#[command(version)]
#[command(about = "Transparent encrypting overlay filesystem")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the backing directory at the mount point
    Mount {
        /// Mount passphrase, or "-" to prompt for it
        passphrase: String,

        /// Directory holding the stored files
        backing_dir: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Extra mount options, passed through to FUSE
        #[arg(short = 'o', value_name = "OPTION")]
        options: Vec<String>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Show how a backing file is stored
    Inspect {
        /// File inside the backing directory
        backing_file: PathBuf,
    },

    /// Print the effective configuration
    Config {
        /// Write it to the configuration file
        #[arg(long)]
        save: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sealfs: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_level = if cli.debug || config.debug {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("sealfs: failed to set up logging: {}", e);
    }

    if let Err(e) = run_command(cli.command, config, cli.debug, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(
    command: Commands,
    mut config: Config,
    debug: bool,
    config_path: &Path,
) -> anyhow::Result<()> {
    config.debug |= debug;

    match command {
        Commands::Mount {
            passphrase,
            backing_dir,
            mount_point,
            options,
            allow_other,
        } => {
            config.mount.allow_other |= allow_other;
            config.mount.options.extend(options);
            config.validate()?;
            cmd_mount(&config, &passphrase, &backing_dir, &mount_point)
        }

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Inspect { backing_file } => cmd_inspect(&backing_file),

        Commands::Config { save } => cmd_config(&config, save, config_path),
    }
}

fn cmd_mount(
    config: &Config,
    passphrase: &str,
    backing_dir: &Path,
    mount_point: &Path,
) -> anyhow::Result<()> {
    let mount_point = canonical_dir(mount_point)
        .with_context(|| format!("invalid mount point {:?}", mount_point))?;

    let passphrase = if passphrase == "-" {
        rpassword::prompt_password("Passphrase: ").context("failed to read passphrase")?
    } else {
        passphrase.to_string()
    };
    if passphrase.is_empty() {
        bail!("passphrase must not be empty");
    }

    let session = MountSession::new(backing_dir, &passphrase, config)
        .with_context(|| format!("invalid backing directory {:?}", backing_dir))?;

    if !marker::supported(session.backing_dir()) {
        warn!(
            "{:?} does not accept user extended attributes; new files cannot be sealed",
            session.backing_dir()
        );
    }

    // Requested modes reach the backing store as given; the adapter applies
    // the caller's umask itself.
    let _ = nix::sys::stat::umask(nix::sys::stat::Mode::empty());

    let fs = SealFs::new(Arc::new(session));
    info!(
        "Serving {:?} at {:?}",
        fs.session().backing_dir(),
        mount_point
    );
    mount(fs, &mount_point, &config.mount)?;

    info!("Unmounted {:?}", mount_point);
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> anyhow::Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()
        .context("failed to run fusermount")?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()
        .context("failed to run umount")?;

    if !output.status.success() {
        bail!(
            "failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    info!("Unmounted successfully");
    Ok(())
}

fn cmd_inspect(backing_file: &Path) -> anyhow::Result<()> {
    let meta = std::fs::symlink_metadata(backing_file)
        .with_context(|| format!("cannot stat {:?}", backing_file))?;
    let encrypted = marker::is_encrypted(backing_file);

    println!("File: {:?}", backing_file);
    println!("Stored size: {} bytes", meta.len());
    println!("Marker: {}", if encrypted { "encrypted" } else { "plaintext" });

    if !encrypted || !meta.is_file() {
        return Ok(());
    }

    let mut file = File::open(backing_file)
        .with_context(|| format!("cannot open {:?}", backing_file))?;
    match StreamHeader::read_from(&mut file) {
        Ok(header) => {
            println!("Format version: {}", header.version);
            println!("Key id: {}", hex::encode(header.key_id));
            match plaintext_len(meta.len()) {
                Some(len) => println!("Plaintext size: {} bytes", len),
                None => println!("Plaintext size: unknown (truncated stream)"),
            }
        }
        Err(e) => println!("Header: invalid ({})", e),
    }
    Ok(())
}

fn cmd_config(config: &Config, save: bool, config_path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    println!("{}", json);

    if save {
        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {:?}", dir))?;
        }
        config.save(config_path)?;
        info!("Saved configuration to {:?}", config_path);
    }
    Ok(())
}
