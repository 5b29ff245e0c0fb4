//! cryptmirror - Transparent per-file encrypting mirror filesystem
//!
//! Usage:
//!   cryptmirror mount <mount_point>      - Mount the virtual drive
//!   cryptmirror unmount <mount_point>    - Unmount a mounted drive
//!   cryptmirror encrypt <input> <output> - Encrypt one file directly
//!   cryptmirror decrypt <input> <output> - Decrypt one backing file

use clap::{Parser, Subcommand};
use cryptmirror::cache::PlaintextCache;
use cryptmirror::config::{default_config_path, Config};
use cryptmirror::crypto::{self, Passphrase};
use cryptmirror::fs::{EncryptedMirror, MirrorFs};
use cryptmirror::{Error, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "cryptmirror")]
#[command(author = "cryptmirror Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Transparent per-file encrypting mirror filesystem")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the virtual drive
    Mount {
        /// Mount point directory
        mount_point: PathBuf,

        /// Directory holding the encrypted backing files
        #[arg(long)]
        backing_dir: Option<PathBuf>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Mount read-only
        #[arg(long)]
        read_only: bool,

        /// Read encryption password from file
        #[arg(long)]
        password_file: Option<PathBuf>,
    },

    /// Unmount the virtual drive
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Encrypt a single file into the backing format
    Encrypt {
        /// Plaintext input file
        input: PathBuf,

        /// Encrypted output file
        output: PathBuf,

        /// Read encryption password from file
        #[arg(long)]
        password_file: Option<PathBuf>,
    },

    /// Decrypt a single backing file
    Decrypt {
        /// Encrypted input file
        input: PathBuf,

        /// Plaintext output file
        output: PathBuf,

        /// Read encryption password from file
        #[arg(long)]
        password_file: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Mount {
            mount_point,
            backing_dir,
            allow_other,
            read_only,
            password_file,
        } => cmd_mount(
            config_path,
            &mount_point,
            backing_dir,
            allow_other,
            read_only,
            password_file,
        ),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Encrypt {
            input,
            output,
            password_file,
        } => cmd_encrypt(&input, &output, password_file),

        Commands::Decrypt {
            input,
            output,
            password_file,
        } => cmd_decrypt(&input, &output, password_file),
    }
}

/// Load the config file if present, otherwise fall back to environment
/// variables and defaults
fn load_config(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        Config::load(config_path)
    } else {
        Ok(Config::from_env())
    }
}

/// Resolve the encryption password: a password file wins, an interactive
/// masked prompt is the fallback
fn read_password(password_file: Option<&Path>) -> Result<Passphrase> {
    let password = if let Some(path) = password_file {
        std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("Failed to read password file: {}", e)))?
            .trim()
            .to_string()
    } else {
        rpassword::prompt_password("Enter encryption password: ")
            .map_err(|e| Error::Internal(e.to_string()))?
    };

    if password.is_empty() {
        return Err(Error::InvalidConfig(
            "Password must not be empty".to_string(),
        ));
    }
    Ok(Passphrase::new(password))
}

fn cmd_mount(
    config_path: &Path,
    mount_point: &Path,
    backing_dir: Option<PathBuf>,
    allow_other: bool,
    read_only: bool,
    password_file: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = backing_dir {
        config.mirror.backing_dir = dir;
    }
    config.mount.mount_point = mount_point.to_path_buf();
    config.mount.allow_other = allow_other || config.mount.allow_other;
    config.mount.read_only = read_only || config.mount.read_only;
    config.validate()?;

    let password_file = password_file.or_else(|| config.mirror.password_file.clone());
    let password = read_password(password_file.as_deref())?;

    // Build mount options
    let mut options = vec![
        fuser::MountOption::FSName("cryptmirror".to_string()),
        fuser::MountOption::AutoUnmount,
    ];
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if config.mount.allow_root {
        options.push(fuser::MountOption::AllowRoot);
    }
    if config.mount.read_only {
        options.push(fuser::MountOption::RO);
    }

    // Ensure mount point exists
    std::fs::create_dir_all(mount_point)?;

    let cache = Arc::new(PlaintextCache::new(config.cache.ttl()));
    let sweeper = cache.start_sweeper(config.cache.sweep_interval())?;

    let mirror = EncryptedMirror::new(
        config.mirror.backing_dir.clone(),
        password,
        Arc::clone(&cache),
    )?;
    let fs = MirrorFs::new(mirror);

    info!(
        "Mounting {:?} at {:?}",
        config.mirror.backing_dir, mount_point
    );
    fuser::mount2(fs, mount_point, &options).map_err(|e| Error::Internal(e.to_string()))?;

    sweeper.stop();
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if !output.status.success() {
        return Err(Error::Internal(format!(
            "Unmount failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn cmd_encrypt(input: &Path, output: &Path, password_file: Option<PathBuf>) -> Result<()> {
    let password = read_password(password_file.as_deref())?;

    let mut reader = File::open(input).map_err(|e| Error::from_io(input, e))?;
    let mut writer = File::create(output).map_err(|e| Error::from_io(output, e))?;

    let bytes = crypto::encrypt(&mut reader, &mut writer, &password)?;
    info!("Encrypted {} bytes into {:?}", bytes, output);
    Ok(())
}

fn cmd_decrypt(input: &Path, output: &Path, password_file: Option<PathBuf>) -> Result<()> {
    let password = read_password(password_file.as_deref())?;

    let mut reader = File::open(input).map_err(|e| Error::from_io(input, e))?;
    let mut writer = File::create(output).map_err(|e| Error::from_io(output, e))?;

    let bytes = crypto::decrypt(&mut reader, &mut writer, &password)?;
    info!("Decrypted {} bytes into {:?}", bytes, output);
    Ok(())
}
