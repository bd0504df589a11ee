//! cryptmirror - transparent encrypting mirror filesystem
//!
//! Usage:
//!   cryptmirror init --mirror <dir>             - Write a configuration
//!   cryptmirror mount <mirror> <mount_point>    - Mount the filesystem
//!   cryptmirror unmount <mount_point>           - Unmount the filesystem
//!   cryptmirror status                          - Show configuration

use clap::{Parser, Subcommand};
use cryptmirror::{
    config::{Config, EncryptionMode},
    crypto::{generate_salt, MasterKey},
    fs::{EncFs, WholeFilePipeline},
    session::MountSession,
    Error, Result,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

/// Environment variable that supplies the passphrase non-interactively
const PASSPHRASE_ENV: &str = "CRYPTMIRROR_PASSPHRASE";

#[derive(Parser)]
#[command(name = "cryptmirror")]
#[command(version = "0.1.0")]
#[command(about = "Transparent encrypting mirror filesystem")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/cryptmirror/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new configuration for a mirror directory
    Init {
        /// Directory holding the encrypted files
        #[arg(long)]
        mirror: PathBuf,

        /// Which files are encrypted: "uniform" or "tagged"
        #[arg(long)]
        mode: Option<EncryptionMode>,
    },

    /// Mount the filesystem
    Mount {
        /// Directory holding the encrypted files
        mirror: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Which files are encrypted: "uniform" or "tagged"
        #[arg(long)]
        mode: Option<EncryptionMode>,

        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Show the effective configuration
    Status,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose when set
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init { mirror, mode } => cmd_init(config_path, &mirror, mode),

        Commands::Mount {
            mirror,
            mount_point,
            mode,
            foreground,
            allow_other,
        } => cmd_mount(config_path, &mirror, &mount_point, mode, foreground, allow_other),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Status => cmd_status(config_path),
    }
}

fn cmd_init(config_path: &Path, mirror: &Path, mode: Option<EncryptionMode>) -> Result<()> {
    info!("Initializing cryptmirror...");

    let mut config = Config::load_or_default(config_path)?;
    config.mirror.root = expand_tilde(mirror);
    if let Some(mode) = mode {
        config.mirror.mode = mode;
    }
    if config.encryption.salt.is_empty() {
        config.encryption.salt = generate_salt().to_vec();
    }
    config.validate()?;

    std::fs::create_dir_all(&config.mirror.root)?;
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Mirror directory: {:?} ({} mode)", config.mirror.root, config.mirror.mode);
    info!("");
    info!("Next step:");
    info!(
        "  Run 'cryptmirror mount {} <mount_point>' to mount the filesystem",
        config.mirror.root.display()
    );

    Ok(())
}

fn cmd_mount(
    config_path: &Path,
    mirror: &Path,
    mount_point: &Path,
    mode: Option<EncryptionMode>,
    foreground: bool,
    allow_other: bool,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    config.mirror.root = expand_tilde(mirror);
    if let Some(mode) = mode {
        config.mirror.mode = mode;
    }
    config.mount.mount_point = expand_tilde(mount_point);
    config.mount.allow_other |= allow_other;
    config.validate()?;

    info!("Starting cryptmirror...");

    // Update config with salt if new
    if config.encryption.salt.is_empty() {
        config.encryption.salt = generate_salt().to_vec();
        config.save(config_path)?;
        info!("Generated new salt, saved to {:?}", config_path);
    }

    let password = read_passphrase()?;

    // Derive keys
    let master_key = MasterKey::from_password(password.as_bytes(), &config.encryption)?;
    let content_key = master_key.content_key()?;
    drop(password);

    let session = MountSession::from_config(&config.mirror, content_key)?;

    // Modes given to create/mkdir/mknod reach the mirror unmasked
    nix::sys::stat::umask(nix::sys::stat::Mode::empty());

    let fs = EncFs::new(
        session,
        Box::new(WholeFilePipeline::aead()),
        Duration::from_secs(config.mount.attr_ttl_secs),
    );

    let mount_point = &config.mount.mount_point;
    std::fs::create_dir_all(mount_point)?;

    info!("Mounting {:?} at {:?}", config.mirror.root, mount_point);

    let mut options = vec![
        fuser::MountOption::FSName("cryptmirror".to_string()),
        fuser::MountOption::AutoUnmount,
    ];

    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    } else if config.mount.allow_root {
        options.push(fuser::MountOption::AllowRoot);
    }

    if config.mount.default_permissions {
        options.push(fuser::MountOption::DefaultPermissions);
    }

    if !foreground {
        info!(
            "Running attached; use 'cryptmirror unmount {:?}' from another shell to unmount",
            mount_point
        );
    }

    fuser::mount2(fs, mount_point, &options).map_err(|e| Error::Internal(e.to_string()))?;

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

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;

    println!("cryptmirror Status");
    println!("==================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Mirror directory: {:?}", config.mirror.root);
    println!("Encryption mode: {}", config.mirror.mode);
    if config.mirror.mode == EncryptionMode::Tagged {
        println!("Tag attribute: {}", config.mirror.tag_attribute);
    }
    println!(
        "Key derivation: Argon2id ({} KiB, {} iterations, {} lanes)",
        config.encryption.argon2_memory_kib,
        config.encryption.argon2_iterations,
        config.encryption.argon2_parallelism
    );
    println!(
        "Salt: {}",
        if config.encryption.salt.is_empty() { "not generated" } else { "present" }
    );
    println!("Mount point: {:?}", config.mount.mount_point);
    println!("Allow other: {}", config.mount.allow_other);
    println!("Attribute TTL: {}s", config.mount.attr_ttl_secs);

    if !config.mirror.root.is_dir() {
        warn!("Mirror directory {:?} does not exist", config.mirror.root);
    }

    Ok(())
}

/// Passphrase from the environment, else prompt on the terminal
fn read_passphrase() -> Result<Zeroizing<String>> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        if !passphrase.is_empty() {
            return Ok(Zeroizing::new(passphrase));
        }
    }

    rpassword::prompt_password("Enter encryption passphrase: ")
        .map(Zeroizing::new)
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
