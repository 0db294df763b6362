//! latchfs: encrypted-filesystem repository tool
//!
//! Commands:
//!   create  - create a new repository (generates and wraps the master key)
//!   chpass  - change the password of an existing repository
//!   info    - show the public container parameters
//!
//! Every command takes an exclusive advisory lock on the base directory, so
//! two processes cannot race on the key container.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use latchfs_crypto::container::{self, DEFAULT_BLOCK_SIZE, DEFAULT_IV_SIZE};
use latchfs_crypto::{GcmCipher, Key};
use secrecy::SecretString;
use tracing::info;
use zeroize::Zeroize;

#[derive(Parser, Debug)]
#[command(name = "latchfs", version, about = "Encrypted filesystem repository tool")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LATCHFS_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new repository in an existing base directory
    Create {
        /// Directory where the encrypted data will be stored
        dir: PathBuf,

        /// Container format version (1 or 2)
        #[arg(long, default_value_t = 2)]
        version: u32,

        /// Per-block IV size in bytes (format version 2 only)
        #[arg(long, default_value_t = DEFAULT_IV_SIZE)]
        iv_size: usize,

        /// PBKDF2 rounds (0 = automatic)
        #[arg(long, short = 'r', default_value_t = 0)]
        rounds: u32,

        /// Read the password from stdin directly (useful for piping)
        #[arg(long, short = 's')]
        stdin_pass: bool,
    },

    /// Change the password of an existing repository
    Chpass {
        /// Directory where the encrypted data are stored
        dir: PathBuf,

        /// PBKDF2 rounds for the re-wrapped key (0 = automatic)
        #[arg(long, short = 'r', default_value_t = 0)]
        rounds: u32,

        /// Read passwords from stdin directly (old password first, then new)
        #[arg(long, short = 's')]
        stdin_pass: bool,
    },

    /// Show the public parameters of a repository (never prints secrets)
    Info {
        /// Directory where the encrypted data are stored
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    match cli.command {
        Commands::Create { dir, version, iv_size, rounds, stdin_pass } => {
            create(&dir, version, iv_size, rounds, stdin_pass)
        }
        Commands::Chpass { dir, rounds, stdin_pass } => chpass(&dir, rounds, stdin_pass),
        Commands::Info { dir } => show_info(&dir),
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
}

/// Exclusive, non-blocking advisory lock on the base directory. Held for
/// the lifetime of the returned handle.
fn lock_base_dir(dir: &Path) -> Result<File> {
    let file = File::open(dir)
        .with_context(|| format!("opening base directory {}", dir.display()))?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            bail!("another process is holding the lock on {}", dir.display());
        }
        return Err(err).with_context(|| format!("locking base directory {}", dir.display()));
    }
    Ok(file)
}

fn read_password(prompt: &str, stdin_pass: bool) -> Result<SecretString> {
    if stdin_pass {
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .context("reading password from stdin")?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(SecretString::from(line))
    } else {
        let pass = rpassword::prompt_password(prompt).context("reading password")?;
        Ok(SecretString::from(pass))
    }
}

fn read_password_with_confirmation(stdin_pass: bool) -> Result<SecretString> {
    if stdin_pass {
        return read_password("", true);
    }
    let first = rpassword::prompt_password("Password: ").context("reading password")?;
    let mut second = rpassword::prompt_password("Retype password: ").context("reading password")?;
    let matching = first == second;
    second.zeroize();
    if !matching {
        bail!("mismatched passwords");
    }
    Ok(SecretString::from(first))
}

fn create(dir: &Path, version: u32, iv_size: usize, rounds: u32, stdin_pass: bool) -> Result<()> {
    if version != 1 && version != 2 {
        bail!("unknown format version {version}");
    }
    if version == 2 {
        if !(12..=64).contains(&iv_size) {
            bail!("invalid IV size {iv_size} (must be 12-64)");
        }
        if !GcmCipher::supported_iv_size(iv_size) {
            bail!(
                "IV size {iv_size} is not supported by this build (supported: {:?})",
                latchfs_crypto::gcm::SUPPORTED_IV_SIZES
            );
        }
    }

    let _lock = lock_base_dir(dir)?;
    let password = read_password_with_confirmation(stdin_pass)?;

    let master_key = Key::generate();
    let doc = container::generate(version, &master_key, &password, rounds, DEFAULT_BLOCK_SIZE, iv_size)?;
    container::create_new(dir, &doc)
        .with_context(|| format!("writing key container into {}", dir.display()))?;

    info!(dir = %dir.display(), version, "repository created");
    eprintln!("Repository successfully created at {}", dir.display());
    Ok(())
}

fn chpass(dir: &Path, rounds: u32, stdin_pass: bool) -> Result<()> {
    let _lock = lock_base_dir(dir)?;

    let old_password = read_password("Password: ", stdin_pass)?;

    // Authenticate before asking for the new password; the unlocked key is
    // re-wrapped directly, so the old password is derived only once.
    let doc = container::load(dir)?;
    let (master_key, params) = container::unlock(&doc, &old_password)?;
    eprintln!("Authentication success. Now enter the new password.");

    let new_password = read_password_with_confirmation(stdin_pass)?;
    container::rewrap(dir, doc.version, &master_key, params, &new_password, rounds)?;

    info!(dir = %dir.display(), "password changed");
    eprintln!("Password change success");
    Ok(())
}

fn show_info(dir: &Path) -> Result<()> {
    let doc = container::load(dir)?;
    let (block_size, iv_size) = match doc.version {
        1 => (4096, 32),
        _ => (
            doc.block_size.unwrap_or(DEFAULT_BLOCK_SIZE as u32) as usize,
            doc.iv_size.unwrap_or(DEFAULT_IV_SIZE as u32) as usize,
        ),
    };

    println!("version:    {}", doc.version);
    println!("iterations: {}", doc.iterations);
    println!("block size: {block_size}");
    println!("IV size:    {iv_size}");
    Ok(())
}
