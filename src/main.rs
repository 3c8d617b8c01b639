use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rand_chacha::rand_core::RngCore;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroize;

use fortify::cipher::CipherModeName;
use fortify::keys::{KeyKind, KeyProvider};
use fortify::{Fortifier, share};

/// Encrypt files into integrity-checked containers, protecting the data
/// key with Shamir secret sharing or an RSA key pair.
#[derive(Parser)]
#[command(name = "fortify", version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt an input file
    Encrypt {
        /// Path of the input file
        #[arg(short = 'i', long = "in")]
        input: PathBuf,

        /// Path of the output fortified/encrypted file
        #[arg(short, long, default_value = "fortified.data")]
        out: PathBuf,

        /// Truncate non-empty output files before writing
        #[arg(short = 'T', long)]
        truncate: bool,

        /// Cipher key kind, options: [sss|rsa]
        #[arg(short, long, default_value = "sss")]
        key: String,

        /// Cipher mode name, options: [aes256-ctr|aes256-ofb|aes256-cfb]
        #[arg(short, long, default_value = "aes256-ctr")]
        mode: String,

        /// Share count when generating a fresh key (sss)
        #[arg(short, long, default_value_t = 2)]
        parts: u8,

        /// Share threshold when generating a fresh key (sss)
        #[arg(short, long, default_value_t = 2)]
        threshold: u8,

        /// Existing secret share files (sss) or one public key file (rsa)
        keys: Vec<PathBuf>,
    },

    /// Decrypt the fortified input file
    Decrypt {
        /// Path of the fortified/encrypted input file
        #[arg(short = 'i', long = "in")]
        input: PathBuf,

        /// Path of the output decrypted file
        #[arg(short, long, default_value = "output.data")]
        out: PathBuf,

        /// Truncate non-empty output files before writing
        #[arg(short = 'T', long)]
        truncate: bool,

        /// Secret share files (sss) or one private key file (rsa)
        #[arg(required = true)]
        keys: Vec<PathBuf>,
    },

    /// Shamir's secret sharing
    #[command(subcommand)]
    Sss(SssCommands),

    /// Print version information
    Version,
}

#[derive(Subcommand)]
enum SssCommands {
    /// Split a randomly generated byte array into secret shares
    Random {
        /// Count of secret shares to split into
        #[arg(short, long, default_value_t = 5)]
        parts: u8,

        /// Minimum secret share count for secret recovery
        #[arg(short, long, default_value_t = 3)]
        threshold: u8,

        /// Length of the randomly generated byte array
        #[arg(short, long, default_value_t = 32)]
        bytes: u16,

        /// File path prefix for the generated secret shares
        #[arg(long, default_value = "sss")]
        prefix: String,

        /// Truncate non-empty share files before writing
        #[arg(short = 'T', long)]
        truncate: bool,
    },

    /// Split the content of an input file into secret shares
    Split {
        /// Count of secret shares to split into
        #[arg(short, long, default_value_t = 5)]
        parts: u8,

        /// Minimum secret share count for secret recovery
        #[arg(short, long, default_value_t = 3)]
        threshold: u8,

        /// File path prefix for the generated secret shares
        #[arg(long, default_value = "sss")]
        prefix: String,

        /// Truncate non-empty share files before writing
        #[arg(short = 'T', long)]
        truncate: bool,

        /// Path of the input file
        input: PathBuf,
    },

    /// Combine secret share files to recover the secret
    Combine {
        /// Output file for the recovered secret (verify only when absent)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Truncate a non-empty output file before writing
        #[arg(short = 'T', long)]
        truncate: bool,

        /// Secret share files, at least the recorded threshold of them
        #[arg(required = true, num_args = 2..)]
        shares: Vec<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(err) = run(cli.command) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("fortify={level}")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Encrypt {
            input,
            out,
            truncate,
            key,
            mode,
            parts,
            threshold,
            keys,
        } => {
            let kind: KeyKind = key.parse()?;
            let mode: CipherModeName = mode.parse()?;
            let provider = KeyProvider::for_encrypt(kind, &keys, parts, threshold, truncate)?;
            Fortifier::new(provider, mode).encrypt_file(&input, &out, truncate)?;
        }
        Commands::Decrypt {
            input,
            out,
            truncate,
            keys,
        } => {
            fortify::decrypt_file(&input, Some(out.as_path()), truncate, &keys)?;
        }
        Commands::Sss(command) => run_sss(command)?,
        Commands::Version => {
            println!("fortify {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

fn run_sss(command: SssCommands) -> anyhow::Result<()> {
    match command {
        SssCommands::Random {
            parts,
            threshold,
            bytes,
            prefix,
            truncate,
        } => {
            anyhow::ensure!(bytes > 0, "invalid value of flag --bytes: {bytes}");
            let mut rng = fortify::secure_rng();
            let mut secret = vec![0u8; bytes as usize];
            rng.fill_bytes(&mut secret);
            let result =
                share::split_secret_into_files(&mut rng, &secret, parts, threshold, &prefix, truncate);
            secret.zeroize();
            result?;
        }
        SssCommands::Split {
            parts,
            threshold,
            prefix,
            truncate,
            input,
        } => {
            let mut rng = fortify::secure_rng();
            share::split_into_files(&mut rng, &input, parts, threshold, &prefix, truncate)?;
        }
        SssCommands::Combine {
            out,
            truncate,
            shares,
        } => {
            share::combine_part_files(&shares, out.as_deref(), truncate)?;
        }
    }
    Ok(())
}
