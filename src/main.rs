use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
mod auth;
use pagecrypt::{
    CodecConfig, EncryptedDatabase, KdfLine, KdfParams, KeyDerivation, RekeyTarget, Secret,
    SuiteId, inspect, registry,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, clap::Args)]
struct KdfArgs {
    /// Argon2 memory cost in KiB (default: 65536)
    #[arg(long = "kdf-mem")]
    mem_cost_kib: Option<u32>,

    /// Argon2 time cost / iterations (default: 3)
    #[arg(long = "kdf-iterations")]
    time_cost: Option<u32>,

    /// Argon2 parallelism (default: 1)
    #[arg(long = "kdf-parallelism")]
    parallelism: Option<u32>,
}

impl KdfArgs {
    fn to_kdf_params(&self, base: KdfParams) -> Result<KdfParams> {
        Ok(KdfParams::new(
            self.mem_cost_kib.unwrap_or(base.mem_cost_kib()),
            self.time_cost.unwrap_or(base.time_cost()),
            self.parallelism.unwrap_or(base.parallelism()),
        )?)
    }
}

#[derive(Debug, Parser)]
#[command(name = "pagecrypt")]
#[command(
    version,
    about = "Transparent page-level encryption for embedded database files."
)]
struct Cli {
    /// Path to the database file
    #[arg(long, global = true, value_name = "PATH", env = "PAGECRYPT_DB")]
    db: Option<PathBuf>,

    /// JSON codec configuration used by `init`
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Creates a new encrypted database
    Init {
        /// Cipher suite (see `pagecrypt ciphers`)
        #[arg(long)]
        cipher: Option<SuiteId>,

        /// Page size in bytes, a power of two between 512 and 65536
        #[arg(long)]
        page_size: Option<usize>,

        /// Reserved trailer bytes per page (default: what the cipher needs)
        #[arg(long)]
        reserved: Option<usize>,

        #[command(flatten)]
        kdf: KdfArgs,
    },

    /// Writes text into a page; the page after the last one is appended
    #[command(arg_required_else_help = true)]
    Write { page: u32, text: String },

    /// Prints the text stored in a page
    #[command(arg_required_else_help = true)]
    Read { page: u32 },

    /// Re-encrypts every page under a new key or cipher
    Rekey {
        /// New cipher suite (default: keep the current one)
        #[arg(long, conflicts_with = "decrypt")]
        cipher: Option<SuiteId>,

        #[command(flatten)]
        kdf: KdfArgs,

        /// Removes encryption instead
        #[arg(long, default_value_t = false)]
        decrypt: bool,
    },

    /// Shows the unencrypted header; needs no key
    Info,

    /// Lists the available cipher suites
    Ciphers,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("PAGECRYPT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_db(path: Option<PathBuf>) -> Result<PathBuf> {
    path.context("no database given; use --db or PAGECRYPT_DB")
}

fn main() -> Result<()> {
    init_logging();
    let args = Cli::parse();

    match args.command {
        Commands::Ciphers => {
            println!("{:<26}  {:>3}  {:>8}  {:>5}", "Cipher", "Key", "Reserved", "Auth");
            println!("{:-<26}  {:->3}  {:->8}  {:->5}", "", "", "", "");
            for suite in registry().iter() {
                println!(
                    "{:<26}  {:>3}  {:>8}  {:>5}",
                    suite.name(),
                    suite.key_len(),
                    suite.reserved_bytes(),
                    if suite.is_authenticated() { "yes" } else { "no" }
                );
            }
        }

        Commands::Init {
            cipher,
            page_size,
            reserved,
            kdf,
        } => {
            let path = resolve_db(args.db)?;
            let mut config = match &args.config {
                Some(file) => CodecConfig::load(file)
                    .with_context(|| format!("failed to load {}", file.display()))?,
                None => CodecConfig::new(cipher.unwrap_or(SuiteId::XChaCha20Poly1305)),
            };
            if let Some(cipher) = cipher {
                config.cipher = cipher;
            }
            if let Some(page_size) = page_size {
                config.page_size = page_size;
            }
            if reserved.is_some() {
                config.reserved_bytes = reserved;
            }
            let kdf = kdf.to_kdf_params(config.kdf_params()?)?;
            config = config.with_kdf(kdf);

            if config.passphrase.is_none() && config.raw_key.is_none() {
                match auth::read_new_secret(auth::RAW_KEY_ENV, auth::PASSPHRASE_ENV)? {
                    Secret::Passphrase(pw) => config.passphrase = Some(pw.to_string()),
                    Secret::RawKey(key) => config.raw_key = Some(hex::encode(key.as_slice())),
                }
            }

            let db = EncryptedDatabase::create_file(path, &config)
                .context("failed to create database")?;
            let info = db.info();
            println!(
                "database initialized ({}, page size {})",
                config.cipher,
                info.geometry.page_size()
            );
        }

        Commands::Write { page, text } => {
            let path = resolve_db(args.db)?;
            let secret = auth::read_secret()?;
            let mut db = EncryptedDatabase::open_file(path, &secret)?;
            db.write_payload(page, text.as_bytes())
                .with_context(|| format!("failed to write page {page}"))?;
            println!("page {page} written");
        }

        Commands::Read { page } => {
            let path = resolve_db(args.db)?;
            let secret = auth::read_secret()?;
            let mut db = EncryptedDatabase::open_file(path, &secret)?;
            let payload = db
                .read_payload(page)
                .with_context(|| format!("failed to read page {page}"))?;
            let end = payload
                .iter()
                .rposition(|&b| b != 0)
                .map_or(0, |last| last + 1);
            println!("{}", String::from_utf8_lossy(&payload[..end]));
        }

        Commands::Rekey {
            cipher,
            kdf,
            decrypt,
        } => {
            let path = resolve_db(args.db)?;
            let secret = auth::read_secret()?;
            let mut db = EncryptedDatabase::open_file(path, &secret)
                .context("current key does not open the database")?;

            let target = if decrypt {
                RekeyTarget::Plaintext
            } else {
                let current = db.info();
                let Some(current_suite) = current.suite else {
                    bail!("database is not encrypted");
                };
                let base = match current.derivation {
                    Some(KeyDerivation::Argon2id(params)) => params,
                    _ => KdfParams::default(),
                };
                RekeyTarget::Encrypted {
                    suite: cipher.unwrap_or(current_suite),
                    secret: auth::read_new_secret(
                        auth::NEW_RAW_KEY_ENV,
                        auth::NEW_PASSPHRASE_ENV,
                    )?,
                    kdf: kdf.to_kdf_params(base)?,
                }
            };

            let handle = db.abort_handle();
            ctrlc::set_handler(move || handle.abort())
                .context("failed to install Ctrl-C handler")?;

            let report = db.rekey(target)?;
            match report.suite {
                Some(suite) => println!("rekeyed {} pages ({suite})", report.pages_migrated),
                None => println!("decrypted {} pages", report.pages_migrated),
            }
        }

        Commands::Info => {
            let path = resolve_db(args.db)?;
            let header = inspect(&path)?;
            let len = std::fs::metadata(&path)?.len();
            println!("cipher:      {}", header.suite());
            println!("page size:   {}", header.page_size());
            println!("reserved:    {}", header.reserved());
            println!("pages:       {}", len / u64::from(header.page_size()));
            println!("version:     {}", header.version());
            println!("{}", KdfLine(header.derivation()));
        }
    }

    Ok(())
}
