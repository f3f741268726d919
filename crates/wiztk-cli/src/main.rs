use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::Secret;
use std::path::PathBuf;
use wiztk_core::{
    decipher, digest_authenticate, digest_generate, encipher, AuthenticateInfo, DecipherOptions,
    DigestAlg, EncipherOptions, ExceptionAggregator, RandomReservoir, WiztkConfig,
};
use wiztk_core::auth::default_keyring_path;
use wiztk_core::cipher::{CipherKind, CipherMode};
use wiztk_core::entropy::EntropyCodec;
use wiztk_core::packet::{AuthenticateMethod, HmacAlg, KeyHash};

#[derive(Parser)]
#[command(name = "wiztk", version, about = "Authenticated file encryption and digest toolkit")]
struct Cli {
    /// Path to the config TOML (defaults to $WIZTK_CONFIG or ~/.wiztk/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the random reservoir file (defaults to ~/.wiztk/reservoir.xdm).
    #[arg(long, global = true)]
    reservoir: Option<PathBuf>,

    /// Write structured logs to this file in addition to stderr.
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encrypt a file into a self-describing cipher packet.
    Encipher {
        input: PathBuf,
        output: PathBuf,

        #[arg(long)]
        cipher: Option<String>,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        hmac: Option<String>,
        #[arg(long = "entropy")]
        entropy_codec: Option<String>,
        #[arg(long = "entropy-level")]
        entropy_level: Option<u32>,
        #[arg(long)]
        chunksize: Option<u64>,
        #[arg(long = "key-hash")]
        key_hash: Option<String>,
        #[arg(long = "key-length")]
        key_length: Option<u32>,
        #[arg(long)]
        properties: Option<String>,
        /// Decompress the input transparently before encrypting (gzip/bzip2/xz by extension).
        #[arg(long)]
        decompress_input: bool,
        /// Use the keyring at the default (or --keyring) path instead of prompting only.
        #[arg(long)]
        keyring: bool,
        #[arg(long)]
        keyring_path: Option<PathBuf>,
        /// Run the pipeline this many times and report elapsed time (benchmarking).
        #[arg(long)]
        bench: Option<u32>,
    },

    /// Decrypt a cipher packet back into plaintext.
    Decipher {
        input: PathBuf,
        output: PathBuf,

        #[arg(long)]
        properties: Option<String>,
        #[arg(long)]
        decompress_input: bool,
        #[arg(long)]
        keyring: bool,
        #[arg(long)]
        keyring_path: Option<PathBuf>,
        #[arg(long)]
        bench: Option<u32>,
    },

    /// List the supported ciphers, modes, HMAC algorithms, and entropy
    /// codecs and their parameters, without touching any file.
    CipherInfo,

    /// Generate or verify an RDF digest manifest over a set of files.
    Digest {
        #[command(subcommand)]
        action: DigestAction,
    },

    /// Manage the at-rest keyring (key_id -> key material).
    Keyring {
        #[command(subcommand)]
        action: KeyringAction,
    },
}

#[derive(Subcommand)]
enum DigestAction {
    /// Hash each input file and write an RDF manifest to --out (or stdout).
    Generate {
        inputs: Vec<PathBuf>,
        #[arg(long)]
        alg: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Re-hash every file an RDF manifest references and report mismatches.
    Authenticate { manifest: PathBuf },
}

#[derive(Subcommand)]
enum KeyringAction {
    /// Derives a key from a prompted passphrase and stores it under its key-id.
    Add {
        #[arg(long = "key-hash")]
        key_hash: Option<String>,
        #[arg(long = "key-length")]
        key_length: Option<u32>,
    },
    List,
    Remove { key_id_hex: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref())?;

    let result = run(&cli);
    if let Err(e) = &result {
        tracing::error!(error = %e, "wiztk command failed");
        eprintln!("wiztk: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(log_path: Option<&std::path::Path>) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_path {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
            let file_name = path.file_name().ok_or_else(|| anyhow!("--log path has no file name"))?;
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            fmt().with_env_filter(filter).with_writer(file_appender).with_ansi(false).init();
        }
        None => {
            fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        }
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let config_path = match &cli.config {
        Some(p) => p.clone(),
        None => WiztkConfig::default_path()?,
    };
    let config = WiztkConfig::load(&config_path).context("loading config")?;

    match &cli.command {
        Command::Encipher { .. } => run_encipher(cli, &config),
        Command::Decipher { .. } => run_decipher(cli, &config),
        Command::CipherInfo => run_cipher_info(),
        Command::Digest { action } => run_digest(action),
        Command::Keyring { action } => run_keyring(cli, &config, action),
    }
}

fn default_reservoir_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot find home directory"))?;
    Ok(home.join(".wiztk").join("reservoir.xdm"))
}

fn open_reservoir(cli: &Cli, config: &WiztkConfig) -> Result<RandomReservoir> {
    let path = match cli.reservoir.clone().or_else(|| config.reservoir_path.clone()) {
        Some(p) => p,
        None => default_reservoir_path()?,
    };
    RandomReservoir::open(&path).map_err(|e| anyhow!(e).context("opening random reservoir"))
}

fn prompt_passphrase(prompt: &str) -> Result<Secret<String>> {
    let text = rpassword::prompt_password(prompt).context("reading passphrase")?;
    Ok(Secret::new(text))
}

fn build_auth_info(
    keyring: bool,
    keyring_path: Option<PathBuf>,
    key_hash: KeyHash,
    key_length: u32,
    prompt: &str,
) -> Result<AuthenticateInfo> {
    let passphrase = prompt_passphrase(prompt)?;
    let resolved_keyring_path = if keyring {
        Some(match keyring_path {
            Some(p) => p,
            None => default_keyring_path().map_err(|e| anyhow!(e))?,
        })
    } else {
        None
    };
    Ok(AuthenticateInfo {
        method: AuthenticateMethod::Secret,
        keyring_path: resolved_keyring_path,
        key_hash,
        key_length,
        passphrase,
    })
}

fn run_encipher(cli: &Cli, config: &WiztkConfig) -> Result<()> {
    let Command::Encipher {
        input,
        output,
        cipher,
        mode,
        hmac,
        entropy_codec,
        entropy_level,
        chunksize,
        key_hash,
        key_length,
        properties,
        decompress_input,
        keyring,
        keyring_path,
        bench,
    } = &cli.command
    else {
        unreachable!()
    };

    let opts = EncipherOptions {
        cipher: CipherKind::from_str(cipher.as_deref().unwrap_or(&config.cipher)).map_err(|e| anyhow!(e))?,
        mode: CipherMode::from_str(mode.as_deref().unwrap_or(&config.mode)).map_err(|e| anyhow!(e))?,
        hmac: HmacAlg::from_str(hmac.as_deref().unwrap_or(&config.hmac)).map_err(|e| anyhow!(e))?,
        entropy_codec: EntropyCodec::from_str(entropy_codec.as_deref().unwrap_or(&config.entropy_codec))
            .map_err(|e| anyhow!(e))?,
        entropy_level: entropy_level.unwrap_or(config.entropy_level),
        chunksize: chunksize.unwrap_or(config.chunksize),
        key_hash: KeyHash::from_str(key_hash.as_deref().unwrap_or(&config.key_hash)).map_err(|e| anyhow!(e))?,
        key_length: key_length.unwrap_or(config.key_length),
        properties_path: properties.clone(),
        transparent_compression: *decompress_input,
    };

    let auth = build_auth_info(
        *keyring,
        keyring_path.clone(),
        opts.key_hash,
        opts.key_length,
        "Passphrase: ",
    )?;
    let reservoir = open_reservoir(cli, config)?;
    let warnings = ExceptionAggregator::new();

    let runs = bench.unwrap_or(1).max(1);
    let mut last_chunks = 0u64;
    let started = std::time::Instant::now();
    for _ in 0..runs {
        last_chunks = encipher(
            input.to_str().ok_or_else(|| anyhow!("input path is not valid UTF-8"))?,
            output.to_str().ok_or_else(|| anyhow!("output path is not valid UTF-8"))?,
            &opts,
            &auth,
            &reservoir,
            &warnings,
        )
        .map_err(|e| anyhow!(e))?;
    }
    let elapsed = started.elapsed();

    for w in warnings.drain() {
        eprintln!("wiztk: warning: {w}");
    }
    if bench.is_some() {
        println!(
            "encipher: {runs} run(s), {last_chunks} chunks in the final run, {elapsed:?} total ({:?}/run)",
            elapsed / runs
        );
    } else {
        println!("encipher: wrote {last_chunks} chunk(s) to {}", output.display());
    }

    reservoir.close().map_err(|e| anyhow!(e).context("closing random reservoir"))?;
    Ok(())
}

fn run_decipher(cli: &Cli, config: &WiztkConfig) -> Result<()> {
    let Command::Decipher {
        input,
        output,
        properties,
        decompress_input,
        keyring,
        keyring_path,
        bench,
    } = &cli.command
    else {
        unreachable!()
    };

    let opts = DecipherOptions {
        properties_path: properties.clone(),
        transparent_compression: *decompress_input,
    };

    let auth = build_auth_info(
        *keyring,
        keyring_path.clone(),
        KeyHash::from_str(&config.key_hash).map_err(|e| anyhow!(e))?,
        config.key_length,
        "Passphrase: ",
    )?;
    let warnings = ExceptionAggregator::new();

    let runs = bench.unwrap_or(1).max(1);
    let mut descriptor_about = String::new();
    let started = std::time::Instant::now();
    for _ in 0..runs {
        let descriptor = decipher(
            input.to_str().ok_or_else(|| anyhow!("input path is not valid UTF-8"))?,
            output.to_str().ok_or_else(|| anyhow!("output path is not valid UTF-8"))?,
            &opts,
            &auth,
            &warnings,
        )
        .map_err(|e| anyhow!(e))?;
        descriptor_about = descriptor.about;
    }
    let elapsed = started.elapsed();

    for w in warnings.drain() {
        eprintln!("wiztk: warning: {w}");
    }
    if bench.is_some() {
        println!("decipher: {runs} run(s), {elapsed:?} total ({:?}/run)", elapsed / runs);
    } else {
        println!("decipher: recovered '{descriptor_about}' into {}", output.display());
    }
    Ok(())
}

fn run_cipher_info() -> Result<()> {
    println!("ciphers (block size in bytes, valid key lengths in bits):");
    for kind in [CipherKind::Aes, CipherKind::Serpent, CipherKind::TwoFish] {
        println!("  {:<8} block={:<3} key-lengths=256,512,1024,2048", kind.as_str(), kind.block_size());
    }

    println!("modes (stream mode never pads, others require a nonce):");
    for mode in [CipherMode::Ecb, CipherMode::Cbc, CipherMode::Cfb, CipherMode::Ctr, CipherMode::Ofb] {
        println!(
            "  {:<4} stream={:<5} requires-nonce={}",
            mode.as_str(),
            mode.is_stream_mode(),
            mode.requires_nonce()
        );
    }

    println!("hmac algorithms (digest size in bytes):");
    for hmac in [HmacAlg::None, HmacAlg::Sha256, HmacAlg::Sha384, HmacAlg::Sha512] {
        println!("  {:<6} digest={}", hmac.as_str(), hmac.digest_size());
    }

    println!("entropy codecs:");
    for codec in [EntropyCodec::None, EntropyCodec::Zip, EntropyCodec::Bzip, EntropyCodec::Lzma] {
        println!("  {}", codec.as_str());
    }

    println!("key-hash algorithms (key-id length in bytes):");
    for key_hash in [KeyHash::Sha256, KeyHash::Sha384, KeyHash::Sha512, KeyHash::Sha3_256] {
        println!("  {:<7} key-id={}", key_hash.as_str(), key_hash.digest_len());
    }
    Ok(())
}

fn run_digest(action: &DigestAction) -> Result<()> {
    match action {
        DigestAction::Generate { inputs, alg, out } => {
            let alg = DigestAlg::from_str(alg.as_deref().unwrap_or("sha256")).map_err(|e| anyhow!(e))?;
            let paths: Vec<String> = inputs
                .iter()
                .map(|p| p.to_str().map(str::to_string).ok_or_else(|| anyhow!("path is not valid UTF-8")))
                .collect::<Result<_>>()?;
            let (records, rdf) = digest_generate(&paths, alg).map_err(|e| anyhow!(e))?;
            match out {
                Some(path) => std::fs::write(path, &rdf).with_context(|| format!("writing {}", path.display()))?,
                None => print!("{rdf}"),
            }
            eprintln!("digest: hashed {} file(s)", records.len());
            Ok(())
        }
        DigestAction::Authenticate { manifest } => {
            let rdf = std::fs::read(manifest).with_context(|| format!("reading {}", manifest.display()))?;
            let mismatches = digest_authenticate(&rdf).map_err(|e| anyhow!(e))?;
            if mismatches.is_empty() {
                println!("digest: all referenced files match");
                Ok(())
            } else {
                for m in &mismatches {
                    println!("MISMATCH {}: {}", m.path, m.detail);
                }
                Err(anyhow!("{} file(s) failed digest authentication", mismatches.len()))
            }
        }
    }
}

fn run_keyring(cli: &Cli, config: &WiztkConfig, action: &KeyringAction) -> Result<()> {
    let _ = cli;
    let path = config.keyring_path.clone().map(Ok).unwrap_or_else(|| default_keyring_path().map_err(|e| anyhow!(e)))?;
    match action {
        KeyringAction::Add { key_hash, key_length } => {
            let key_hash = KeyHash::from_str(key_hash.as_deref().unwrap_or(&config.key_hash)).map_err(|e| anyhow!(e))?;
            let key_length = key_length.unwrap_or(config.key_length);
            let passphrase = prompt_passphrase("Passphrase to add to the keyring: ")?;
            let info = AuthenticateInfo {
                method: AuthenticateMethod::Secret,
                keyring_path: Some(path.clone()),
                key_hash,
                key_length,
                passphrase,
            };
            let (_key, key_id) = info.generate_key().map_err(|e| anyhow!(e))?;
            println!("added key-id {}", hex::encode(&key_id));
            Ok(())
        }
        KeyringAction::List => {
            let keyring = wiztk_core::auth::Keyring::load(&path).map_err(|e| anyhow!(e))?;
            for id in keyring.list() {
                println!("{id}");
            }
            Ok(())
        }
        KeyringAction::Remove { key_id_hex } => {
            let mut keyring = wiztk_core::auth::Keyring::load(&path).map_err(|e| anyhow!(e))?;
            if keyring.remove(key_id_hex) {
                keyring.save(&path).map_err(|e| anyhow!(e))?;
                println!("removed {key_id_hex}");
                Ok(())
            } else {
                Err(anyhow!("no such key id {key_id_hex} in keyring"))
            }
        }
    }
}
