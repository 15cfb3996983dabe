use std::time::Instant;

use clap::{ArgAction, Parser};
use log::info;
use rand::{rngs::StdRng, Rng, SeedableRng};
use zeroize::Zeroizing;

use padora::{random_key, Aes128, CbcPaddingOracle, CrackOptions, Cracker, AES_BLOCK_SIZE};

const DEFAULT_NUM_BLOCKS: i64 = 3;
const MIN_NUM_BLOCKS: i64 = 1;
const MAX_NUM_BLOCKS: i64 = 4_000;

/// Encrypt a random secret with AES-128-CBC and recover it through a
/// padding oracle.
#[derive(Parser, Debug)]
#[command(name = "padora", version, about)]
struct Args {
    /// Number of blocks in the secret message (1 to 4000).
    #[arg(allow_negative_numbers = true)]
    num_blocks: Option<String>,

    /// Seed for the key, IV and message, for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Crack the blocks concurrently.
    #[arg(long)]
    parallel: bool,

    /// Treat an oracle that accepts no guess as an error.
    #[arg(long)]
    strict: bool,

    /// More log output; repeat for more detail. RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    println!();
    let num_blocks = resolve_num_blocks(args.num_blocks.as_deref());
    println!("Using {} blocks", format_count(num_blocks));

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let key = Zeroizing::new(random_key::<AES_BLOCK_SIZE, _>(&mut rng));
    let oracle = CbcPaddingOracle::new(Aes128::new(&key));

    let secret = make_secret_message(&mut rng, num_blocks, AES_BLOCK_SIZE);
    println!(
        "\nLength of secret message is {} bytes",
        format_count(secret.len())
    );

    let ciphertext = oracle.pad_and_encrypt(&secret, &mut rng)?;
    // The IV is not part of the padded message.
    let padded_len = ciphertext.len() - AES_BLOCK_SIZE;
    println!(
        "Length of padded encrypted message is {} bytes",
        format_count(padded_len)
    );

    let cracker = Cracker::new(&oracle)
        .with_options(CrackOptions::default().with_strict(args.strict))
        .with_progress(|calls| info!("{} oracle calls so far", format_count(calls)));
    let start = Instant::now();
    let result = if args.parallel {
        cracker.crack_parallel(&ciphertext, AES_BLOCK_SIZE)?
    } else {
        cracker.crack(&ciphertext, AES_BLOCK_SIZE)?
    };
    let elapsed = start.elapsed();

    println!();
    if result.plaintext == *secret {
        println!(">>>> Secret message successfully retrieved! <<<<");
    } else {
        println!("!!!! Unable to retrieve secret message !!!!");
        show_diff(&secret, &result.plaintext);
    }
    println!();
    println!(
        "{} decryption calls needed {:?}. This means {} calls per byte.",
        format_count(result.oracle_calls),
        elapsed,
        (result.oracle_calls as f64 / padded_len as f64).round() as u64
    );
    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

// Bad input is reported and replaced, never fatal.
fn resolve_num_blocks(arg: Option<&str>) -> usize {
    let requested = match arg {
        None => DEFAULT_NUM_BLOCKS,
        Some(text) => text.parse().unwrap_or_else(|_| {
            eprintln!("Invalid number of blocks: {text}");
            DEFAULT_NUM_BLOCKS
        }),
    };
    clamp_num_blocks(requested)
}

fn clamp_num_blocks(requested: i64) -> usize {
    let clamped = requested.clamp(MIN_NUM_BLOCKS, MAX_NUM_BLOCKS);
    if clamped != requested {
        eprintln!("Invalid number of blocks: {requested}");
    }
    clamped as usize
}

// A few bytes short of `num_blocks` full blocks, so the padding length varies.
fn make_secret_message<R: Rng>(
    rng: &mut R,
    num_blocks: usize,
    block_size: usize,
) -> Zeroizing<Vec<u8>> {
    let len = num_blocks * block_size - rng.gen_range(0..block_size);
    let mut message = Zeroizing::new(vec![0u8; len]);
    rng.fill(message.as_mut_slice());
    message
}

fn show_diff(expected: &[u8], actual: &[u8]) {
    if expected.len() != actual.len() {
        println!(
            "length: {} != {}",
            format_count(expected.len()),
            format_count(actual.len())
        );
    }
    for (i, (a, b)) in expected.iter().zip(actual).enumerate() {
        if a != b {
            println!("{i}: {a:02x} != {b:02x}");
        }
    }
}

/// Format a count with thousands separators, e.g., "1,234,567".
fn format_count(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
