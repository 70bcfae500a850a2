//! BasaltKV CLI
//!
//! Runs one command against a map loaded from the snapshot in the data
//! directory, writing the snapshot back when the command changed anything.

use std::process;
use std::time::Duration;

use basaltkv::codec::CodecType;
use basaltkv::types::key::{decode_key, TYPE_LIST, TYPE_STRING};
use basaltkv::{Config, Lists, ScanMode, SortedMap, Strings};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// BasaltKV CLI
#[derive(Parser, Debug)]
#[command(name = "basalt-cli")]
#[command(about = "Command-line access to a BasaltKV data directory")]
#[command(version)]
struct Args {
    /// Data directory holding the snapshot
    #[arg(short, long, default_value = "./basalt_data")]
    data_dir: String,

    /// Block codec: none, lz4 or zstd
    #[arg(short, long, default_value = "none")]
    codec: CodecType,

    /// Maximum data block size in bytes
    #[arg(long, default_value = "4096")]
    block_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a string value
    Get { key: String },

    /// Set a string value
    Set {
        key: String,
        value: String,

        /// Expire after this many seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Delete a string or a list
    Del { key: String },

    /// Push elements onto the head of a list
    Lpush {
        key: String,
        #[arg(required = true)]
        elements: Vec<String>,
    },

    /// Push elements onto the tail of a list
    Rpush {
        key: String,
        #[arg(required = true)]
        elements: Vec<String>,
    },

    /// Pop from the head of a list
    Lpop { key: String },

    /// Pop from the tail of a list
    Rpop { key: String },

    /// Print list elements in a range
    Lrange {
        key: String,
        #[arg(default_value = "0", allow_hyphen_values = true)]
        start: i64,
        #[arg(default_value = "-1", allow_hyphen_values = true)]
        stop: i64,
    },

    /// Print a list's length
    Llen { key: String },

    /// List stored keys in order
    Scan {
        /// Maximum keys to print
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Print memory and block statistics
    Stats,
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn print_value(value: Option<Vec<u8>>) {
    match value {
        Some(v) => println!("{}", text(&v)),
        None => println!("(nil)"),
    }
}

fn run(map: &SortedMap, command: Commands) -> basaltkv::Result<bool> {
    let strings = Strings::new(map);
    let lists = Lists::new(map);
    let mutated = match command {
        Commands::Get { key } => {
            print_value(strings.get(key.as_bytes())?);
            false
        }
        Commands::Set { key, value, ttl } => {
            let stored = match ttl {
                Some(secs) => strings.set_ex(key.as_bytes(), value.as_bytes(), Duration::from_secs(secs))?,
                None => strings.set(key.as_bytes(), value.as_bytes())?,
            };
            println!("{}", if stored { "OK" } else { "(error) out of memory" });
            stored
        }
        Commands::Del { key } => {
            let removed = strings.del(key.as_bytes())? | lists.delete(key.as_bytes())?;
            println!("(integer) {}", removed as u8);
            removed
        }
        Commands::Lpush { key, elements } => {
            let elements: Vec<&[u8]> = elements.iter().map(|e| e.as_bytes()).collect();
            println!("(integer) {}", lists.lpush(key.as_bytes(), &elements)?);
            true
        }
        Commands::Rpush { key, elements } => {
            let elements: Vec<&[u8]> = elements.iter().map(|e| e.as_bytes()).collect();
            println!("(integer) {}", lists.rpush(key.as_bytes(), &elements)?);
            true
        }
        Commands::Lpop { key } => {
            let popped = lists.lpop(key.as_bytes())?;
            let mutated = popped.is_some();
            print_value(popped);
            mutated
        }
        Commands::Rpop { key } => {
            let popped = lists.rpop(key.as_bytes())?;
            let mutated = popped.is_some();
            print_value(popped);
            mutated
        }
        Commands::Lrange { key, start, stop } => {
            let elements = lists.lrange(key.as_bytes(), start, stop)?;
            if elements.is_empty() {
                println!("(empty list)");
            }
            for (i, element) in elements.iter().enumerate() {
                println!("{}) {}", i + 1, text(element));
            }
            false
        }
        Commands::Llen { key } => {
            println!("(integer) {}", lists.llen(key.as_bytes())?);
            false
        }
        Commands::Scan { limit } => {
            for entry in map.scanner(b"", b"", ScanMode::Safe)?.take(limit) {
                let entry = entry?;
                match decode_key(&entry.key) {
                    Some((TYPE_STRING, key, _)) => println!("string {}", text(key)),
                    Some((TYPE_LIST, key, _)) => println!("list   {}", text(key)),
                    _ => println!("raw    {}", text(&entry.key)),
                }
            }
            false
        }
        Commands::Stats => {
            let stats = map.memory_stats();
            println!("records:          {}", map.count_records()?);
            println!("index blocks:     {}", map.number_of_index_blocks());
            println!("data blocks:      {}", map.number_of_data_blocks());
            println!("allocated bytes:  {}", stats.allocated_memory);
            println!("data bytes:       {}", stats.data_size);
            println!("compressed bytes: {}", stats.compressed_data_size);
            println!("external bytes:   {}", stats.external_data_size);
            false
        }
    };
    Ok(mutated)
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,basaltkv=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .codec(args.codec)
        .max_block_size(args.block_size)
        .max_index_block_size(args.block_size)
        .build();

    let map = match SortedMap::load(config) {
        Ok(map) => map,
        Err(e) => {
            tracing::error!("Failed to load map: {}", e);
            process::exit(1);
        }
    };

    match run(&map, args.command) {
        Ok(true) => {
            if let Err(e) = map.snapshot() {
                tracing::error!("Failed to write snapshot: {}", e);
                process::exit(1);
            }
        }
        Ok(false) => {}
        Err(e) => {
            eprintln!("(error) {}", e);
            process::exit(1);
        }
    }
}
