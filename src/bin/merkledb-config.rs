use std::convert::TryFrom;
use std::path::PathBuf;
use structopt::StructOpt;
use merkledb::config::{Config, StorageBackend};
use merkledb::storage::trie::BranchFactor;
use merkledb::init_logger;
use log::{info, error};

#[derive(Debug, StructOpt)]
#[structopt(name = "merkledb-config", about = "merkledb configuration tool")]
struct Opt {
    /// Generate a default configuration
    #[structopt(long)]
    generate: bool,

    /// Output file
    #[structopt(long, parse(from_os_str))]
    output: Option<PathBuf>,

    /// Input file to validate and print
    #[structopt(long, parse(from_os_str))]
    input: Option<PathBuf>,

    /// Branch factor (2, 4, 16 or 256)
    #[structopt(long)]
    branch_factor: Option<u32>,

    /// Number of committed roots kept in history
    #[structopt(long)]
    history_length: Option<usize>,

    /// Storage backend (memory, rocksdb)
    #[structopt(long)]
    backend: Option<String>,

    /// Database path
    #[structopt(long)]
    db_path: Option<String>,

    /// Maximum keys per range or change proof
    #[structopt(long)]
    max_keys_per_request: Option<usize>,

    /// Disable change proofs during sync
    #[structopt(long)]
    no_change_proofs: bool,
}

fn apply_overrides(config: &mut Config, opt: &Opt) -> Result<(), String> {
    if let Some(branch_factor) = opt.branch_factor {
        config.merkle.branch_factor = BranchFactor::try_from(branch_factor).map_err(|e| e.to_string())?;
    }

    if let Some(history_length) = opt.history_length {
        config.merkle.history_length = history_length;
    }

    if let Some(backend) = &opt.backend {
        config.storage.backend = match backend.as_str() {
            "memory" => StorageBackend::Memory,
            "rocksdb" => StorageBackend::Rocksdb,
            other => return Err(format!("Unknown backend: {}", other)),
        };
    }

    if let Some(db_path) = &opt.db_path {
        config.storage.db_path = db_path.clone();
    }

    if let Some(max_keys) = opt.max_keys_per_request {
        config.sync.max_keys_per_request = max_keys;
    }

    if opt.no_change_proofs {
        config.sync.use_change_proofs = false;
    }

    config.validate().map_err(|e| e.to_string())
}

fn print_config(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(config_str) => println!("{}", config_str),
        Err(e) => {
            error!("Failed to serialize configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn main() {
    init_logger();

    let opt = Opt::from_args();

    if opt.generate {
        let mut config = Config::default();
        if let Err(e) = apply_overrides(&mut config, &opt) {
            error!("Invalid option: {}", e);
            std::process::exit(1);
        }

        if let Some(output) = &opt.output {
            match config.save(output) {
                Ok(_) => info!("Configuration saved to {:?}", output),
                Err(e) => {
                    error!("Failed to save configuration: {}", e);
                    std::process::exit(1);
                }
            }
        } else {
            print_config(&config);
        }
    } else if let Some(input) = &opt.input {
        match Config::load(input) {
            Ok(config) => print_config(&config),
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        if let Err(e) = Opt::clap().print_help() {
            error!("Failed to print help: {}", e);
        }
        println!();
    }
}
