#![forbid(unsafe_code)]

//! Freehold command-line interface: builds and operates a plausibly-deniable
//! storage environment on top of loop devices, MD, and detached-header LUKS.
//!
//! The shell is a thin facade: parse arguments, call one core operation,
//! render the result. All orchestration lives in `freehold-core`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use freehold_core::config::{bootstrap_template, DEFAULT_CONFIG_PATH};
use freehold_core::{logging, Environment, FreeholdConfig, SystemInvoker};
use schemars::schema_for;
use std::path::PathBuf;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "freehold",
    version,
    about = "Plausibly-deniable storage environment manager (pages + MD + detached-header LUKS)."
)]
struct Cli {
    /// Path to the Freehold configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Command groups covering the full lifecycle of the environment.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage backing pages and their loop devices.
    Pages {
        #[command(subcommand)]
        command: PagesCommands,
    },

    /// Manage the striped MD array and its safe-zone.
    Md {
        #[command(subcommand)]
        command: MdCommands,
    },

    /// Manage keyfiles under the hidden key vault.
    Keys {
        #[command(subcommand)]
        command: KeysCommands,
    },

    /// Manage detached LUKS headers under the hidden header vault.
    Headers {
        #[command(subcommand)]
        command: HeadersCommands,
    },

    /// Open or close the plausibly-deniable zone.
    Pde {
        #[command(subcommand)]
        command: PdeCommands,
    },

    /// Show the derived environment state.
    Status,

    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PagesCommands {
    /// Allocate backing pages under the root.
    Create {
        /// Page size in bytes (defaults to data_pagesize).
        #[arg(short = 'd', long)]
        pagesize: Option<u64>,

        /// Maximum number of pages; 0 fills the free space.
        #[arg(short = 'm', long, default_value_t = 0)]
        limit: u64,

        /// Report the plan without writing anything.
        #[arg(long)]
        simulate: bool,
    },

    /// Unlink every backing page (requires deactivation).
    Remove {
        /// Confirm the destructive removal.
        #[arg(long)]
        affirmative: bool,
    },

    /// List pages and their loop devices.
    List,

    /// Attach loop devices for every unattached page.
    Activate,

    /// Detach every loop device.
    Deactivate,
}

#[derive(Subcommand, Debug)]
enum MdCommands {
    /// Create, assemble, or adopt the array from the backing set.
    Start {
        /// Override the MD kernel name for this invocation.
        #[arg(long)]
        device: Option<String>,
    },

    /// Stop the array.
    Stop,

    /// Show the array backing this root, if any.
    Status,

    /// Format the leading region with F2FS and seed innocuous content.
    PopulateSafezone,
}

#[derive(Subcommand, Debug)]
enum KeysCommands {
    /// Generate random keyfiles.
    Create {
        /// Number of keys (defaults to key_count).
        #[arg(long)]
        count: Option<u32>,
    },

    /// Unlink every keyfile.
    Remove {
        /// Confirm the destructive removal.
        #[arg(long)]
        affirmative: bool,
    },

    /// List keys with their MD5 fingerprints.
    List,
}

#[derive(Subcommand, Debug)]
enum HeadersCommands {
    /// Forge fresh keys and one detached header per key.
    Create {
        /// Number of headers (defaults to header_count).
        #[arg(long)]
        count: Option<u32>,
    },

    /// Unlink every header.
    Remove {
        /// Confirm the destructive removal.
        #[arg(long)]
        affirmative: bool,
    },

    /// List header names.
    List,
}

#[derive(Subcommand, Debug)]
enum PdeCommands {
    /// Open the mapping for one header/key/offset tuple.
    Start {
        /// Header name under the header vault.
        #[arg(long)]
        header: String,

        /// Key name under the key vault.
        #[arg(long)]
        key: String,

        /// Byte offset of the key slice inside the keyfile.
        #[arg(long)]
        offset: u64,

        /// Format the mapped device as ext4 for first use.
        #[arg(long)]
        bless: bool,
    },

    /// Close the mapping.
    Stop,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validate a configuration file.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
        file: PathBuf,
    },

    /// Emit a commented starter configuration.
    Template,

    /// Emit the configuration JSON schema.
    Schema,
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

/// Dispatch to the requested subcommand.
fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        return run_config(command);
    }

    let mut config = FreeholdConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    if let Commands::Md {
        command: MdCommands::Start { device: Some(name) },
    } = &cli.command
    {
        config.md_name = name.clone();
    }
    config.ensure_valid()?;

    let env = Environment::new(config, SystemInvoker);
    env.preflight()?;

    match cli.command {
        Commands::Pages { command } => run_pages(&env, command)?,
        Commands::Md { command } => run_md(&env, command)?,
        Commands::Keys { command } => run_keys(&env, command)?,
        Commands::Headers { command } => run_headers(&env, command)?,
        Commands::Pde { command } => run_pde(&env, command)?,
        Commands::Status => {
            let state = env.status()?;
            println!(
                "backing_active={} md_name={} luks_open={}",
                state.backing_active,
                state.md_name.as_deref().unwrap_or("-"),
                state.luks_open
            );
        }
        Commands::Config { .. } => unreachable!("config commands handled above"),
    }

    Ok(())
}

fn run_pages(env: &Environment<SystemInvoker>, command: PagesCommands) -> Result<()> {
    match command {
        PagesCommands::Create {
            pagesize,
            limit,
            simulate,
        } => {
            let allocation = env.pages_create(pagesize, limit, simulate)?;
            let verb = if allocation.simulated {
                "Would create"
            } else {
                "Created"
            };
            println!(
                "{verb} {} page(s) of {} bytes:",
                allocation.pages.len(),
                allocation.page_size
            );
            for page in allocation.pages {
                println!("  {}", page.display());
            }
        }
        PagesCommands::Remove { affirmative } => {
            env.pages_remove(affirmative)?;
            println!("Backing pages removed.");
        }
        PagesCommands::List => {
            let set = env.pages_list()?;
            if set.is_empty() {
                println!("No backing pages.");
            }
            for page in &set.pages {
                println!(
                    "{}\t{}",
                    page.path.display(),
                    page.loop_device.as_deref().unwrap_or("-")
                );
            }
        }
        PagesCommands::Activate => {
            let set = env.pages_activate()?;
            println!("{} page(s) attached.", set.loop_devices().len());
        }
        PagesCommands::Deactivate => {
            let set = env.pages_deactivate()?;
            let remaining = set.loop_devices().len();
            if remaining == 0 {
                println!("All loop devices detached.");
            } else {
                println!("{remaining} loop device(s) still attached; see the log.");
            }
        }
    }
    Ok(())
}

fn run_md(env: &Environment<SystemInvoker>, command: MdCommands) -> Result<()> {
    match command {
        MdCommands::Start { .. } => {
            let array = env.md_start()?;
            println!(
                "Array {} up with {} member(s): {}",
                env.config().md_device().display(),
                array.members.len(),
                array.members.join(", ")
            );
        }
        MdCommands::Stop => {
            env.md_stop()?;
            println!("Array stopped.");
        }
        MdCommands::Status => match env.md_status()? {
            Some(array) => println!(
                "{} ({} member(s): {})",
                array.kernel_name,
                array.members.len(),
                array.members.join(", ")
            ),
            None => println!("No array backed by this root."),
        },
        MdCommands::PopulateSafezone => {
            env.populate_safezone()?;
            println!("Safe-zone formatted and populated.");
        }
    }
    Ok(())
}

fn run_keys(env: &Environment<SystemInvoker>, command: KeysCommands) -> Result<()> {
    match command {
        KeysCommands::Create { count } => {
            let names = env.keys_create(count)?;
            println!("Created {} key(s):", names.len());
            for name in names {
                println!("  {name}");
            }
        }
        KeysCommands::Remove { affirmative } => {
            env.keys_remove(affirmative)?;
            println!("Keys removed.");
        }
        KeysCommands::List => {
            let records = env.keys_list()?;
            if records.is_empty() {
                println!("No keys.");
            }
            for record in records {
                println!("{}\t{}", record.name, record.fingerprint);
            }
        }
    }
    Ok(())
}

fn run_headers(env: &Environment<SystemInvoker>, command: HeadersCommands) -> Result<()> {
    match command {
        HeadersCommands::Create { count } => {
            let records = env.headers_create(count)?;
            println!("Created {} header(s):", records.len());
            println!("HEADER\tKEY\tKEYFILE-OFFSET\tPAYLOAD-OFFSET");
            for record in &records {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.header, record.key, record.keyfile_offset, record.payload_offset
                );
            }
            println!(
                "Record the winning tuple offline; these pairings are not persisted anywhere."
            );
        }
        HeadersCommands::Remove { affirmative } => {
            env.headers_remove(affirmative)?;
            println!("Headers removed.");
        }
        HeadersCommands::List => {
            let names = env.headers_list()?;
            if names.is_empty() {
                println!("No headers.");
            }
            for name in names {
                println!("{name}");
            }
        }
    }
    Ok(())
}

fn run_pde(env: &Environment<SystemInvoker>, command: PdeCommands) -> Result<()> {
    match command {
        PdeCommands::Start {
            header,
            key,
            offset,
            bless,
        } => {
            env.pde_start(&header, &key, offset, bless)?;
            println!(
                "Mapping open at /dev/mapper/{}{}.",
                env.config().mapper_name,
                if bless { " (blessed with ext4)" } else { "" }
            );
        }
        PdeCommands::Stop => {
            env.pde_stop()?;
            println!("Mapping closed.");
        }
    }
    Ok(())
}

fn run_config(command: &ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { file } => {
            let cfg = FreeholdConfig::load(file)
                .with_context(|| format!("failed to load configuration from {}", file.display()))?;
            let issues = cfg.validate();
            if issues.is_empty() {
                println!("Configuration valid (root {}).", cfg.root.display());
            } else {
                eprintln!("Configuration validation failed:");
                for issue in issues {
                    eprintln!("  - {issue}");
                }
                std::process::exit(1);
            }
        }
        ConfigCommands::Template => {
            print!("{}", bootstrap_template());
        }
        ConfigCommands::Schema => {
            let schema = schema_for!(FreeholdConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
    }
    Ok(())
}
