use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Error};
use clap::Parser;

use pkgfile::{query, update};
use pkgfile_datastore::repo_index::DEFAULT_REPO_CHUNK_BYTES;
use pkgfile_datastore::CacheStore;

#[derive(Parser)]
#[command(
    name = "pkgfile",
    version,
    about = "Find which package owns a file in pacman-style repositories"
)]
struct Args {
    /// Update the file databases (pass twice to force a refetch)
    #[arg(short, long, action = clap::ArgAction::Count)]
    update: u8,

    /// List files of the given package
    #[arg(short, long, conflicts_with = "update")]
    list: bool,

    /// Search for packages owning the target (default)
    #[arg(short, long, conflicts_with_all = ["update", "list"])]
    search: bool,

    /// Interpret the target as a regular expression
    #[arg(short, long)]
    regex: bool,

    /// Interpret the target as a shell glob
    #[arg(short, long, conflicts_with = "regex")]
    glob: bool,

    /// Match case insensitively
    #[arg(short, long)]
    ignorecase: bool,

    /// List entries in standard binary directories only
    #[arg(short, long)]
    binaries: bool,

    /// Match directory entries as well
    #[arg(short, long)]
    directories: bool,

    /// List bare file names without the repo/package prefix
    #[arg(short, long)]
    quiet: bool,

    /// Print matched files with package version, aligned
    #[arg(short, long)]
    verbose: bool,

    /// Disable column alignment
    #[arg(short = 'w', long)]
    raw: bool,

    /// Configuration file
    #[arg(long, value_name = "PATH", default_value = "/etc/pacman.conf")]
    config: PathBuf,

    /// Cache directory
    #[arg(long, value_name = "PATH", default_value = "/var/cache/pkgfile")]
    cachedir: PathBuf,

    /// Read databases from an alternate directory (search and list only)
    #[arg(short = 'D', value_name = "DIR")]
    dbpath: Option<PathBuf>,

    /// Target chunk size for database files written during update
    #[arg(long, value_name = "N")]
    repochunkbytes: Option<u64>,

    #[arg(value_name = "TARGET")]
    target: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    match run(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1), // no matches, nothing to report
        Err(err) => {
            eprintln!("error: {:#}", err);
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<bool, Error> {
    let config = pkgfile_config::config_from_file(&args.config)?;

    if args.update > 0 {
        run_update(args, &config)?;
        return Ok(true);
    }

    let target = match args.target {
        Some(ref target) => target.as_str(),
        None => bail!("no target specified (use --help for usage)"),
    };

    let cachedir = args.dbpath.as_ref().unwrap_or(&args.cachedir);
    let store = CacheStore::new(cachedir);

    let options = query::QueryOptions {
        case_insensitive: args.ignorecase,
        use_glob: args.glob,
        use_regex: args.regex,
        match_directories: args.directories,
        verbose: args.verbose,
        quiet: args.quiet,
        raw: args.raw,
        binaries: args.binaries,
    };

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let matched = if args.list {
        query::list(&store, &config, target, &options, &mut out)?
    } else {
        query::search(&store, &config, target, &options, &mut out)?
    };
    out.flush()?;

    Ok(matched)
}

fn run_update(args: &Args, config: &pkgfile_config::Config) -> Result<(), Error> {
    let options = update::UpdateOptions {
        force: args.update > 1,
        chunk_bytes: args.repochunkbytes.unwrap_or(DEFAULT_REPO_CHUNK_BYTES),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        tokio::select! {
            result = update::run_update(config, &args.cachedir, &options) => result,
            result = shutdown_signal() => {
                result?;
                // outstanding fetches are dropped, leftover staging files
                // get swept on the next update
                bail!("update interrupted");
            }
        }
    })
}

async fn shutdown_signal() -> Result<(), Error> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        _ = sigterm.recv() => Ok(()),
    }
}
