use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};
use std::thread;

use thumper::config::Config;
use thumper::media::discovery::collect_import_paths;
use thumper::{logging, ExportFlags, ImageRef, ImageStore, ListingFormat, TaskUpdate};

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    Version,
    Import { paths: Vec<PathBuf> },
    List { include_deleted: bool },
    Search { tags: Vec<String> },
    Tags,
    Tag { tag: String, ids: Vec<i64> },
    Untag { tag: String, ids: Vec<i64> },
    Delete { ids: Vec<i64> },
    Restore { ids: Vec<i64> },
    Purge,
    Dupes { max_distance: Option<u32> },
    Export { dir: PathBuf, size: u32, pad: bool, ids: Vec<i64> },
    Listing { path: PathBuf, include_deleted: bool },
    Reencode { ids: Vec<i64> },
    RebuildMetadata,
}

#[derive(Debug)]
struct Cli {
    config_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    command: Command,
}

fn parse_ids(values: &[String]) -> Result<Vec<i64>> {
    values
        .iter()
        .map(|v| v.parse::<i64>().with_context(|| format!("invalid image id: {}", v)))
        .collect()
}

fn take_value(args: &[String], i: &mut usize, name: &str) -> Result<String> {
    *i += 1;
    args.get(*i).cloned().ok_or_else(|| anyhow!("{} requires an argument", name))
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config_path = None;
    let mut db_path = None;
    let mut include_deleted = false;
    let mut pad = false;
    let mut size = 256;
    let mut max_distance = None;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => positional.insert(0, "help".into()),
            "--version" | "-V" => positional.insert(0, "version".into()),
            "--config" | "-c" => config_path = Some(PathBuf::from(take_value(args, &mut i, "--config")?)),
            "--db" | "-d" => db_path = Some(PathBuf::from(take_value(args, &mut i, "--db")?)),
            "--all" | "-a" => include_deleted = true,
            "--pad" => pad = true,
            "--size" | "-s" => {
                size = take_value(args, &mut i, "--size")?.parse().context("--size must be a number")?;
            }
            "--max-distance" | "-m" => {
                let value = take_value(args, &mut i, "--max-distance")?;
                max_distance = Some(value.parse().context("--max-distance must be a number")?);
            }
            flag if flag.starts_with('-') && flag.len() > 1 => bail!("unknown argument: {}", flag),
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let (name, rest) = match positional.split_first() {
        Some((name, rest)) => (name.as_str(), rest),
        None => ("help", &[][..]),
    };

    let command = match name {
        "help" => Command::Help,
        "version" => Command::Version,
        "import" => {
            if rest.is_empty() {
                bail!("import needs at least one file or directory");
            }
            Command::Import {
                paths: rest.iter().map(PathBuf::from).collect(),
            }
        }
        "list" => Command::List { include_deleted },
        "search" => Command::Search { tags: rest.to_vec() },
        "tags" => Command::Tags,
        "tag" | "untag" => {
            let (tag, ids) = rest
                .split_first()
                .ok_or_else(|| anyhow!("{} needs a tag and image ids", name))?;
            let ids = parse_ids(ids)?;
            if name == "tag" {
                Command::Tag { tag: tag.clone(), ids }
            } else {
                Command::Untag { tag: tag.clone(), ids }
            }
        }
        "delete" => Command::Delete { ids: parse_ids(rest)? },
        "restore" => Command::Restore { ids: parse_ids(rest)? },
        "purge" => Command::Purge,
        "dupes" => Command::Dupes { max_distance },
        "export" => {
            let (dir, ids) = rest
                .split_first()
                .ok_or_else(|| anyhow!("export needs an output directory"))?;
            Command::Export {
                dir: PathBuf::from(dir),
                size,
                pad,
                ids: parse_ids(ids)?,
            }
        }
        "listing" => {
            let path = rest.first().ok_or_else(|| anyhow!("listing needs an output file"))?;
            Command::Listing {
                path: PathBuf::from(path),
                include_deleted,
            }
        }
        "reencode" => Command::Reencode { ids: parse_ids(rest)? },
        "rebuild-metadata" => Command::RebuildMetadata,
        other => bail!("unknown command: {}", other),
    };

    Ok(Cli {
        config_path,
        db_path,
        command,
    })
}

fn print_help() {
    println!(
        r#"thumper - image catalogue with tags, duplicate detection and thumbnails

USAGE:
    thumper [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    import PATH...              Add image files (directories are walked)
    list [--all]                List images, newest first
    search TAG...               Images carrying every tag
    tags                        Tag histogram
    tag TAG ID...               Add a tag
    untag TAG ID...             Remove a tag
    delete ID...                Soft-delete images
    restore ID...               Undo a soft delete
    purge                       Permanently remove soft-deleted images
    dupes [--max-distance N]    Group near-duplicate images
    export DIR [ID...]          Write PNG renditions (--size N, --pad)
    listing FILE [--all]        Write a .json or .csv catalogue listing
    reencode [ID...]            Convert non-JPEG images to JPEG
    rebuild-metadata            Recompute metadata and clear thumbnails

OPTIONS:
    --config, -c PATH   Path to config file
    --db, -d PATH       Database file (overrides config)
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    THUMPER_CONFIG      Path to config file (overrides default location)
    THUMPER_LOG         Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/thumper/config.toml"#
    );
}

fn print_images(images: &[ImageRef]) {
    for image in images {
        let dims = match (image.width, image.height) {
            (Some(w), Some(h)) => format!("{}x{}", w, h),
            _ => "?".to_string(),
        };
        let tags: Vec<&str> = image.tags.iter().map(String::as_str).collect();
        println!(
            "{}\t{}\t{}\t{}\t{}{}",
            image.id,
            dims,
            image.format.as_deref().unwrap_or("?"),
            image.byte_size.unwrap_or(0),
            tags.join(","),
            if image.deleted { "\t(deleted)" } else { "" }
        );
    }
}

/// Explicit ids, or every live image when none were given.
fn ids_or_all(store: &ImageStore, ids: Vec<i64>) -> Vec<i64> {
    if ids.is_empty() {
        store.list_all(false).iter().map(|i| i.id).collect()
    } else {
        ids
    }
}

fn import(store: &Arc<ImageStore>, config: &Config, paths: &[PathBuf]) -> Result<()> {
    let files = collect_import_paths(paths, &config.import.image_extensions);
    println!("Importing {} files", files.len());

    let mut pending = Vec::new();
    for path in files {
        match std::fs::read(&path) {
            Ok(data) => {
                let url = format!("file://{}", path.display());
                pending.push(store.submit_image(url, data));
            }
            Err(e) => eprintln!("{}: {}", path.display(), e),
        }
    }

    let mut imported = 0;
    for rx in pending {
        match rx.recv() {
            Ok((_, Ok(_))) => imported += 1,
            Ok((url, Err(e))) => eprintln!("{}: {}", url, e),
            Err(_) => eprintln!("import worker went away"),
        }
    }
    println!("Imported {} images ({} in catalogue)", imported, store.len());
    Ok(())
}

fn rebuild_metadata(store: &ImageStore) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));

    let printer = thread::spawn(move || {
        for update in rx {
            match update {
                TaskUpdate::Started { total } => println!("Rebuilding metadata for {} images", total),
                TaskUpdate::Progress(p) if p.current == p.total || p.current % 100 == 0 => {
                    println!("  {}/{} ({}%)", p.current, p.total, p.percent())
                }
                TaskUpdate::Completed { message } => println!("{}", message),
                TaskUpdate::Cancelled => println!("Cancelled"),
                TaskUpdate::Failed { error } => eprintln!("Failed: {}", error),
                TaskUpdate::Progress(_) => {}
            }
        }
    });

    let result = store.rebuild_metadata(Some(tx), cancel);
    let _ = printer.join();
    result?;
    Ok(())
}

fn run(store: &Arc<ImageStore>, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Help | Command::Version => {}
        Command::Import { paths } => import(store, config, &paths)?,
        Command::List { include_deleted } => print_images(&store.list_all(include_deleted)),
        Command::Search { tags } => print_images(&store.search(&tags)),
        Command::Tags => {
            for (tag, count) in store.tag_frequency(None) {
                println!("{}\t{}", count, tag);
            }
        }
        Command::Tag { tag, ids } => {
            println!("Tagged {} images", store.add_tag(&ids, &tag)?.len());
        }
        Command::Untag { tag, ids } => {
            println!("Untagged {} images", store.remove_tag(&ids, &tag)?.len());
        }
        Command::Delete { ids } => {
            println!("Deleted {} images", store.set_deleted(&ids, true)?.len());
        }
        Command::Restore { ids } => {
            println!("Restored {} images", store.set_deleted(&ids, false)?.len());
        }
        Command::Purge => println!("Purged {} images", store.purge_deleted()?.len()),
        Command::Dupes { max_distance } => {
            let max = max_distance.unwrap_or(config.duplicates.max_distance);
            let clusters = store.find_duplicates(None, max);
            for cluster in &clusters {
                let ids: Vec<String> = cluster.iter().map(|id| id.to_string()).collect();
                println!("{}", ids.join(" "));
            }
            println!("{} duplicate groups", clusters.len());
        }
        Command::Export { dir, size, pad, ids } => {
            let ids = ids_or_all(store, ids);
            let flags = ExportFlags { pad_to_fit: pad };
            let written = store.export_to_disk(&ids, &dir, size, flags)?;
            println!("Exported {} of {} images to {}", written, ids.len(), dir.display());
        }
        Command::Listing { path, include_deleted } => {
            let format = ListingFormat::from_path(&path)
                .ok_or_else(|| anyhow!("listing file must end in .json or .csv"))?;
            let count = store.export_listing(&path, format, include_deleted)?;
            println!("Wrote {} entries to {}", count, path.display());
        }
        Command::Reencode { ids } => {
            let ids = ids_or_all(store, ids);
            println!("Re-encoded {} images", store.reencode_to_jpeg(&ids)?);
        }
        Command::RebuildMetadata => rebuild_metadata(store)?,
    }

    store.sync().context("committing changes")?;
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            print_help();
            std::process::exit(2);
        }
    };

    match cli.command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("thumper {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let config = Config::load(cli.config_path.as_deref())?;
    let mut store_config = config.store_config();
    if let Some(db_path) = cli.db_path {
        store_config.db_path = db_path;
    }

    let _ = logging::init(&store_config.db_path);

    let db_path = store_config.db_path.clone();
    let store = Arc::new(
        ImageStore::open(store_config)
            .with_context(|| format!("opening catalogue {}", db_path.display()))?,
    );
    let result = run(&store, &config, cli.command);
    store.shutdown();
    result
}
