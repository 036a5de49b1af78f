#![deny(unused_must_use)]

use std::fs;
use std::io::Read;
use std::process::exit;

use chrono::Utc;
use clap::{App, Arg, ArgMatches};

use zfs_rs::dropboxstore::{DropboxStore};
use zfs_rs::duplication;
use zfs_rs::error::InputError;
use zfs_rs::graphite;
use zfs_rs::inventory::{self, InventoryStore};
use zfs_rs::model::{Dataset, Pool};
use zfs_rs::report::SerializeMode;
use zfs_rs::retention::RetentionPolicy;
use zfs_rs::sender::{self, DestinationMode};
use zfs_rs::store::Store;
use zfs_rs::url::ZFSURL;

fn read_input(value: &str) -> anyhow::Result<String> {
    if value == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(fs::read_to_string(value)?)
    }
}

/// `host|name|size|free|alloc|cap|health|dedup_ratio|version|feature_flags|read_only`,
/// one pool per line (pipe-separated, matching the CLI help for `sync pools`).
fn parse_pools(input: &str) -> anyhow::Result<Vec<Pool>> {
    let mut out = Vec::new();
    for line in input.lines().filter(|l| !l.trim().is_empty()) {
        let f: Vec<&str> = line.split('|').collect();
        if f.len() != 11 {
            return Err(InputError::ParseError(format!("expected 11 fields, got {} in '{line}'", f.len())).into());
        }
        out.push(Pool {
            host: f[0].to_string(),
            name: f[1].to_string(),
            size: f[2].parse()?,
            free: f[3].parse()?,
            alloc: f[4].parse()?,
            cap: f[5].parse()?,
            health: f[6].to_string(),
            dedup_ratio: f[7].parse()?,
            version: f[8].to_string(),
            feature_flags: f[9].to_string(),
            read_only: f[10].parse()?,
            updated_at: Utc::now(),
        });
    }
    Ok(out)
}

/// `host|name|dataset_type|creation_epoch|used|avail|refer|compress_ratio|compression`,
/// one dataset per line (pipe-separated). `avail` may be `-` for a snapshot.
fn parse_datasets(input: &str) -> anyhow::Result<Vec<Dataset>> {
    let mut out = Vec::new();
    for line in input.lines().filter(|l| !l.trim().is_empty()) {
        let f: Vec<&str> = line.split('|').collect();
        if f.len() != 9 {
            return Err(InputError::ParseError(format!("expected 9 fields, got {} in '{line}'", f.len())).into());
        }
        let creation_epoch: i64 = f[3].parse()?;
        out.push(Dataset {
            host: f[0].to_string(),
            name: f[1].to_string(),
            dataset_type: f[2].to_string(),
            creation: chrono::DateTime::<Utc>::from_timestamp(creation_epoch, 0).unwrap_or_else(Utc::now),
            used: f[4].parse()?,
            avail: if f[5] == "-" { None } else { Some(f[5].parse()?) },
            refer: f[6].parse()?,
            compress_ratio: f[7].parse()?,
            quota: None,
            reservation: None,
            usedds: 0,
            usedchild: 0,
            usedsnap: 0,
            compression: f[8].to_string(),
            zfs_priority: None,
            zfs_receive_url: None,
            updated_at: Utc::now(),
        });
    }
    Ok(out)
}

fn cmd_sync(sub: &ArgMatches) -> anyhow::Result<String> {
    let db = sub.value_of("db").unwrap();
    let host = sub.value_of("host").unwrap();
    let input = read_input(sub.value_of("input").unwrap())?;
    let mut store = Store::open(db)?;
    match sub.subcommand() {
        Some(("pools", pool_sub)) => {
            let _ = pool_sub;
            let pools = parse_pools(&input)?;
            let n = pools.len();
            store.sync_pools(host, &pools)?;
            Ok(format!("synced {n} pools for host {host}"))
        }
        Some(("datasets", ds_sub)) => {
            let _ = ds_sub;
            let datasets = parse_datasets(&input)?;
            let n = datasets.len();
            store.sync_datasets(host, &datasets)?;
            Ok(format!("synced {n} datasets for host {host}"))
        }
        _ => unreachable!(),
    }
}

fn cmd_retention(sub: &ArgMatches) -> anyhow::Result<String> {
    let db = sub.value_of("db").unwrap();
    let host = sub.value_of("host").unwrap();
    let name = sub.value_of("dataset").unwrap();
    let policy = RetentionPolicy::parse(sub.value_of("policy").unwrap())?;
    let run_directly = sub.is_present("run-directly");

    let store = Store::open(db)?;
    let ds = store
        .find_dataset(host, name)?
        .ok_or_else(|| anyhow::anyhow!("no dataset {host}/{name} in store"))?;
    let snaps = store.snapshots(&ds)?;
    let samples: Vec<(i64, String)> = snaps.iter().map(|s| (s.creation.timestamp(), s.name.clone())).collect();
    let now = Utc::now().timestamp();
    let (kept, dropped) = policy.filter(now, &samples);

    if dropped.is_empty() {
        return Ok(format!("{} snapshots kept, none eligible for destruction", kept.len()));
    }

    let destroy_cmds: Vec<String> = dropped
        .iter()
        .map(|(_, name)| format!("${{prefix}} sh -c 'zfs destroy {name}'"))
        .collect();
    let script = format!(
        "{}# destroys {} snapshot(s) past their retention window\n{}\n",
        sender::safety_preamble(),
        destroy_cmds.len(),
        destroy_cmds.join("\n")
    );

    if run_directly {
        run_script(&script)
    } else {
        Ok(script)
    }
}

/// Runs an emitted script (safety preamble and all) through `/bin/sh`,
/// passing `DOIT` so the operator's `--run-directly` request actually
/// executes rather than silently dry-running.
fn run_script(script: &str) -> anyhow::Result<String> {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new("/bin/sh")
        .arg("-s")
        .arg("DOIT")
        .stdin(Stdio::piped())
        .spawn()?;
    child.stdin.take().unwrap().write_all(script.as_bytes())?;
    let status = child.wait()?;
    if status.success() {
        Ok("script ran successfully".to_string())
    } else {
        Err(anyhow::anyhow!("script exited with {status}"))
    }
}

fn cmd_send(sub: &ArgMatches) -> anyhow::Result<String> {
    let db = sub.value_of("db").unwrap();
    let source_url = ZFSURL::parse(sub.value_of("source").unwrap())?;
    let store = Store::open(db)?;
    let source = store
        .find_dataset(source_url.host(), &source_url.name())?
        .ok_or_else(|| anyhow::anyhow!("no dataset for {}", source_url))?;

    let mode = match sub.value_of("mode").unwrap_or("auto") {
        "property" => DestinationMode::Property,
        "search" => DestinationMode::Search,
        "configured" => DestinationMode::Configured,
        _ => DestinationMode::Auto,
    };

    let (dest_host, dest_name) = match (sub.value_of("dest-host"), sub.value_of("dest-name")) {
        (Some(h), Some(n)) => (h.to_string(), n.to_string()),
        _ => {
            let resolved = sender::resolve_destination(&store, &source, mode)?
                .ok_or_else(|| anyhow::anyhow!("could not resolve a destination for {}", source.name))?;
            (source.host.clone(), resolved)
        }
    };

    let dest = store.find_dataset(&dest_host, &dest_name)?;
    let plan = sender::plan(&store, &source, &dest_host, &dest_name, dest.as_ref(), source_url.query_fields())?;
    Ok(sender::emit_script(&plan))
}

fn cmd_duplication(sub: &ArgMatches) -> anyhow::Result<String> {
    let db = sub.value_of("db").unwrap();
    let min_copies: usize = sub.value_of("min-copies").unwrap_or("2").parse()?;
    let ignore_smaller_than: u64 = sub.value_of("ignore-smaller-than").unwrap_or("0").parse()?;
    let store = Store::open(db)?;
    let candidates = store.all_filesystems()?;
    let groups = duplication::generate(&store, candidates, min_copies, ignore_smaller_than)?;
    let mut report = duplication::to_report(&groups);
    report.append_aggregate_row();

    let mode = if sub.is_present("csv") { SerializeMode::Csv } else { SerializeMode::Tty };
    let out = report.serialize(mode, true);
    if out.is_empty() {
        Ok("No records found.".to_string())
    } else {
        Ok(out)
    }
}

fn cmd_transaction(sub: &ArgMatches) -> anyhow::Result<String> {
    let db = sub.value_of("db").unwrap();
    let store = DropboxStore::open(db)?;

    match sub.subcommand() {
        Some(("approve", s)) => {
            let id: i64 = s.value_of("id").unwrap().parse()?;
            let login = s.value_of("login").unwrap();
            let mut tr = store.find_transaction(id)?.ok_or_else(|| anyhow::anyhow!("no transaction {id}"))?;
            tr.approved_by_login = Some(login.to_string());
            store.update_transaction(&tr)?;
            Ok(format!("transaction {id} marked approved by {login}"))
        }
        Some(("reject", s)) => {
            let id: i64 = s.value_of("id").unwrap().parse()?;
            let mut tr = store.find_transaction(id)?.ok_or_else(|| anyhow::anyhow!("no transaction {id}"))?;
            tr.approved_by_login = Some(zfs_rs::dropboxstore::REJECTED_MARKER.to_string());
            store.update_transaction(&tr)?;
            Ok(format!("transaction {id} rejected"))
        }
        Some(("cancel", s)) => {
            let id: i64 = s.value_of("id").unwrap().parse()?;
            let mut tr = store.find_transaction(id)?.ok_or_else(|| anyhow::anyhow!("no transaction {id}"))?;
            tr.finished_at = Some(Utc::now());
            tr.comment = s.value_of("reason").map(str::to_string).or(tr.comment);
            store.update_transaction(&tr)?;
            Ok(format!("transaction {id} canceled"))
        }
        Some(("list-files", s)) => {
            let id: i64 = s.value_of("id").unwrap().parse()?;
            let files = store.files_for_transaction(id)?;
            if files.is_empty() {
                return Ok("No records found.".to_string());
            }
            let lines: Vec<String> = files.iter().map(|f| format!("{}\t{}\t{}:{}\t{:o}", f.path, f.size, f.uid, f.gid, f.mode)).collect();
            Ok(lines.join("\n"))
        }
        _ => unreachable!(),
    }
}

fn cmd_fsstat(sub: &ArgMatches) -> anyhow::Result<String> {
    match sub.subcommand() {
        Some(("update", s)) => {
            let mut store = InventoryStore::open(s.value_of("db").unwrap())?;
            let root = std::path::Path::new(s.value_of("root").unwrap());
            let chunk_size: usize = s.value_of("chunk-size").unwrap_or("26214400").parse()?;
            let stats = inventory::crawl(&mut store, root, chunk_size, inventory::DEFAULT_BATCH_RECORDS, inventory::DEFAULT_BATCH_TIME)?;
            Ok(format!("crawled {} files in {} commits", stats.files, stats.commits))
        }
        Some(("fast", s)) => {
            let mut store = InventoryStore::open(s.value_of("db").unwrap())?;
            let chunk_size: usize = s.value_of("chunk-size").unwrap_or("26214400").parse()?;
            let stats = inventory::fast_update(&mut store, chunk_size)?;
            Ok(format!(
                "{} rehashed, {} re-stated, {} marked deleted",
                stats.rehashed, stats.restated, stats.deleted
            ))
        }
        Some(("merge", s)) => {
            let mut dest = InventoryStore::open(s.value_of("db").unwrap())?;
            let src = InventoryStore::open(s.value_of("from").unwrap())?;
            let n = dest.merge_from(&src)?;
            Ok(format!("merged {n} rows"))
        }
        Some(("remove-duplicates", s)) => {
            let store = InventoryStore::open(s.value_of("db").unwrap())?;
            let n = store.dedup()?;
            Ok(format!("removed {n} superseded rows"))
        }
        Some(("with-index", s)) => {
            let store = InventoryStore::open(s.value_of("db").unwrap())?;
            store.create_indices()?;
            Ok("indices created".to_string())
        }
        _ => unreachable!(),
    }
}

fn cmd_graphite(sub: &ArgMatches) -> anyhow::Result<String> {
    let host = sub.value_of("host").unwrap();
    let port: u16 = sub.value_of("port").unwrap().parse()?;
    let input = read_input(sub.value_of("input").unwrap())?;
    let mut samples = Vec::new();
    for line in input.lines().filter(|l| !l.trim().is_empty()) {
        let f: Vec<&str> = line.split(',').collect();
        if f.len() != 3 {
            return Err(InputError::ParseError(format!("expected 'path,timestamp,value', got '{line}'")).into());
        }
        samples.push(graphite::Sample {
            path: f[0].to_string(),
            timestamp: f[1].parse()?,
            value: f[2].parse()?,
        });
    }
    let chunks = graphite::submit(host, port, &samples)?;
    Ok(format!("submitted {} samples in {chunks} chunk(s)", samples.len()))
}

fn db_arg() -> Arg<'static> {
    Arg::new("db").long("db").help("Path to the SQLite database file.").takes_value(true).required(true)
}

fn input_arg() -> Arg<'static> {
    Arg::new("input")
        .long("input")
        .help("Input file, or '-' to read from stdin.")
        .takes_value(true)
        .default_value("-")
}

fn main() {
    let sync = App::new("sync")
        .help("Sync live zpool/zfs state into the relational store (C3).")
        .arg(db_arg())
        .arg(Arg::new("host").long("host").help("Host these rows were sampled from.").takes_value(true).required(true))
        .arg(input_arg())
        .subcommand(App::new("pools").help("Sync pool rows (pipe-separated fields, see source)."))
        .subcommand(App::new("datasets").help("Sync dataset rows (pipe-separated fields, see source)."));

    let retention = App::new("retention")
        .help("Apply a retention policy to a dataset's snapshots (C1).")
        .arg(db_arg())
        .arg(Arg::new("host").long("host").takes_value(true).required(true))
        .arg(Arg::new("dataset").long("dataset").takes_value(true).required(true))
        .arg(Arg::new("policy").long("policy").help("Retention policy string, e.g. '1h:1d,1d:14d'.").takes_value(true).required(true))
        .arg(Arg::new("run-directly").long("run-directly").help("Run destroy commands directly instead of printing them for review."));

    let send = App::new("send")
        .help("Plan and emit a zfs send/receive transport script (C5).")
        .arg(db_arg())
        .arg(Arg::new("source").help("Source zfs:// URL.").index(1).required(true))
        .arg(Arg::new("mode").long("mode").help("auto|search|property|configured").takes_value(true))
        .arg(Arg::new("dest-host").long("dest-host").takes_value(true))
        .arg(Arg::new("dest-name").long("dest-name").takes_value(true));

    let duplication = App::new("duplication")
        .help("Generate the cross-host duplication report (C6).")
        .arg(db_arg())
        .arg(Arg::new("min-copies").long("min-copies").takes_value(true))
        .arg(Arg::new("ignore-smaller-than").long("ignore-smaller-than").takes_value(true))
        .arg(Arg::new("csv").long("csv").help("Serialize as semicolon-separated CSV instead of TTY table."));

    let id_arg = || Arg::new("id").index(1).required(true);
    let transaction = App::new("transaction")
        .help("Inspect and act on dropbox transactions (C9).")
        .arg(db_arg())
        .subcommand(App::new("approve").arg(id_arg()).arg(Arg::new("login").index(2).required(true)))
        .subcommand(App::new("reject").arg(id_arg()))
        .subcommand(App::new("cancel").arg(id_arg()).arg(Arg::new("reason").long("reason").takes_value(true)))
        .subcommand(App::new("list-files").arg(id_arg()));

    let fsstat = App::new("fs-stat")
        .help("Filesystem-inventory crawl, update, merge, and maintenance (C11).")
        .subcommand(
            App::new("update")
                .help("Initial crawl of a root directory.")
                .arg(db_arg())
                .arg(Arg::new("root").index(1).required(true))
                .arg(Arg::new("chunk-size").long("chunk-size").takes_value(true)),
        )
        .subcommand(App::new("fast").help("Fast delta-update against the live filesystem.").arg(db_arg()).arg(Arg::new("chunk-size").long("chunk-size").takes_value(true)))
        .subcommand(App::new("merge").help("Merge another inventory DB's rows into this one.").arg(db_arg()).arg(Arg::new("from").long("from").takes_value(true).required(true)))
        .subcommand(App::new("remove-duplicates").help("Keep only the newest row per path.").arg(db_arg()))
        .subcommand(App::new("with-index").help("Create the path/id index after a bulk load.").arg(db_arg()));

    let graphite_cmd = App::new("graphite")
        .help("Submit gauge samples to a carbon pickle-protocol listener.")
        .subcommand(
            App::new("submit")
                .arg(Arg::new("host").index(1).required(true))
                .arg(Arg::new("port").index(2).required(true))
                .arg(input_arg()),
        );

    let mut main_parser = App::new("zfs-rs")
        .help("Toolkit for ZFS fleet management and dropbox monitoring.")
        .subcommand(sync)
        .subcommand(retention)
        .subcommand(send)
        .subcommand(duplication)
        .subcommand(transaction)
        .subcommand(fsstat)
        .subcommand(graphite_cmd);

    let main_matches = main_parser.get_matches_mut();

    let result: anyhow::Result<String> = match main_matches.subcommand() {
        Some(("sync", sub)) => cmd_sync(sub),
        Some(("retention", sub)) => cmd_retention(sub),
        Some(("send", sub)) => cmd_send(sub),
        Some(("duplication", sub)) => cmd_duplication(sub),
        Some(("transaction", sub)) => cmd_transaction(sub),
        Some(("fs-stat", sub)) => cmd_fsstat(sub),
        Some(("graphite", sub)) => match sub.subcommand() {
            Some(("submit", s)) => cmd_graphite(s),
            _ => unreachable!(),
        },
        None => {
            main_parser.print_long_help().unwrap();
            exit(0);
        }
        _ => unreachable!(),
    };

    match result {
        Ok(reason) => {
            println!("{reason}");
            exit(0);
        }
        Err(reason) => {
            eprintln!("{reason:#}");
            exit(1);
        }
    }
}
