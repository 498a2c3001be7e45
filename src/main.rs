use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use orange_tasks::core::config::{StoreConfig, DB_PATH_ENV, DEFAULT_DB_PATH};
use orange_tasks::{SnapshotCodec, SqliteStore, TaskId, TaskRecord, TaskState, TaskStore};
use sanitize_filename::sanitize;
use std::path::PathBuf;
use url::Url;

fn id_arg() -> Arg {
    Arg::new("id")
        .help("Task id")
        .required(true)
        .value_parser(value_parser!(TaskId))
}

fn transition(name: &'static str, about: &'static str) -> Command {
    Command::new(name).about(about).arg(id_arg())
}

fn build_cli() -> Command {
    let add = Command::new("add")
        .about("Register a new download task")
        .arg(Arg::new("url").help("Source URL").required(true))
        .arg(
            Arg::new("dir")
                .long("dir")
                .help("Destination directory")
                .default_value("./downloads")
                .num_args(1),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .help("File name (derived from the URL when omitted)")
                .num_args(1),
        )
        .arg(
            Arg::new("total")
                .long("total")
                .help("Expected size in bytes")
                .value_parser(value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("resumable")
                .long("resumable")
                .help("Origin supports resuming partial downloads")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("tag")
                .long("tag")
                .help("Validator reported by the origin (ETag or Last-Modified)")
                .num_args(1),
        );

    let list = Command::new("list")
        .about("List tasks")
        .arg(Arg::new("url").long("url").help("Only tasks for this source URL").num_args(1))
        .arg(
            Arg::new("active")
                .long("active")
                .help("Only tasks that are not completed or cancelled")
                .action(ArgAction::SetTrue)
                .conflicts_with_all(["finished", "url"]),
        )
        .arg(
            Arg::new("finished")
                .long("finished")
                .help("Only completed tasks")
                .action(ArgAction::SetTrue)
                .conflicts_with("url"),
        );

    let progress = Command::new("progress")
        .about("Record received bytes for a running task")
        .arg(id_arg())
        .arg(
            Arg::new("bytes")
                .help("Bytes received since the last update")
                .required(true)
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("total")
                .long("total")
                .help("Size reported by the origin")
                .value_parser(value_parser!(u64))
                .num_args(1),
        );

    let fail = Command::new("fail")
        .about("Mark a running task as failed")
        .arg(id_arg())
        .arg(
            Arg::new("code")
                .help("Error code")
                .required(true)
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i32)),
        );

    let export = Command::new("export")
        .about("Write a task snapshot to a file")
        .arg(id_arg())
        .arg(Arg::new("file").help("Output file").required(true));

    let import = Command::new("import")
        .about("Decode a snapshot file and print it")
        .arg(Arg::new("file").help("Snapshot file").required(true));

    Command::new("orange-tasks")
        .about("Persistent download task records")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("db")
                .long("db")
                .help("Task database file")
                .env(DB_PATH_ENV)
                .default_value(DEFAULT_DB_PATH)
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("max_connections")
                .long("max-connections")
                .help("SQLite pool size")
                .default_value("5")
                .value_parser(value_parser!(u32))
                .global(true)
                .num_args(1),
        )
        .subcommand(add)
        .subcommand(list)
        .subcommand(Command::new("show").about("Show one task").arg(id_arg()))
        .subcommand(transition("start", "Start a pending task"))
        .subcommand(transition("pause", "Pause a running task"))
        .subcommand(transition("resume", "Resume a paused task"))
        .subcommand(transition("complete", "Mark a running task as completed"))
        .subcommand(transition("cancel", "Cancel a running or paused task"))
        .subcommand(transition(
            "rewind",
            "Discard partial progress of a pending or paused task",
        ))
        .subcommand(progress)
        .subcommand(fail)
        .subcommand(transition("delete", "Remove a task record"))
        .subcommand(export)
        .subcommand(import)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = build_cli().get_matches();

    let config = StoreConfig {
        db_path: arg::<String>(&matches, "db")?.into(),
        max_connections: arg(&matches, "max_connections")?,
    };

    let Some((name, m)) = matches.subcommand() else {
        return Ok(());
    };

    // import works on a file alone and never touches the database
    if name == "import" {
        let file: String = arg(m, "file")?;
        let bytes = tokio::fs::read(&file)
            .await
            .with_context(|| format!("read snapshot {file}"))?;
        let record = SnapshotCodec::decode(&bytes).with_context(|| format!("decode {file}"))?;
        print_record(&record);
        return Ok(());
    }

    let store = SqliteStore::open(&config).await?;

    match name {
        "add" => {
            let url: String = arg(m, "url")?;
            let dir: PathBuf = arg::<String>(m, "dir")?.into();
            let file_name = match m.get_one::<String>("name") {
                Some(n) => n.clone(),
                None => file_name_from_url(&url),
            };
            let total = m.get_one::<u64>("total").copied();

            let mut record = TaskRecord::create(url, dir, file_name, total)?;
            if m.get_flag("resumable") {
                record.set_resumable(true)?;
            }
            if let Some(tag) = m.get_one::<String>("tag") {
                record.set_last_modified_tag(tag.clone())?;
            }
            let record = store.insert(record).await?;
            print_record(&record);
        }
        "list" => {
            let records = if m.get_flag("active") {
                store.list_active().await?
            } else if m.get_flag("finished") {
                store.list_finished().await?
            } else if let Some(url) = m.get_one::<String>("url") {
                store.list_by_source_url(url).await?
            } else {
                store.list_all().await?
            };
            for r in &records {
                print_record(r);
            }
        }
        "show" => {
            let id: TaskId = arg(m, "id")?;
            let record = store.get(id).await?.with_context(|| format!("task {id} not found"))?;
            print_record(&record);
        }
        "start" | "pause" | "complete" | "cancel" => {
            let id: TaskId = arg(m, "id")?;
            let next = match name {
                "start" => TaskState::Running,
                "pause" => TaskState::Paused,
                "complete" => TaskState::Completed,
                _ => TaskState::Cancelled,
            };
            let record = store.modify(id, |r| r.transition_to(next, None)).await?;
            print_record(&record);
        }
        "resume" => {
            let id: TaskId = arg(m, "id")?;
            let record = store.modify(id, |r| r.resume()).await?;
            print_record(&record);
        }
        "rewind" => {
            let id: TaskId = arg(m, "id")?;
            let record = store.modify(id, |r| r.rewind()).await?;
            print_record(&record);
        }
        "progress" => {
            let id: TaskId = arg(m, "id")?;
            let bytes: u64 = arg(m, "bytes")?;
            let total = m.get_one::<u64>("total").copied();
            let record = store
                .modify(id, move |r| {
                    if let Some(t) = total {
                        r.set_total_bytes(t)?;
                    }
                    r.advance_progress(bytes)
                })
                .await?;
            print_record(&record);
        }
        "fail" => {
            let id: TaskId = arg(m, "id")?;
            let code: i32 = arg(m, "code")?;
            let record = store
                .modify(id, |r| r.transition_to(TaskState::Failed, Some(code)))
                .await?;
            print_record(&record);
        }
        "delete" => {
            let id: TaskId = arg(m, "id")?;
            if !store.delete(id).await? {
                anyhow::bail!("task {id} not found");
            }
            println!("deleted {id}");
        }
        "export" => {
            let id: TaskId = arg(m, "id")?;
            let file: String = arg(m, "file")?;
            let record = store.get(id).await?.with_context(|| format!("task {id} not found"))?;
            let bytes = SnapshotCodec::encode(&record);
            tokio::fs::write(&file, &bytes)
                .await
                .with_context(|| format!("write snapshot {file}"))?;
            println!("exported {id} -> {file} ({})", fmt_bytes(bytes.len() as u64));
        }
        _ => {}
    }

    Ok(())
}

fn arg<T: Clone + Send + Sync + 'static>(m: &ArgMatches, name: &str) -> anyhow::Result<T> {
    m.get_one::<T>(name)
        .cloned()
        .with_context(|| format!("missing argument {name}"))
}

fn file_name_from_url(raw: &str) -> String {
    Url::parse(raw)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|s| s.last().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .map(|s| sanitize(&s))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "download.bin".to_string())
}

fn print_record(r: &TaskRecord) {
    let id = r.id().map(|i| i.to_string()).unwrap_or_else(|| "-".to_string());
    let total = r.total_bytes().map(fmt_bytes).unwrap_or_else(|| "?".to_string());
    let mut line = format!(
        "[{id}] {:<9} {} / {} {} -> {}",
        r.state().as_str(),
        fmt_bytes(r.downloaded_bytes()),
        total,
        r.source_url(),
        r.target_path().display()
    );
    if r.resumable() {
        line.push_str(" resumable");
    }
    if !r.last_modified_tag().is_empty() {
        line.push_str(&format!(" tag={}", r.last_modified_tag()));
    }
    if r.state() == TaskState::Failed {
        line.push_str(&format!(" error={}", r.error_code()));
    }
    println!("{line}");
}

fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
