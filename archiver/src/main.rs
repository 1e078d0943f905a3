use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use archiver::commands::{Archiver, CommandOutcome};
use archiver::format::format_lines;
use archiver::parser::parse_document;
use archiver::settings::Settings;
use archiver::storage::{DocumentStore, FsDocumentStore};
use archiver::tasks::ExtractionDepth;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "archiver",
    about = "Archive finished tasks and restructure markdown notes",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Settings JSON (plugin data.json layout). Defaults apply when omitted.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Directory that note paths are relative to.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse a note and print its section tree.
    Parse(ParseArgs),

    /// Reformat notes; only misaligned indentation changes.
    Format(FormatArgs),

    /// Move finished tasks under the archive heading.
    Archive(TaskArgs),

    /// Delete finished tasks.
    Delete(TaskArgs),

    /// Archive the heading around a line, with everything nested under it.
    ArchiveHeading(CursorArgs),

    /// Archive the list item on a line, with its sub-items.
    ArchiveListItem(CursorArgs),

    /// Sort the list around a line: other items, open tasks, finished tasks.
    SortList(CursorArgs),

    /// Turn the list around a line into headings.
    ListToHeadings(CursorArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    file: PathBuf,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct TaskArgs {
    file: PathBuf,
    /// Also pick up finished tasks nested inside other list items.
    #[arg(long)]
    deep: bool,
}

impl TaskArgs {
    fn depth(&self) -> ExtractionDepth {
        if self.deep {
            ExtractionDepth::Deep
        } else {
            ExtractionDepth::Shallow
        }
    }
}

#[derive(Debug, Args)]
struct CursorArgs {
    file: PathBuf,
    /// Cursor line, 1-based.
    #[arg(long)]
    line: usize,
}

impl CursorArgs {
    fn cursor(&self) -> usize {
        self.line.saturating_sub(1)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let mut stdout = std::io::stdout().lock();
    run(cli, &mut stdout)
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "archiver=debug"
    } else {
        "archiver=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli, out: &mut impl Write) -> Result<()> {
    let Cli {
        settings,
        root,
        command,
        ..
    } = cli;
    let archiver = Archiver::new(load_settings(settings.as_deref())?);
    let mut store = FsDocumentStore::new(root);

    let outcome: CommandOutcome = match command {
        Commands::Parse(args) => return handle_parse(args, &store, &archiver.settings, out),
        Commands::Format(args) => return handle_format(args, &mut store, &archiver, out),
        Commands::Archive(args) => archiver.archive_tasks(&mut store, &args.file, args.depth())?,
        Commands::Delete(args) => archiver.delete_tasks(&mut store, &args.file, args.depth())?,
        Commands::ArchiveHeading(args) => {
            archiver.archive_heading_under_cursor(&mut store, &args.file, args.cursor())?
        }
        Commands::ArchiveListItem(args) => {
            archiver.archive_list_item_under_cursor(&mut store, &args.file, args.cursor())?
        }
        Commands::SortList(args) => {
            archiver.sort_list_under_cursor(&mut store, &args.file, args.cursor())?
        }
        Commands::ListToHeadings(args) => {
            archiver.list_to_headings(&mut store, &args.file, args.cursor())?
        }
    };
    tracing::debug!(changed = outcome.changed, "command finished");
    writeln!(out, "{}", outcome.message)?;
    Ok(())
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

fn read_document(store: &FsDocumentStore, path: &Path) -> Result<Vec<String>> {
    store
        .read_lines(path)
        .with_context(|| format!("reading {:?}", path))?
        .with_context(|| format!("{:?} does not exist under {:?}", path, store.root))
}

fn handle_parse(
    args: ParseArgs,
    store: &FsDocumentStore,
    settings: &Settings,
    out: &mut impl Write,
) -> Result<()> {
    let ParseArgs { file, json } = args;
    let lines = read_document(store, &file)?;
    let root = parse_document(&lines, &settings.indentation);
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&root)?)?;
    } else {
        writeln!(out, "{:#?}", root)?;
    }
    Ok(())
}

fn handle_format(
    args: FormatArgs,
    store: &mut FsDocumentStore,
    archiver: &Archiver,
    out: &mut impl Write,
) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    for (idx, path) in inputs.iter().enumerate() {
        if in_place {
            let outcome = archiver.format(store, path)?;
            writeln!(out, "{}: {}", path.display(), outcome.message)?;
            continue;
        }

        let lines = read_document(store, path)?;
        let formatted = format_lines(&lines, &archiver.settings.indentation);
        if inputs.len() > 1 {
            if idx > 0 {
                writeln!(out)?;
            }
            writeln!(out, "== {} ==", path.display())?;
        }
        writeln!(out, "{}", formatted.join("\n"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::fs;

    fn cli(root: &Path, args: &[&str]) -> Cli {
        let mut argv = vec![OsString::from("archiver"), "--root".into(), root.into()];
        argv.extend(args.iter().map(OsString::from));
        Cli::try_parse_from(argv).expect("valid arguments")
    }

    fn run_to_string(cli: Cli) -> Result<String> {
        let mut out = Vec::new();
        run(cli, &mut out)?;
        Ok(String::from_utf8(out).expect("utf8 output"))
    }

    #[test]
    fn archive_rewrites_the_note() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let note = tmp.path().join("note.md");
        fs::write(&note, "- [x] foo\n- [ ] bar\n# Archived").expect("write note");

        let printed = run_to_string(cli(tmp.path(), &["archive", "note.md"])).expect("run");
        assert_eq!(printed, "Archived 1 task\n");
        assert_eq!(
            fs::read_to_string(&note).expect("read note"),
            "- [ ] bar\n# Archived\n\n- [x] foo\n"
        );
    }

    #[test]
    fn settings_file_is_honored() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = tmp.path().join("data.json");
        fs::write(
            &settings,
            r#"{ "archiveHeading": "Done", "addNewlinesAroundHeadings": false }"#,
        )
        .expect("write settings");
        fs::write(tmp.path().join("note.md"), "- [x] a").expect("write note");

        let settings = settings.to_str().expect("utf8 path");
        run_to_string(cli(tmp.path(), &["--settings", settings, "archive", "note.md"]))
            .expect("run");
        assert_eq!(
            fs::read_to_string(tmp.path().join("note.md")).expect("read"),
            "# Done\n- [x] a"
        );
    }

    #[test]
    fn invalid_settings_are_rejected_before_touching_notes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = tmp.path().join("data.json");
        fs::write(&settings, r#"{ "additionalTaskPattern": "([" }"#).expect("write settings");
        fs::write(tmp.path().join("note.md"), "- [x] a").expect("write note");

        let settings = settings.to_str().expect("utf8 path");
        let err = run_to_string(cli(tmp.path(), &["--settings", settings, "archive", "note.md"]))
            .expect_err("bad pattern");
        assert!(format!("{err:#}").contains("additionalTaskPattern"));
        assert_eq!(
            fs::read_to_string(tmp.path().join("note.md")).expect("read"),
            "- [x] a"
        );
    }

    #[test]
    fn cursor_lines_are_one_based() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("note.md"), "title\n- [x] a\n- [ ] b").expect("write note");

        let printed =
            run_to_string(cli(tmp.path(), &["sort-list", "note.md", "--line", "2"])).expect("run");
        assert_eq!(printed, "Sorted list\n");
        assert_eq!(
            fs::read_to_string(tmp.path().join("note.md")).expect("read"),
            "title\n- [ ] b\n- [x] a"
        );

        let printed =
            run_to_string(cli(tmp.path(), &["sort-list", "note.md", "--line", "1"])).expect("run");
        assert_eq!(printed, "No list under cursor\n");
    }

    #[test]
    fn parse_emits_json_tree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("note.md"), "# Heading\n- item").expect("write note");

        let printed =
            run_to_string(cli(tmp.path(), &["parse", "note.md", "--json"])).expect("run");
        let value: serde_json::Value = serde_json::from_str(&printed).expect("json");
        assert_eq!(value["token_level"], 0);
        assert_eq!(value["children"][0]["text"], "Heading");
        assert_eq!(value["children"][0]["block_content"]["children"][0]["text"], "- item");
    }

    #[test]
    fn format_prints_unless_in_place() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = tmp.path().join("data.json");
        fs::write(&settings, r#"{ "indentation": { "useTab": false, "tabSize": 2 } }"#)
            .expect("write settings");
        fs::write(tmp.path().join("note.md"), "- a\n - b").expect("write note");
        let settings = settings.to_str().expect("utf8 path");

        let printed = run_to_string(cli(tmp.path(), &["--settings", settings, "format", "note.md"]))
            .expect("run");
        assert_eq!(printed, "- a\n  - b\n");
        assert_eq!(
            fs::read_to_string(tmp.path().join("note.md")).expect("read"),
            "- a\n - b"
        );

        let printed = run_to_string(cli(
            tmp.path(),
            &["--settings", settings, "format", "note.md", "--in-place"],
        ))
        .expect("run");
        assert_eq!(printed, "note.md: Formatted document\n");
        assert_eq!(
            fs::read_to_string(tmp.path().join("note.md")).expect("read"),
            "- a\n  - b"
        );
    }

    #[test]
    fn missing_note_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(run_to_string(cli(tmp.path(), &["archive", "absent.md"])).is_err());
        assert!(run_to_string(cli(tmp.path(), &["parse", "absent.md"])).is_err());
    }
}
