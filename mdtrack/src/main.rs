use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use mdtrack::agenda::AgendaRange;
use mdtrack::config::Config;
use mdtrack::core::{Absolute, LineRange, Task};
use mdtrack::engine::Direction;
use mdtrack::projectors::agenda_projector;
use mdtrack::session::{Commit, FixedClock, Mutation, Outcome, Session, SystemClock};
use mdtrack::storage::{DocumentRepository, FsRepository};
use mdtrack::{ArchiveStore, logging};

#[derive(Debug, Parser)]
#[command(
    name = "mdtrack",
    about = "Project and task tracking in a markdown document",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Configuration file to use instead of discovering mdtrack.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse a document and print its derived structure.
    Parse(ReadArgs),

    /// List the sections of a document with their line ranges.
    Sections(FileArg),

    /// List every task with its line and annotations.
    Tasks(ReadArgs),

    /// List open tasks with a due date.
    Agenda(AgendaArgs),

    /// Mark a task completed (or open again with --undo).
    Toggle(ToggleArgs),

    /// Move a section before another line.
    Move(RelocateArgs),

    /// Copy a section before another line.
    Duplicate(RelocateArgs),

    /// Move a task block within its run of sibling tasks.
    Reorder(ReorderArgs),

    /// Move a section into the archive document.
    ArchiveSection(RangeArgs),

    /// Move an archived entry back into the document.
    Restore(RangeArgs),

    /// Move task blocks into the archive document.
    ArchiveTasks(ArchiveTasksArgs),

    /// List the entries of the archive document.
    Archived(FileArg),
}

impl Commands {
    fn file(&self) -> &Path {
        match self {
            Commands::Parse(a) | Commands::Tasks(a) => &a.file,
            Commands::Sections(a) | Commands::Archived(a) => &a.file,
            Commands::Agenda(a) => &a.file,
            Commands::Toggle(a) => &a.file,
            Commands::Move(a) | Commands::Duplicate(a) => a.file(),
            Commands::Reorder(a) => &a.file,
            Commands::ArchiveSection(a) | Commands::Restore(a) => &a.file,
            Commands::ArchiveTasks(a) => &a.file,
        }
    }
}

#[derive(Debug, Args)]
struct FileArg {
    /// Markdown document to operate on.
    file: PathBuf,
}

#[derive(Debug, Args)]
struct ReadArgs {
    /// Markdown document to read.
    file: PathBuf,
    /// Emit JSON instead of a human-readable listing.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    file: PathBuf,
    /// Inclusive start date filter (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive end date filter (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    file: PathBuf,
    /// Zero-based line of the task.
    #[arg(long)]
    line: usize,
    /// Reopen the task instead of completing it.
    #[arg(long)]
    undo: bool,
}

#[derive(Debug, Args)]
struct RangeArgs {
    file: PathBuf,
    /// First line of the block (zero-based, inclusive).
    #[arg(long)]
    start: usize,
    /// Last line of the block (zero-based, inclusive).
    #[arg(long)]
    end: usize,
}

#[derive(Debug, Args)]
struct RelocateArgs {
    #[command(flatten)]
    range: RangeArgs,
    /// Insert before this line of the original document (0 = top).
    #[arg(long)]
    to: usize,
}

impl RelocateArgs {
    fn file(&self) -> &Path {
        &self.range.file
    }
}

#[derive(Debug, Args)]
struct ReorderArgs {
    file: PathBuf,
    /// Zero-based line of the task.
    #[arg(long)]
    line: usize,
    #[arg(long, value_enum)]
    direction: DirectionArg,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DirectionArg {
    Up,
    Down,
    Top,
    Bottom,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Up => Direction::Up,
            DirectionArg::Down => Direction::Down,
            DirectionArg::Top => Direction::Top,
            DirectionArg::Bottom => Direction::Bottom,
        }
    }
}

#[derive(Debug, Args)]
struct ArchiveTasksArgs {
    file: PathBuf,
    /// Zero-based task lines; repeat for several tasks.
    #[arg(long = "line", required = true)]
    lines: Vec<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::discover(cli.command.file())?,
    };
    logging::init(if cli.verbose {
        "mdtrack=debug"
    } else {
        config.log_filter.as_str()
    });

    match cli.command {
        Commands::Parse(args) => handle_parse(args, &config),
        Commands::Sections(args) => handle_sections(args, &config),
        Commands::Tasks(args) => handle_tasks(args, &config),
        Commands::Agenda(args) => handle_agenda(args, &config),
        Commands::Toggle(args) => handle_toggle(args, &config),
        Commands::Move(args) => handle_relocate(args, false, &config),
        Commands::Duplicate(args) => handle_relocate(args, true, &config),
        Commands::Reorder(args) => handle_reorder(args, &config),
        Commands::ArchiveSection(args) => handle_archive_section(args, &config),
        Commands::Restore(args) => handle_restore(args, &config),
        Commands::ArchiveTasks(args) => handle_archive_tasks(args, &config),
        Commands::Archived(args) => handle_archived(args, &config),
    }
}

fn open(file: &Path, config: &Config) -> Result<(FsRepository, Session)> {
    let repo = FsRepository::new(file, &config.archive_suffix);
    let (active, archive) = repo.load()?;
    let session = match config.date {
        Some(date) => Session::with_clock(active, archive, FixedClock(date)),
        None => Session::with_clock(active, archive, SystemClock),
    };
    Ok((repo, session))
}

/// Apply one mutation against the freshly loaded revision and save both files.
fn commit(
    file: &Path,
    config: &Config,
    build: impl FnOnce(&Session) -> Result<Mutation>,
) -> Result<Commit> {
    let (repo, mut session) = open(file, config)?;
    let mutation = build(&session)?;
    let op = mutation.name();
    let commit = session
        .apply(session.revision(), mutation)
        .with_context(|| format!("{op} on {:?}", file))?;
    repo.save(session.active(), session.archive())?;
    Ok(commit)
}

fn handle_parse(args: ReadArgs, config: &Config) -> Result<()> {
    let (_, session) = open(&args.file, config)?;
    let view = session.view();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        println!("{:#?}", view);
    }
    Ok(())
}

fn handle_sections(args: FileArg, config: &Config) -> Result<()> {
    let (_, session) = open(&args.file, config)?;
    for section in session.view().sections {
        let title = match &section.heading {
            Some(h) => format!("{} {}", "#".repeat(h.level as usize), h.text),
            None => "(preamble)".to_string(),
        };
        println!("{:>5}..={:<5} {}", section.start_line, section.end_line, title);
    }
    Ok(())
}

fn handle_tasks(args: ReadArgs, config: &Config) -> Result<()> {
    let (_, session) = open(&args.file, config)?;
    let view = session.view();
    let tasks = view.tasks();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    for task in tasks {
        println!("{}", describe_task(task));
    }
    Ok(())
}

fn describe_task(task: &Task) -> String {
    let mut line = format!(
        "{:>5} [{}] {}",
        task.line_index,
        task.checkbox().marker(),
        task.text
    );
    if let Some(alias) = &task.assignee_alias {
        line.push_str(&format!(" @{alias}"));
    }
    if let Some(due) = task.due_date {
        line.push_str(&format!(" due {due}"));
    }
    if let Some(cost) = &task.cost {
        line.push_str(&format!(" {cost}"));
    }
    if !task.updates.is_empty() {
        line.push_str(&format!(" ({} updates)", task.updates.len()));
    }
    if let Some(project) = &task.project_title {
        line.push_str(&format!("  [{project}]"));
    }
    line
}

fn handle_agenda(args: AgendaArgs, config: &Config) -> Result<()> {
    let (_, session) = open(&args.file, config)?;
    let today = session.today();
    let range = match (args.from, args.to) {
        (None, None) => None,
        (from, to) => Some(AgendaRange {
            from: from.unwrap_or(NaiveDate::MIN),
            to: to.unwrap_or(NaiveDate::MAX),
        }),
    };
    let view = session.view();
    let items = agenda_projector::project_tasks(view.tasks(), range, today);
    if items.is_empty() {
        eprintln!("No due tasks found.");
        return Ok(());
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for item in items {
            let flag = if item.overdue { "OVERDUE" } else { "" };
            println!("{} {:<7} {:>5} {}", item.due, flag, item.line_index, item.text);
        }
    }
    Ok(())
}

fn handle_toggle(args: ToggleArgs, config: &Config) -> Result<()> {
    let commit = commit(&args.file, config, |_| {
        Ok(Mutation::ToggleTask {
            line: Absolute(args.line),
            completed: !args.undo,
        })
    })?;
    if let Some(task) = commit.view.task_at(Absolute(args.line)) {
        println!("{}", describe_task(task));
    }
    Ok(())
}

fn handle_relocate(args: RelocateArgs, duplicate: bool, config: &Config) -> Result<()> {
    let range = LineRange::new(args.range.start, args.range.end);
    let destination = Absolute(args.to);
    commit(args.file(), config, |_| {
        Ok(if duplicate {
            Mutation::DuplicateSection { range, destination }
        } else {
            Mutation::MoveSection { range, destination }
        })
    })?;
    Ok(())
}

fn handle_reorder(args: ReorderArgs, config: &Config) -> Result<()> {
    commit(&args.file, config, |_| {
        Ok(Mutation::ReorderTask {
            line: Absolute(args.line),
            direction: args.direction.into(),
        })
    })?;
    Ok(())
}

fn handle_archive_section(args: RangeArgs, config: &Config) -> Result<()> {
    let range = LineRange::new(args.start, args.end);
    let commit = commit(&args.file, config, |session| {
        let project = session
            .view()
            .project_at(Absolute(range.start))
            .map(|p| p.title.clone());
        Ok(Mutation::ArchiveSection { range, project })
    })?;
    print_outcome(&commit.outcome);
    Ok(())
}

fn handle_restore(args: RangeArgs, config: &Config) -> Result<()> {
    let range = LineRange::new(args.start, args.end);
    let commit = commit(&args.file, config, |_| Ok(Mutation::RestoreSection { range }))?;
    print_outcome(&commit.outcome);
    Ok(())
}

fn handle_archive_tasks(args: ArchiveTasksArgs, config: &Config) -> Result<()> {
    let lines = args.lines.iter().copied().map(Absolute).collect();
    let commit = commit(&args.file, config, |_| Ok(Mutation::ArchiveTasks { lines }))?;
    print_outcome(&commit.outcome);
    Ok(())
}

fn handle_archived(args: FileArg, config: &Config) -> Result<()> {
    let (_, session) = open(&args.file, config)?;
    let store = ArchiveStore::new(session.archive().clone());
    let entries = store.entries();
    if entries.is_empty() {
        eprintln!("Archive is empty.");
        return Ok(());
    }
    for entry in entries {
        let first = store.document().line(entry.range.start).unwrap_or("");
        println!(
            "{:>5}..={:<5} {} {:<16} {}",
            entry.range.start,
            entry.range.end,
            entry.archived_on,
            entry.project_title.as_deref().unwrap_or("-"),
            first
        );
    }
    Ok(())
}

fn print_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Edited => {}
        Outcome::Archived(entries) => {
            for range in entries {
                println!("archived at {}..={}", range.start, range.end);
            }
        }
        Outcome::Restored(range) => println!("restored at {}..={}", range.start, range.end),
    }
}
