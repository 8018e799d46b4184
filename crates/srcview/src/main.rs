// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::exit;

use anyhow::{Context, bail};
use argh::FromArgs;
use tmlang::highlight::Highlighter;
use tmlang::rules::RawLanguage;

use srcview::pages::scope_class;
use srcview::reclaim::{CachePaths, reclaim};
use srcview::render::render_archive;
use srcview::search::{read_metadata_file, search_rendered};

#[derive(FromArgs, Debug)]
#[argh(description = "Renders source trees into a browsable, searchable static site")]
struct Command {
    #[argh(subcommand)]
    sub: SubCommands,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum SubCommands {
    Render(SubCommandRender),
    Search(SubCommandSearch),
    Reclaim(SubCommandReclaim),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "render", description = "Render an unpacked source tree into the cache")]
struct SubCommandRender {
    #[argh(positional, description = "unpacked source tree")]
    tree: PathBuf,
    #[argh(option, description = "cache directory", default = "PathBuf::from(\"cache\")")]
    out: PathBuf,
    #[argh(option, description = "directory of .tmLanguage.json grammars")]
    grammars: Option<PathBuf>,
    #[argh(option, description = "archive name (defaults to the tree's directory name)")]
    name: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "search", description = "Search a rendered archive")]
struct SubCommandSearch {
    #[argh(positional, description = "archive name")]
    name: String,
    #[argh(positional, description = "query string")]
    query: String,
    #[argh(option, description = "cache directory", default = "PathBuf::from(\"cache\")")]
    out: PathBuf,
    #[argh(option, description = "only search files whose path matches this regex")]
    filter: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "reclaim", description = "Delete old archives until the cache is small enough")]
struct SubCommandReclaim {
    #[argh(option, description = "cache directory", default = "PathBuf::from(\"cache\")")]
    out: PathBuf,
    #[argh(option, description = "stop reclaiming under this many bytes", default = "5_000_000_000")]
    low: u64,
    #[argh(option, description = "start reclaiming over this many bytes", default = "10_000_000_000")]
    high: u64,
}

pub fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("{e:#}");
        exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let command: Command = argh::from_env();
    match command.sub {
        SubCommands::Render(cmd) => render(cmd),
        SubCommands::Search(cmd) => search(cmd),
        SubCommands::Reclaim(cmd) => {
            if cmd.low >= cmd.high {
                bail!("the low water mark must be below the high water mark");
            }
            let cache = CachePaths::new(&cmd.out);
            for archive in reclaim(&cache, cmd.low, cmd.high)? {
                println!("reclaimed {archive}");
            }
            Ok(())
        }
    }
}

fn load_grammars(dir: Option<&Path>) -> anyhow::Result<Vec<RawLanguage>> {
    let Some(dir) = dir else { return Ok(Vec::new()) };
    let mut paths: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("reading grammar directory {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .collect();
    paths.sort();
    let mut languages = Vec::new();
    for path in paths {
        let json = fs::read_to_string(&path)?;
        let language = RawLanguage::from_json(&json)
            .with_context(|| format!("parsing grammar {}", path.display()))?;
        log::debug!("loaded grammar {}", language.scope_name);
        languages.push(language);
    }
    Ok(languages)
}

fn render(cmd: SubCommandRender) -> anyhow::Result<()> {
    let name = match &cmd.name {
        Some(name) => name.clone(),
        None => cmd
            .tree
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string()),
    };
    let languages = load_grammars(cmd.grammars.as_deref())?;
    let highlighter = Highlighter::new(&languages, scope_class)?;
    let cache = CachePaths::new(&cmd.out);
    let summary = render_archive(&cmd.tree, &cache, &name, &highlighter)?;

    log::info!("rendered {} files and {} directories", summary.files, summary.directories);
    let out_root = cache.root.join(&name);
    if summary.initial_directory.is_empty() {
        println!("start browsing at {}/", out_root.display());
    } else {
        println!("start browsing at {}/{}/", out_root.display(), summary.initial_directory);
    }
    Ok(())
}

fn search(cmd: SubCommandSearch) -> anyhow::Result<()> {
    let cache = CachePaths::new(&cmd.out);
    let (metadata, index) = read_metadata_file(&cache.metadata_path(&cmd.name))
        .with_context(|| format!("no rendered archive named {}", cmd.name))?;
    let filter = match &cmd.filter {
        Some(filter) => Some(regex::Regex::new(filter).context("bad --filter regex")?),
        None => None,
    };
    let results = search_rendered(
        &cache.root,
        &metadata.archive_path,
        &index,
        &cmd.query,
        filter.as_ref(),
    );
    let mut stdout = std::io::stdout().lock();
    for result in &results {
        writeln!(stdout, "{}:{} ({} lines)", result.file, result.first_line, result.lines)?;
        stdout.write_all(result.html.as_bytes())?;
        writeln!(stdout)?;
    }
    if results.is_empty() {
        println!("no results found");
    }
    Ok(())
}
