// Interactive stdin console
//
//   add <path> [group]   publish a file (metadata from <path>.dpmd if present)
//   status               print stats as JSON
//   help
//   quit | exit

use crate::node::{Node, FILE_GROUP};
use anyhow::{Context, Result};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

const FILE_OBJECT_ID: &str = "sigActObjId";

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Add { path: PathBuf, group: Option<String> },
    Status,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let mut tokens = line.split_whitespace();
        let Some(cmd) = tokens.next() else {
            return Command::Empty;
        };

        match cmd.to_ascii_lowercase().as_str() {
            "quit" | "exit" => Command::Quit,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "add" => match tokens.next() {
                Some(path) => Command::Add {
                    path: PathBuf::from(path),
                    group: tokens.next().map(str::to_string),
                },
                None => Command::Unknown(line.trim().to_string()),
            },
            _ => Command::Unknown(line.trim().to_string()),
        }
    }
}

/// How the console loop ended
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleExit {
    Quit,
    Eof,
}

/// Read a file to publish, plus its `<path>.dpmd` sidecar as metadata text
pub fn load_file(path: &Path) -> Result<(Vec<u8>, String)> {
    let payload =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".dpmd");
    let sidecar = PathBuf::from(sidecar);
    let metadata = if sidecar.exists() {
        std::fs::read_to_string(&sidecar)
            .with_context(|| format!("Failed to read {}", sidecar.display()))?
    } else {
        String::new()
    };

    Ok((payload, metadata))
}

fn prompt() {
    print!("> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn print_help() {
    println!("{}", "Commands:".bold());
    println!("  {} <path> [group]", "add".bright_green());
    println!("  {}", "status".bright_green());
    println!("  {}", "quit".bright_green());
}

pub async fn run(node: Arc<Node>) -> Result<ConsoleExit> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    prompt();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match Command::parse(&line) {
            Command::Quit => return Ok(ConsoleExit::Quit),
            Command::Empty => {}
            Command::Help => print_help(),
            Command::Status => match node.stats_json() {
                Ok(json) => println!("{}", json),
                Err(e) => println!("{} {}", "✗".red(), e),
            },
            Command::Add { path, group } => match load_file(&path) {
                Ok((payload, metadata)) => {
                    let group = group.as_deref().unwrap_or(FILE_GROUP);
                    let id = node.add_message(group, FILE_OBJECT_ID, "instId", &metadata, payload);
                    println!("{} Added {} as {}", "✓".green(), path.display(), id.bright_cyan());
                }
                Err(e) => println!("{} {:#}", "✗".red(), e),
            },
            Command::Unknown(input) => {
                println!("{} Unknown command: {}", "?".yellow(), input);
                print_help();
            }
        }
        prompt();
    }

    Ok(ConsoleExit::Eof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("quit"), Command::Quit);
        assert_eq!(Command::parse("  EXIT "), Command::Quit);
        assert_eq!(Command::parse("status"), Command::Status);
        assert_eq!(Command::parse(""), Command::Empty);
        assert_eq!(
            Command::parse("add /tmp/img.png"),
            Command::Add {
                path: PathBuf::from("/tmp/img.png"),
                group: None
            }
        );
        assert_eq!(
            Command::parse("add data.bin sigact"),
            Command::Add {
                path: PathBuf::from("data.bin"),
                group: Some("sigact".to_string())
            }
        );
        assert_eq!(Command::parse("add"), Command::Unknown("add".to_string()));
        assert_eq!(Command::parse("frobnicate"), Command::Unknown("frobnicate".to_string()));
    }

    #[test]
    fn test_load_file_with_sidecar() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("track.bin");
        std::fs::write(&data, [1u8, 2, 3]).unwrap();
        std::fs::write(dir.path().join("track.bin.dpmd"), "lat=1\nlon=2\n").unwrap();

        let (payload, metadata) = load_file(&data).unwrap();
        assert_eq!(payload, vec![1, 2, 3]);
        assert_eq!(metadata, "lat=1\nlon=2\n");
    }

    #[test]
    fn test_load_file_without_sidecar() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("plain.txt");
        std::fs::write(&data, "hello").unwrap();

        let (payload, metadata) = load_file(&data).unwrap();
        assert_eq!(payload, b"hello");
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(load_file(&dir.path().join("nope")).is_err());
    }
}
