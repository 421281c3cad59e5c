//! System listings for the console sidebar: processes, threads and open sockets.
//!
//! Each listing runs a standard tool (`ps`, `netstat`) and reduces its output to one
//! trimmed entry per row. The parsing half is kept separate so it can be tested
//! without the tools installed.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Processes,
    Threads,
    Sockets,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Processes, Category::Threads, Category::Sockets];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Processes => "processes",
            Category::Threads => "threads",
            Category::Sockets => "sockets",
        }
    }

    fn program(self) -> (&'static str, &'static [&'static str]) {
        match self {
            Category::Processes => ("ps", &["-eo", "pid,comm"]),
            Category::Threads => ("ps", &["-eLo", "pid,tid,comm"]),
            Category::Sockets => ("netstat", &["-tulnp"]),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = IntrospectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| IntrospectError::UnknownCategory(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntrospectError {
    #[error("unknown category '{0}' (expected processes, threads or sockets)")]
    UnknownCategory(String),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed {
        program: &'static str,
        status: std::process::ExitStatus,
    },
}

/// `proto recv-q send-q local foreign [state]`; UDP rows have no state column.
static SOCKET_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?P<proto>tcp6?|udp6?)\s+\d+\s+\d+\s+\S+:\S+\s+\S+(?:\s+(?P<state>[A-Z_0-9]+))?")
        .ok()
});

/// Run the tool for `category` and return its parsed entries.
pub async fn list(category: Category) -> Result<Vec<String>, IntrospectError> {
    let (program, args) = category.program();
    log::debug!(target: "replbridge::introspect", "Listing {} via {}", category, program);

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| IntrospectError::Spawn { program, source })?;
    if !output.status.success() {
        return Err(IntrospectError::Failed {
            program,
            status: output.status,
        });
    }

    Ok(parse(category, &String::from_utf8_lossy(&output.stdout)))
}

pub fn parse(category: Category, output: &str) -> Vec<String> {
    match category {
        Category::Processes | Category::Threads => parse_ps(output),
        Category::Sockets => parse_netstat(output),
    }
}

/// `ps` rows without the header line.
pub fn parse_ps(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// TCP sockets that are listening or established, and every UDP socket.
pub fn parse_netstat(output: &str) -> Vec<String> {
    let Some(pattern) = SOCKET_LINE.as_ref() else {
        return Vec::new();
    };
    output
        .lines()
        .map(str::trim)
        .filter(|line| {
            let Some(caps) = pattern.captures(line) else {
                return false;
            };
            if caps["proto"].starts_with("udp") {
                return true;
            }
            matches!(
                caps.name("state").map(|m| m.as_str()),
                Some("LISTEN" | "ESTABLISHED")
            )
        })
        .map(str::to_string)
        .collect()
}
