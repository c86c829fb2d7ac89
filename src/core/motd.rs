// src/core/motd.rs

//! Message-of-the-day loader. The file is line-oriented; every non-trivial
//! line is sent to a client when its flow handshake completes.

use std::path::Path;

/// Reads the MOTD file, dropping blank and single-character lines. A missing
/// file is not an error; the greeting is simply empty.
pub fn load(path: &Path) -> std::io::Result<Vec<String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(contents
        .lines()
        .map(str::trim_end)
        .filter(|line| line.trim().len() > 1)
        .map(str::to_string)
        .collect())
}
