//! Pack-file parsing.

use sqsh_error::{Result, SqshError};
use sqsh_tree::{Defaults, FileData, NodeData, NodeSpec, Tree};
use sqsh_types::pack_devno;
use std::path::Path;

/// Parse a `--defaults` option string (`uid=…,gid=…,mode=…,mtime=…`).
pub fn parse_defaults(spec: &str) -> Result<Defaults> {
    let mut defaults = Defaults::default();
    for item in spec.split(',').filter(|s| !s.is_empty()) {
        let (key, value) = item.split_once('=').ok_or_else(|| {
            SqshError::ConfigInvalid(format!("malformed defaults option '{item}'"))
        })?;
        match key {
            "uid" => defaults.uid = parse_number(value, "uid")? as u32,
            "gid" => defaults.gid = parse_number(value, "gid")? as u32,
            "mtime" => defaults.mtime = parse_number(value, "mtime")? as u32,
            "mode" => {
                defaults.mode = u16::from_str_radix(value, 8).map_err(|_| {
                    SqshError::ConfigInvalid(format!("mode '{value}' is not octal"))
                })? & 0o7777;
            }
            _ => {
                return Err(SqshError::ConfigInvalid(format!(
                    "unknown defaults option '{key}'"
                )));
            }
        }
    }
    Ok(defaults)
}

fn parse_number(value: &str, field: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| SqshError::ConfigInvalid(format!("{field} '{value}' is not a number")))
}

fn parse_mode(value: &str, line_no: usize) -> Result<u16> {
    u16::from_str_radix(value, 8)
        .map(|mode| mode & 0o7777)
        .map_err(|_| {
            SqshError::ConfigInvalid(format!("line {line_no}: mode '{value}' is not octal"))
        })
}

/// Parse a pack file's content into the tree.
///
/// `pack_root` is the directory input locations are resolved against; for
/// `file` entries without a location the image path itself is used,
/// relative to `pack_root`.
pub fn parse_pack_file(input: &str, pack_root: &Path, tree: &mut Tree) -> Result<()> {
    for (index, raw_line) in input.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let tokens = tokenize(line, line_no)?;
        let context = |want: usize| -> Result<()> {
            if tokens.len() < want {
                return Err(SqshError::ConfigInvalid(format!(
                    "line {line_no}: '{}' entry needs at least {} fields",
                    tokens[0],
                    want - 1
                )));
            }
            Ok(())
        };

        context(5)?;
        let path = &tokens[1];
        let mode = parse_mode(&tokens[2], line_no)?;
        let uid = parse_number(&tokens[3], "uid")? as u32;
        let gid = parse_number(&tokens[4], "gid")? as u32;

        let data = match tokens[0].as_str() {
            "dir" => NodeData::empty_dir(),
            "file" => {
                let location = if tokens.len() > 5 {
                    pack_root.join(&tokens[5])
                } else {
                    pack_root.join(path.trim_start_matches('/'))
                };
                let size = std::fs::metadata(&location)
                    .map_err(|err| {
                        SqshError::ConfigInvalid(format!(
                            "line {line_no}: cannot stat input '{}': {err}",
                            location.display()
                        ))
                    })?
                    .len();
                NodeData::File(FileData {
                    size,
                    source: Some(location),
                    ..FileData::default()
                })
            }
            "slink" => {
                context(6)?;
                NodeData::Symlink {
                    target: tokens[5].clone(),
                }
            }
            "nod" => {
                context(8)?;
                let major = parse_number(&tokens[6], "major")? as u32;
                let minor = parse_number(&tokens[7], "minor")? as u32;
                let devno = pack_devno(major, minor);
                match tokens[5].as_str() {
                    "b" => NodeData::BlockDev { devno },
                    "c" => NodeData::CharDev { devno },
                    other => {
                        return Err(SqshError::ConfigInvalid(format!(
                            "line {line_no}: device type must be 'b' or 'c', got '{other}'"
                        )));
                    }
                }
            }
            "pipe" => NodeData::Fifo,
            "sock" => NodeData::Socket,
            other => {
                return Err(SqshError::ConfigInvalid(format!(
                    "line {line_no}: unknown entry type '{other}'"
                )));
            }
        };

        tree.insert(
            path,
            NodeSpec {
                permissions: mode,
                uid,
                gid,
                mtime: 0,
                xattrs: Vec::new(),
                data,
            },
        )
        .map_err(|err| SqshError::ConfigInvalid(format!("line {line_no}: {err}")))?;
    }
    Ok(())
}

/// Split one entry line into fields, honoring double quotes and backslash
/// escapes inside them.
fn tokenize(line: &str, line_no: usize) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => in_quotes = false,
            '"' => {
                in_quotes = true;
                in_token = true;
            }
            '\\' if in_quotes => {
                let Some(escaped) = chars.next() else {
                    return Err(SqshError::ConfigInvalid(format!(
                        "line {line_no}: dangling backslash"
                    )));
                };
                current.push(escaped);
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_quotes {
        return Err(SqshError::ConfigInvalid(format!(
            "line {line_no}: unterminated quote"
        )));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}
