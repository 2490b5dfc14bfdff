use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::util::{self, EntryKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Dir {
        files: BTreeMap<String, Node>,
    },
    Link {
        link: String,
    },
    File {
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        executable: bool,
        #[serde(default, skip_serializing_if = "is_false")]
        unpacked: bool,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Parsed header plus the absolute offset where file bodies begin.
#[derive(Debug)]
pub struct Header {
    pub root: BTreeMap<String, Node>,
    pub data_offset: u64,
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let slice = bytes
        .get(at..at + 4)
        .with_context(|| format!("Archive truncated at byte {at}"))?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice);
    Ok(u32::from_le_bytes(buf))
}

pub fn parse_header(bytes: &[u8]) -> Result<Header> {
    if read_u32(bytes, 0)? != 4 {
        bail!("Invalid archive: unexpected size pickle");
    }
    let header_len = read_u32(bytes, 4)? as usize;
    let header = bytes
        .get(8..8 + header_len)
        .context("Invalid archive: header extends past end of file")?;
    let json_len = read_u32(header, 4)? as usize;
    let json = header
        .get(8..8 + json_len)
        .context("Invalid archive: header string extends past header")?;

    let root: Node =
        serde_json::from_slice(json).context("Invalid archive: header is not valid JSON")?;
    match root {
        Node::Dir { files } => Ok(Header {
            root: files,
            data_offset: 8 + header_len as u64,
        }),
        _ => bail!("Invalid archive: header root is not a directory"),
    }
}

pub fn encode_header(root: &BTreeMap<String, Node>) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(&Node::Dir {
        files: root.clone(),
    })
    .context("Failed to serialize archive header")?;
    let padded = (json.len() + 3) & !3;
    let header_len = 8 + padded;

    let mut out = Vec::with_capacity(8 + header_len);
    out.extend_from_slice(&4u32.to_le_bytes());
    out.extend_from_slice(&(header_len as u32).to_le_bytes());
    out.extend_from_slice(&((4 + padded) as u32).to_le_bytes());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&json);
    out.resize(8 + header_len, 0);
    Ok(out)
}

struct FileJob {
    relative: PathBuf,
    offset: u64,
    size: u64,
    executable: bool,
    unpacked: bool,
}

struct LinkJob {
    parent: Vec<String>,
    name: String,
    target: Vec<String>,
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        bail!("Invalid archive entry name: {name:?}");
    }
    Ok(())
}

fn split_link(link: &str) -> Result<Vec<String>> {
    let parts: Vec<String> = link
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != ".")
        .map(str::to_string)
        .collect();
    if parts.is_empty() || parts.iter().any(|p| p == "..") {
        bail!("Invalid archive link target: {link:?}");
    }
    Ok(parts)
}

fn collect(
    nodes: &BTreeMap<String, Node>,
    prefix: &mut Vec<String>,
    dirs: &mut Vec<PathBuf>,
    files: &mut Vec<FileJob>,
    links: &mut Vec<LinkJob>,
) -> Result<()> {
    for (name, node) in nodes {
        check_name(name)?;
        match node {
            Node::Dir { files: children } => {
                prefix.push(name.clone());
                dirs.push(prefix.iter().collect());
                collect(children, prefix, dirs, files, links)?;
                prefix.pop();
            }
            Node::File {
                size,
                offset,
                executable,
                unpacked,
            } => {
                let offset = match (offset, unpacked) {
                    (_, true) => 0,
                    (Some(raw), false) => raw
                        .parse::<u64>()
                        .with_context(|| format!("Invalid offset {raw:?} for {name}"))?,
                    (None, false) => bail!("Archive entry {name} has no offset"),
                };
                files.push(FileJob {
                    relative: prefix.iter().chain(std::iter::once(name)).collect(),
                    offset,
                    size: *size,
                    executable: *executable,
                    unpacked: *unpacked,
                });
            }
            Node::Link { link } => links.push(LinkJob {
                parent: prefix.clone(),
                name: name.clone(),
                target: split_link(link)?,
            }),
        }
    }
    Ok(())
}

/// Extract `archive` into `dest`, creating `dest` if needed.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let data = util::mmap_file(archive)?;
    let header = parse_header(&data)
        .with_context(|| format!("Failed to read archive header: {}", archive.display()))?;

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut links = Vec::new();
    collect(&header.root, &mut Vec::new(), &mut dirs, &mut files, &mut links)?;

    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;
    for dir in &dirs {
        let full = dest.join(dir);
        fs::create_dir_all(&full)
            .with_context(|| format!("Failed to create directory: {}", full.display()))?;
    }

    let unpacked_root = unpacked_dir(archive);
    let base = header.data_offset;
    files.par_iter().try_for_each(|job| -> Result<()> {
        let full = dest.join(&job.relative);
        if job.unpacked {
            let source = unpacked_root.join(&job.relative);
            fs::copy(&source, &full).with_context(|| {
                format!("Failed to copy unpacked file: {}", source.display())
            })?;
        } else {
            let start = (base + job.offset) as usize;
            let body = data
                .get(start..start + job.size as usize)
                .with_context(|| {
                    format!("Archive body out of range for {}", job.relative.display())
                })?;
            fs::write(&full, body)
                .with_context(|| format!("Failed to write file: {}", full.display()))?;
        }
        if job.executable {
            set_executable(&full)?;
        }
        Ok(())
    })?;

    for link in &links {
        let at: PathBuf = link.parent.iter().collect::<PathBuf>().join(&link.name);
        create_link(&dest.join(&at), &relative_to(&link.parent, &link.target))?;
    }

    debug!(
        archive = %archive.display(),
        dirs = dirs.len(),
        files = files.len(),
        links = links.len(),
        "extracted archive"
    );
    Ok(())
}

/// Pack the tree under `src` into a new archive at `archive`.
pub fn pack(src: &Path, archive: &Path) -> Result<()> {
    let entries = util::walk_directory(src)?;

    let mut root: BTreeMap<String, Node> = BTreeMap::new();
    let mut bodies: Vec<PathBuf> = Vec::new();
    let mut offset = 0u64;

    for entry in &entries {
        let node = match entry.kind {
            EntryKind::Dir => Node::Dir {
                files: BTreeMap::new(),
            },
            EntryKind::File => {
                let node = Node::File {
                    size: entry.size,
                    offset: Some(offset.to_string()),
                    executable: entry.executable,
                    unpacked: false,
                };
                offset += entry.size;
                bodies.push(entry.full_path.clone());
                node
            }
            EntryKind::Symlink => {
                let target = fs::read_link(&entry.full_path).with_context(|| {
                    format!("Failed to read link: {}", entry.full_path.display())
                })?;
                let parent = &entry.components[..entry.components.len() - 1];
                let resolved = resolve_link(parent, &target).with_context(|| {
                    format!(
                        "Symlink {} -> {} escapes the packed tree",
                        entry.full_path.display(),
                        target.display()
                    )
                })?;
                Node::Link {
                    link: resolved.join("/"),
                }
            }
        };
        insert(&mut root, &entry.components, node)?;
    }

    let header = encode_header(&root)?;
    let file = fs::File::create(archive)
        .with_context(|| format!("Failed to create archive: {}", archive.display()))?;
    let mut out = BufWriter::with_capacity(256 * 1024, file);
    out.write_all(&header)?;
    for body in &bodies {
        let mut input = fs::File::open(body)
            .with_context(|| format!("Failed to open file: {}", body.display()))?;
        std::io::copy(&mut input, &mut out)
            .with_context(|| format!("Failed to append file: {}", body.display()))?;
    }
    out.flush()
        .with_context(|| format!("Failed to write archive: {}", archive.display()))?;

    debug!(
        archive = %archive.display(),
        entries = entries.len(),
        bytes = offset,
        "packed archive"
    );
    Ok(())
}

fn insert(root: &mut BTreeMap<String, Node>, components: &[String], node: Node) -> Result<()> {
    let Some((name, parents)) = components.split_last() else {
        bail!("Cannot insert the archive root");
    };
    let mut dir = root;
    for parent in parents {
        dir = match dir.entry(parent.clone()).or_insert_with(|| Node::Dir {
            files: BTreeMap::new(),
        }) {
            Node::Dir { files } => files,
            _ => bail!("{parent} is both a file and a directory"),
        };
    }
    if matches!(node, Node::Dir { .. }) {
        dir.entry(name.clone()).or_insert(node);
    } else {
        dir.insert(name.clone(), node);
    }
    Ok(())
}

/// Resolve a link found in `parent` to components relative to the tree root.
fn resolve_link(parent: &[String], target: &Path) -> Result<Vec<String>> {
    let mut resolved: Vec<String> = parent.to_vec();
    for component in target.components() {
        match component {
            Component::Normal(part) => resolved.push(
                part.to_str()
                    .context("Non-UTF8 link target")?
                    .to_string(),
            ),
            Component::CurDir => {}
            Component::ParentDir => {
                if resolved.pop().is_none() {
                    bail!("link leaves the tree root");
                }
            }
            Component::RootDir | Component::Prefix(_) => bail!("absolute link target"),
        }
    }
    if resolved.is_empty() {
        bail!("link points at the tree root");
    }
    Ok(resolved)
}

/// Path to `target` as seen from the directory `from`, both relative to the same root.
fn relative_to(from: &[String], target: &[String]) -> PathBuf {
    let common = from
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut path = PathBuf::new();
    for _ in common..from.len() {
        path.push("..");
    }
    for part in &target[common..] {
        path.push(part);
    }
    path
}

/// Sibling directory holding entries flagged `unpacked`.
pub fn unpacked_dir(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".unpacked");
    PathBuf::from(name)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)
        .with_context(|| format!("Failed to mark executable: {}", path.display()))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_link(at: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, at)
        .with_context(|| format!("Failed to create link: {}", at.display()))
}

#[cfg(not(unix))]
fn create_link(at: &Path, target: &Path) -> Result<()> {
    tracing::warn!(
        link = %at.display(),
        target = %target.display(),
        "symlinks are not recreated on this platform"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (rel, content) in files {
            let full = root.join(rel);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
    }

    #[test]
    fn test_pack_then_extract_preserves_entry_script() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        write_tree(
            &src,
            &[
                ("package.json", br#"{"name":"demo","main":"build/main.js"}"#),
                ("build/main.js", b"require('./app');\nconsole.log('boot');\n"),
                ("build/app.js", b"module.exports = 42;\n"),
                ("assets/empty.txt", b""),
            ],
        );
        let archive = temp.path().join("app.asar");
        pack(&src, &archive).unwrap();

        let out = temp.path().join("out");
        extract(&archive, &out).unwrap();
        assert_eq!(
            fs::read(out.join("build/main.js")).unwrap(),
            fs::read(src.join("build/main.js")).unwrap()
        );
        assert_eq!(fs::read(out.join("build/app.js")).unwrap(), b"module.exports = 42;\n");
        assert!(out.join("assets/empty.txt").exists());
    }

    #[test]
    fn test_header_layout() {
        let mut root = BTreeMap::new();
        root.insert(
            "a.txt".to_string(),
            Node::File {
                size: 3,
                offset: Some("0".to_string()),
                executable: false,
                unpacked: false,
            },
        );
        let bytes = encode_header(&root).unwrap();
        assert_eq!(read_u32(&bytes, 0).unwrap(), 4);
        let header_len = read_u32(&bytes, 4).unwrap() as usize;
        assert_eq!(bytes.len(), 8 + header_len);
        assert_eq!(header_len % 4, 0);
        assert_eq!(read_u32(&bytes, 8).unwrap() as usize, header_len - 4);

        let parsed = parse_header(&bytes).unwrap();
        assert_eq!(parsed.data_offset, bytes.len() as u64);
        assert!(matches!(parsed.root["a.txt"], Node::File { size: 3, .. }));
    }

    #[test]
    fn test_extract_reads_unpacked_entries() {
        let temp = tempfile::tempdir().unwrap();
        let mut root = BTreeMap::new();
        root.insert(
            "native.node".to_string(),
            Node::File {
                size: 4,
                offset: None,
                executable: false,
                unpacked: true,
            },
        );
        let archive = temp.path().join("app.asar");
        fs::write(&archive, encode_header(&root).unwrap()).unwrap();
        write_tree(&unpacked_dir(&archive), &[("native.node", b"\x7fELF")]);

        let out = temp.path().join("out");
        extract(&archive, &out).unwrap();
        assert_eq!(fs::read(out.join("native.node")).unwrap(), b"\x7fELF");
    }

    #[test]
    fn test_extract_rejects_traversal() {
        let temp = tempfile::tempdir().unwrap();
        let mut root = BTreeMap::new();
        root.insert(
            "..".to_string(),
            Node::Dir {
                files: BTreeMap::new(),
            },
        );
        let archive = temp.path().join("evil.asar");
        fs::write(&archive, encode_header(&root).unwrap()).unwrap();

        let err = extract(&archive, &temp.path().join("out")).unwrap_err();
        assert!(err.to_string().contains("Invalid archive entry name"));
    }

    #[test]
    fn test_extract_rejects_garbage() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("garbage.asar");
        fs::write(&archive, b"not an archive at all").unwrap();
        assert!(extract(&archive, &temp.path().join("out")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_internal_symlink_round_trips() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        write_tree(&src, &[("node_modules/pkg/cli.js", b"#!/usr/bin/env node\n")]);
        fs::create_dir_all(src.join("node_modules/.bin")).unwrap();
        std::os::unix::fs::symlink("../pkg/cli.js", src.join("node_modules/.bin/pkg")).unwrap();

        let archive = temp.path().join("app.asar");
        pack(&src, &archive).unwrap();
        let out = temp.path().join("out");
        extract(&archive, &out).unwrap();

        let link = out.join("node_modules/.bin/pkg");
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("../pkg/cli.js"));
        assert_eq!(fs::read(&link).unwrap(), b"#!/usr/bin/env node\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_escaping_symlink_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        write_tree(&src, &[("index.js", b"")]);
        std::os::unix::fs::symlink("../../outside", src.join("escape")).unwrap();

        let err = pack(&src, &temp.path().join("app.asar")).unwrap_err();
        assert!(format!("{err:#}").contains("escapes the packed tree"));
    }

    #[test]
    fn test_relative_to() {
        let from = vec!["node_modules".to_string(), ".bin".to_string()];
        let target = vec![
            "node_modules".to_string(),
            "pkg".to_string(),
            "cli.js".to_string(),
        ];
        assert_eq!(relative_to(&from, &target), PathBuf::from("../pkg/cli.js"));
        assert_eq!(relative_to(&[], &target), PathBuf::from("node_modules/pkg/cli.js"));
    }
}
