//! PAX tar serialization of the staging tree.
//!
//! Entry names are `./`-prefixed with `/` separators. Sub-second atime,
//! ctime and mtime go into a PAX extended header in front of every entry,
//! together with `path`/`linkpath` when they do not fit the ustar fields.

use crate::fs::metadata::{split_ns, FileMetadata};
use crate::fs::walker::{walk_directory_with_callback, FileInfo, WalkOptions};
use nix::unistd::{Gid, Group, Uid, User};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path};
use tar::{Builder, EntryType, Header, HeaderMode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What went into the archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TarSummary {
    pub entries: u64,
    pub bytes: u64,
}

/// Archive name for a path relative to the tree root.
pub fn entry_name(relative: &Path, is_dir: bool) -> String {
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let mut name = format!("./{}", parts.join("/"));
    if is_dir {
        name.push('/');
    }
    name
}

/// PAX time value: seconds with a nanosecond fraction.
fn pax_time(ns: i64) -> String {
    let (secs, nanos) = split_ns(ns);
    if nanos == 0 {
        secs.to_string()
    } else {
        format!("{}.{:09}", secs, nanos)
    }
}

#[derive(Default)]
struct OwnerNames {
    users: HashMap<u32, Option<String>>,
    groups: HashMap<u32, Option<String>>,
}

impl OwnerNames {
    fn user(&mut self, uid: u32) -> Option<&str> {
        self.users
            .entry(uid)
            .or_insert_with(|| {
                User::from_uid(Uid::from_raw(uid))
                    .ok()
                    .flatten()
                    .map(|u| u.name)
            })
            .as_deref()
    }

    fn group(&mut self, gid: u32) -> Option<&str> {
        self.groups
            .entry(gid)
            .or_insert_with(|| {
                Group::from_gid(Gid::from_raw(gid))
                    .ok()
                    .flatten()
                    .map(|g| g.name)
            })
            .as_deref()
    }
}

fn copy_truncated(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len());
    field.fill(0);
    field[..len].copy_from_slice(&bytes[..len]);
}

struct TarWriter<W: Write> {
    builder: Builder<W>,
    owners: OwnerNames,
    summary: TarSummary,
}

impl<W: Write> TarWriter<W> {
    fn append(&mut self, info: &FileInfo) -> io::Result<()> {
        let stat = fs::symlink_metadata(&info.path)?;
        let file_type = stat.file_type();
        if !(file_type.is_file() || file_type.is_dir() || file_type.is_symlink()) {
            debug!("Not archiving special file {}", info.path.display());
            return Ok(());
        }

        let meta = FileMetadata::from_metadata(&stat);
        let name = entry_name(&info.relative_path, meta.is_dir);

        let mut header = Header::new_ustar();
        header.set_metadata_in_mode(&stat, HeaderMode::Complete);

        let mtime = meta.mtime_ns;
        let atime = if meta.atime_ns != 0 { meta.atime_ns } else { mtime };
        let ctime = if meta.ctime_ns != 0 { meta.ctime_ns } else { mtime };
        let mut pax: Vec<(&str, Vec<u8>)> = vec![
            ("mtime", pax_time(mtime).into_bytes()),
            ("atime", pax_time(atime).into_bytes()),
            ("ctime", pax_time(ctime).into_bytes()),
        ];

        if header.set_path(&name).is_err() {
            pax.push(("path", name.clone().into_bytes()));
            copy_truncated(&mut header.as_old_mut().name, &name);
        }

        if let Some(user) = self.owners.user(meta.uid) {
            if let Err(e) = header.set_username(user) {
                debug!("{}: user name {} not stored: {}", name, user, e);
            }
        }
        if let Some(group) = self.owners.group(meta.gid) {
            if let Err(e) = header.set_groupname(group) {
                debug!("{}: group name {} not stored: {}", name, group, e);
            }
        }

        let pax_refs: Vec<(&str, &[u8])> = pax.iter().map(|(k, v)| (*k, v.as_slice())).collect();

        if meta.is_symlink {
            let target = fs::read_link(&info.path)?;
            let target = target.to_string_lossy().into_owned();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            let mut pax_refs = pax_refs;
            if header.set_link_name(&target).is_err() {
                pax_refs.push(("linkpath", target.as_bytes()));
                copy_truncated(&mut header.as_old_mut().linkname, &target);
            }
            header.set_cksum();
            self.builder.append_pax_extensions(pax_refs)?;
            self.builder.append(&header, io::empty())?;
        } else if meta.is_dir {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            self.builder.append_pax_extensions(pax_refs)?;
            self.builder.append(&header, io::empty())?;
        } else {
            let file = File::open(&info.path)?;
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.size);
            header.set_cksum();
            self.builder.append_pax_extensions(pax_refs)?;
            self.builder.append(&header, file)?;
            self.summary.bytes += meta.size;
        }

        self.summary.entries += 1;
        Ok(())
    }
}

/// Serialize everything below `root` into `writer`.
///
/// Returns the writer once the end-of-archive blocks are written. A
/// cancelled token surfaces as `ErrorKind::Interrupted`.
pub fn write_tar<W: Write>(
    root: &Path,
    writer: W,
    cancel: Option<&CancellationToken>,
) -> io::Result<(W, TarSummary)> {
    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);

    let mut tar = TarWriter {
        builder,
        owners: OwnerNames::default(),
        summary: TarSummary::default(),
    };

    let options = WalkOptions {
        include_dirs: true,
        cancel: cancel.cloned(),
        ..Default::default()
    };
    walk_directory_with_callback(root, options, |info| tar.append(info))?;

    let summary = tar.summary;
    let writer = tar.builder.into_inner()?;
    Ok((writer, summary))
}
