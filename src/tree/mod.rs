//! The inode tree layer.
//!
//! Instead of implementing the raw opcode surface, user code provides
//! [`Node`] objects arranged in a tree. The [`Connector`] owns that tree:
//! it maps the kernel's node ids to inodes, performs the lookup/forget
//! accounting the kernel relies on, composes whole filesystems as
//! submounts, and bridges everything onto [`crate::raw::RawFileSystem`].
//!
//! A further adapter, [`PathFileSystem`], trades the tree for plain path
//! strings.

mod bridge;
mod connector;
mod file;
mod inode;
mod node;
mod path;
#[cfg(test)]
mod tests;

pub use connector::{Connector, TreeOptions};
pub use file::{DataFile, File};
pub use inode::Inode;
pub use node::{DirEntry, Node, NodeFileSystem};
pub use path::{PathFileSystem, PathNodeFs};

use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::server::Server;
use crate::{MountOptions, Owner};

/// Mount a node filesystem at `mountpoint`: builds a [`Connector`] for
/// `fs`, mounts, and wires the connector to the server's notifier.
///
/// The returned server has not started serving; call [`Server::run`] or
/// [`Server::spawn`].
pub fn mount(
    fs: Arc<dyn NodeFileSystem>,
    mountpoint: &Path,
    mount_options: &MountOptions,
    tree_options: TreeOptions,
) -> io::Result<(Arc<Connector>, Server)> {
    let connector = Connector::new(fs, tree_options);
    let server = Server::mount(connector.clone(), mountpoint, mount_options)?;
    connector.set_notifier(server.notifier());
    Ok((connector, server))
}

pub(crate) fn apply_owner(attr: &mut crate::FileAttr, owner: Option<Owner>) {
    if let Some(owner) = owner {
        attr.uid = owner.uid;
        attr.gid = owner.gid;
    }
}
