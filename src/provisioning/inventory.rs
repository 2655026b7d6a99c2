//! File-backed Ansible inventories.

use std::collections::BTreeMap;
use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::debug;

use super::{InventoryWriter, ProvisioningError, ProvisioningFuture};

const INVENTORY_FILE_NAME: &str = "inventory.ini";
const REMOTE_USER: &str = "root";

/// Renders hosts as an INI inventory with a single `[all]` group.
#[must_use]
pub fn render_inventory(hosts: &BTreeMap<String, IpAddr>) -> String {
    let mut rendered = String::from("[all]\n");
    for line in hosts
        .iter()
        .map(|(name, address)| format!("{name} ansible_host={address} ansible_user={REMOTE_USER}"))
    {
        rendered.push_str(&line);
        rendered.push('\n');
    }
    rendered
}

/// Writes `<root>/job-<id>/inventory.ini`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnsibleInventoryWriter {
    root: Utf8PathBuf,
}

impl AnsibleInventoryWriter {
    /// Creates a writer storing inventories under `root`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path the inventory of `job_id` is written to.
    #[must_use]
    pub fn inventory_path(&self, job_id: u64) -> Utf8PathBuf {
        self.root
            .join(format!("job-{job_id}"))
            .join(INVENTORY_FILE_NAME)
    }
}

fn io_error(path: &Utf8Path, err: &std::io::Error) -> ProvisioningError {
    ProvisioningError::Inventory {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn write_inventory(path: &Utf8Path, contents: &str) -> Result<(), ProvisioningError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| ProvisioningError::Inventory {
            path: path.to_path_buf(),
            message: String::from("inventory path is missing a filename"),
        })?;

    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    dir.write(file_name, contents)
        .map_err(|err| io_error(path, &err))
}

impl InventoryWriter for AnsibleInventoryWriter {
    fn write<'a>(
        &'a self,
        job_id: u64,
        hosts: &'a BTreeMap<String, IpAddr>,
    ) -> ProvisioningFuture<'a, Utf8PathBuf> {
        Box::pin(async move {
            let path = self.inventory_path(job_id);
            let contents = render_inventory(hosts);
            let target = path.clone();
            tokio::task::spawn_blocking(move || write_inventory(&target, &contents))
                .await
                .map_err(|err| ProvisioningError::Inventory {
                    path: path.clone(),
                    message: err.to_string(),
                })??;
            debug!(job_id, path = %path, hosts = hosts.len(), "inventory written");
            Ok(path)
        })
    }
}
