//! Path layout of a virtualized working copy and its object store.

use std::path::Path;

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use url::Url;

use crate::object_id::ObjectId;

const DOT_GIT: &str = ".git";
const OBJECTS_DIR: &str = "objects";
const PACK_DIR: &str = "pack";
const INFO_DIR: &str = "info";
const COMMIT_GRAPHS_DIR: &str = "commit-graphs";

#[derive(Debug, Clone)]
pub struct Enlistment {
    root: Utf8PathBuf,
    working_dir: Utf8PathBuf,
    objects_root: Utf8PathBuf,
    repo_url: Option<Url>,
    cache_server_url: Option<Url>,
    uses_smart_protocol: bool,
}

impl Enlistment {
    /// Enlistment rooted at `root` with the working tree directly inside it and
    /// the object store at `<root>/.git/objects`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        let root = root.into();
        let objects_root = root.join(DOT_GIT).join(OBJECTS_DIR);
        Self {
            working_dir: root.clone(),
            root,
            objects_root,
            repo_url: None,
            cache_server_url: None,
            uses_smart_protocol: false,
        }
    }

    pub fn from_path(root: &Path) -> Result<Self> {
        let root = Utf8PathBuf::from_path_buf(root.to_path_buf())
            .map_err(|path| anyhow!("enlistment path {} is not valid UTF-8", path.display()))?;
        Ok(Self::new(root))
    }

    /// Point the object store somewhere other than `.git/objects`, e.g. a shared cache.
    #[must_use]
    pub fn with_objects_root(mut self, objects_root: impl Into<Utf8PathBuf>) -> Self {
        self.objects_root = objects_root.into();
        self
    }

    #[must_use]
    pub fn with_repo_url(mut self, url: Option<Url>) -> Self {
        self.repo_url = url;
        self
    }

    #[must_use]
    pub fn with_cache_server(mut self, url: Option<Url>) -> Self {
        self.cache_server_url = url;
        self
    }

    #[must_use]
    pub fn with_smart_protocol(mut self, enabled: bool) -> Self {
        self.uses_smart_protocol = enabled;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn working_dir(&self) -> &Utf8Path {
        &self.working_dir
    }

    pub fn dot_git(&self) -> Utf8PathBuf {
        self.working_dir.join(DOT_GIT)
    }

    pub fn objects_root(&self) -> &Utf8Path {
        &self.objects_root
    }

    pub fn pack_root(&self) -> Utf8PathBuf {
        self.objects_root.join(PACK_DIR)
    }

    pub fn info_dir(&self) -> Utf8PathBuf {
        self.objects_root.join(INFO_DIR)
    }

    pub fn commit_graphs_dir(&self) -> Utf8PathBuf {
        self.info_dir().join(COMMIT_GRAPHS_DIR)
    }

    pub fn loose_object_path(&self, id: &ObjectId) -> Utf8PathBuf {
        let (dir, file) = id.loose_object_parts();
        self.objects_root.join(dir).join(file)
    }

    pub fn repo_url(&self) -> Option<&Url> {
        self.repo_url.as_ref()
    }

    pub fn cache_server_url(&self) -> Option<&Url> {
        self.cache_server_url.as_ref()
    }

    pub fn uses_cache_server(&self) -> bool {
        self.cache_server_url.is_some()
    }

    pub fn uses_smart_protocol(&self) -> bool {
        self.uses_smart_protocol
    }

    /// Base URL objects are downloaded from: the cache server when one is
    /// configured, the repository otherwise.
    pub fn object_server_url(&self) -> Option<&Url> {
        self.cache_server_url.as_ref().or(self.repo_url.as_ref())
    }
}
