//! Enumeration of local state: the vault tree and the config directory.
//!
//! Config directory roles are described by a table of [`ConfigRoot`]s, each pairing a
//! directory with the rule that enumerates it. The same table answers whether a raw
//! filesystem event inside the config directory is something we sync.

use crate::entity::{Entity, ExclusionRules, STATE_DIR};
use crate::fingerprint::{fingerprint_bytes, fingerprint_text};
use crate::fs::{FileStat, FileSystem, Result, join_path};
use crate::hash_store::TrackedHash;
use crate::settings::SyncSettings;
use tracing::{debug, warn};

/// Items processed between cooperative yields during bulk scans.
pub const YIELD_EVERY: usize = 100;

/// Top-level config files that are synced.
pub const CONFIG_ROOT_FILES: &[&str] = &[
    "app.json",
    "appearance.json",
    "backlink.json",
    "bookmarks.json",
    "command-palette.json",
    "community-plugins.json",
    "core-plugins.json",
    "core-plugins-migration.json",
    "graph.json",
    "hotkeys.json",
    "page-preview.json",
    "starred.json",
    "webviewer.json",
    "types.json",
];

pub const PLUGIN_FILES: &[&str] = &["data.json", "manifest.json", "main.js", "styles.css"];

pub const THEME_FILES: &[&str] = &["theme.css", "manifest.json"];

/// A file or folder seen in a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalItem {
    pub entity: Entity,
    pub stat: FileStat,
}

/// Vault contents outside the config directory.
#[derive(Debug, Default)]
pub struct VaultListing {
    pub files: Vec<LocalItem>,
    pub folders: Vec<LocalItem>,
}

pub(crate) async fn cooperative_yield(count: usize) {
    if count > 0 && count % YIELD_EVERY == 0 {
        tokio::task::yield_now().await;
    }
}

/// Walk the vault, skipping the config dir, the client state dir and excluded paths.
pub async fn scan_vault<F: FileSystem + ?Sized>(
    fs: &F,
    config_dir: &str,
    rules: &ExclusionRules,
) -> Result<VaultListing> {
    let mut listing = VaultListing::default();
    let mut stack = vec![String::new()];
    let mut seen = 0usize;

    while let Some(dir) = stack.pop() {
        let entries = match fs.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if dir.is_empty() => return Err(e),
            Err(e) => {
                warn!("Skipping unreadable directory {}: {}", dir, e);
                continue;
            }
        };
        for entry in entries {
            let path = join_path(&dir, &entry.name);
            if dir.is_empty() && (entry.name == config_dir || entry.name == STATE_DIR) {
                continue;
            }
            if rules.is_excluded(&path) {
                continue;
            }
            let Some(entity) = Entity::classify(&path, entry.is_dir, config_dir) else {
                continue;
            };
            let stat = match fs.stat(&path).await {
                Ok(stat) => stat,
                Err(e) => {
                    debug!("Vanished during scan: {} ({})", path, e);
                    continue;
                }
            };
            if entry.is_dir {
                stack.push(path);
                listing.folders.push(LocalItem { entity, stat });
            } else {
                listing.files.push(LocalItem { entity, stat });
            }
            seen += 1;
            cooperative_yield(seen).await;
        }
    }
    Ok(listing)
}

/// How a config root is enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enumeration {
    /// Named files directly in the directory
    Fixed(&'static [&'static str]),
    /// Named files inside each immediate subdirectory
    EachSubdir(&'static [&'static str]),
    /// Every file with the extension, not recursive
    FlatExtension(&'static str),
    /// Every file below the directory
    Recursive,
}

/// One directory role under the config dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRoot {
    /// Relative to the config dir; empty for the config dir itself
    pub dir: String,
    pub enumeration: Enumeration,
}

impl ConfigRoot {
    fn new(dir: &str, enumeration: Enumeration) -> Self {
        Self {
            dir: dir.trim_matches('/').to_string(),
            enumeration,
        }
    }

    /// Whether `rel` (relative to the config dir) belongs to this root.
    pub fn matches(&self, rel: &str) -> bool {
        let rest = if self.dir.is_empty() {
            Some(rel)
        } else {
            rel.strip_prefix(self.dir.as_str()).and_then(|r| r.strip_prefix('/'))
        };
        let Some(rest) = rest else {
            return false;
        };
        let parts: Vec<&str> = rest.split('/').collect();
        match &self.enumeration {
            Enumeration::Fixed(names) => parts.len() == 1 && names.contains(&parts[0]),
            Enumeration::EachSubdir(names) => parts.len() == 2 && names.contains(&parts[1]),
            Enumeration::FlatExtension(ext) => parts.len() == 1 && parts[0].ends_with(&format!(".{}", ext)),
            Enumeration::Recursive => !rest.is_empty(),
        }
    }
}

/// The directory table for the configured settings.
pub fn config_roots(settings: &SyncSettings) -> Vec<ConfigRoot> {
    let mut roots = vec![
        ConfigRoot::new("", Enumeration::Fixed(CONFIG_ROOT_FILES)),
        ConfigRoot::new("plugins", Enumeration::EachSubdir(PLUGIN_FILES)),
        ConfigRoot::new("themes", Enumeration::EachSubdir(THEME_FILES)),
        ConfigRoot::new("snippets", Enumeration::FlatExtension("css")),
    ];
    roots.extend(
        settings
            .config_sync_dirs
            .iter()
            .map(|d| d.trim_matches('/'))
            .filter(|d| !d.is_empty())
            .map(|d| ConfigRoot::new(d, Enumeration::Recursive)),
    );
    roots
}

/// Whether a config-relative path is synced at all.
pub fn is_tracked_config(rel: &str, roots: &[ConfigRoot], rules: &ExclusionRules) -> bool {
    !rules.is_excluded(rel) && roots.iter().any(|r| r.matches(rel))
}

async fn push_if_file<F: FileSystem + ?Sized>(
    fs: &F,
    config_dir: &str,
    rel: String,
    rules: &ExclusionRules,
    out: &mut Vec<LocalItem>,
) {
    if rules.is_excluded(&rel) || out.iter().any(|i| i.entity.path() == rel) {
        return;
    }
    if let Ok(stat) = fs.stat(&join_path(config_dir, &rel)).await {
        if !stat.is_dir {
            out.push(LocalItem {
                entity: Entity::ConfigFile(rel),
                stat,
            });
        }
    }
}

async fn subdirs<F: FileSystem + ?Sized>(fs: &F, dir: &str) -> Vec<String> {
    fs.list(dir)
        .await
        .map(|entries| entries.into_iter().filter(|e| e.is_dir).map(|e| e.name).collect())
        .unwrap_or_default()
}

/// Enumerate config files by the root table.
pub async fn scan_config<F: FileSystem + ?Sized>(
    fs: &F,
    config_dir: &str,
    roots: &[ConfigRoot],
    rules: &ExclusionRules,
) -> Vec<LocalItem> {
    let mut out = Vec::new();
    for root in roots {
        let base = join_path(config_dir, &root.dir);
        match &root.enumeration {
            Enumeration::Fixed(names) => {
                for name in names.iter() {
                    push_if_file(fs, config_dir, join_path(&root.dir, name), rules, &mut out).await;
                }
            }
            Enumeration::EachSubdir(names) => {
                for sub in subdirs(fs, &base).await {
                    for name in names.iter() {
                        let rel = join_path(&join_path(&root.dir, &sub), name);
                        push_if_file(fs, config_dir, rel, rules, &mut out).await;
                    }
                }
            }
            Enumeration::FlatExtension(ext) => {
                let suffix = format!(".{}", ext);
                let files = fs.list(&base).await.unwrap_or_default();
                for entry in files.into_iter().filter(|e| !e.is_dir && e.name.ends_with(&suffix)) {
                    push_if_file(fs, config_dir, join_path(&root.dir, &entry.name), rules, &mut out).await;
                }
            }
            Enumeration::Recursive => {
                let mut stack = vec![root.dir.clone()];
                while let Some(rel_dir) = stack.pop() {
                    let entries = fs.list(&join_path(config_dir, &rel_dir)).await.unwrap_or_default();
                    for entry in entries {
                        let rel = join_path(&rel_dir, &entry.name);
                        if entry.is_dir {
                            stack.push(rel);
                        } else {
                            push_if_file(fs, config_dir, rel, rules, &mut out).await;
                        }
                    }
                    cooperative_yield(out.len()).await;
                }
            }
        }
    }
    out
}

/// Fingerprint of stored content. Notes and config files hash as text, so the value
/// matches what a text push carries; attachments hash their raw bytes.
pub fn content_hash(entity: &Entity, bytes: &[u8]) -> String {
    match entity {
        Entity::Attachment(_) => fingerprint_bytes(bytes),
        _ => match std::str::from_utf8(bytes) {
            Ok(text) => fingerprint_text(text),
            Err(_) => fingerprint_bytes(bytes),
        },
    }
}

/// Hash every item for an initial ledger seed.
pub async fn hash_items<F: FileSystem + ?Sized>(
    fs: &F,
    config_dir: &str,
    items: &[LocalItem],
) -> Vec<(String, TrackedHash)> {
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(storage) = item.entity.storage_path(config_dir) else {
            continue;
        };
        match fs.read(&storage).await {
            Ok(bytes) => out.push((
                item.entity.path().to_string(),
                TrackedHash::new(content_hash(&item.entity, &bytes)),
            )),
            Err(e) => warn!("Cannot hash {}: {}", storage, e),
        }
        cooperative_yield(i + 1).await;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    async fn vault() -> InMemoryFs {
        let fs = InMemoryFs::new();
        fs.write("a.md", b"a", None).await.unwrap();
        fs.write("notes/b.md", b"b", None).await.unwrap();
        fs.write("notes/img.png", b"\x89PNG", None).await.unwrap();
        fs.write("private/secret.md", b"s", None).await.unwrap();
        fs.write("bin/tool.exe", b"x", None).await.unwrap();
        fs.write(".obsidian/app.json", b"{}", None).await.unwrap();
        fs.write(".obsidian/workspace.json", b"{}", None).await.unwrap();
        fs.write(".obsidian/plugins/p1/data.json", b"{}", None).await.unwrap();
        fs.write(".obsidian/plugins/p1/other.txt", b"", None).await.unwrap();
        fs.write(".obsidian/themes/t1/theme.css", b"", None).await.unwrap();
        fs.write(".obsidian/snippets/s.css", b"", None).await.unwrap();
        fs.write(".obsidian/snippets/s.txt", b"", None).await.unwrap();
        fs.write(".obsidian/custom/deep/x.json", b"", None).await.unwrap();
        fs.write(".fastsync/state.json", b"{}", None).await.unwrap();
        fs
    }

    #[tokio::test]
    async fn test_vault_scan_skips_config_state_and_exclusions() {
        let fs = vault().await;
        let rules = ExclusionRules::new(&["private".into()], &["exe".into()]);
        let listing = scan_vault(&fs, ".obsidian", &rules).await.unwrap();

        let mut files: Vec<_> = listing.files.iter().map(|i| i.entity.path().to_string()).collect();
        files.sort();
        assert_eq!(files, vec!["a.md", "notes/b.md", "notes/img.png"]);
        assert!(listing.files.iter().any(|i| i.entity == Entity::Attachment("notes/img.png".into())));

        let mut folders: Vec<_> = listing.folders.iter().map(|i| i.entity.path().to_string()).collect();
        folders.sort();
        assert_eq!(folders, vec!["bin", "notes"]);
    }

    #[tokio::test]
    async fn test_config_scan_follows_root_table() {
        let fs = vault().await;
        let settings = SyncSettings {
            config_sync_dirs: vec!["custom".into()],
            ..Default::default()
        };
        let roots = config_roots(&settings);
        let rules = ExclusionRules::new(&["themes".into()], &[]);
        let mut found: Vec<_> = scan_config(&fs, ".obsidian", &roots, &rules)
            .await
            .into_iter()
            .map(|i| i.entity.path().to_string())
            .collect();
        found.sort();
        assert_eq!(
            found,
            vec!["app.json", "custom/deep/x.json", "plugins/p1/data.json", "snippets/s.css"]
        );
    }

    #[test]
    fn test_tracked_config_predicate() {
        let roots = config_roots(&SyncSettings::default());
        let rules = ExclusionRules::new(&["plugins/noisy".into()], &[]);
        assert!(is_tracked_config("app.json", &roots, &rules));
        assert!(is_tracked_config("plugins/p1/main.js", &roots, &rules));
        assert!(!is_tracked_config("plugins/noisy/data.json", &roots, &rules));
        assert!(!is_tracked_config("plugins/p1/cache/x.json", &roots, &rules));
        assert!(!is_tracked_config("workspace.json", &roots, &rules));
        assert!(is_tracked_config("snippets/a.css", &roots, &rules));
    }

    #[test]
    fn test_content_hash_by_entity() {
        let note = Entity::Note("a.md".into());
        let image = Entity::Attachment("a.png".into());
        assert_eq!(content_hash(&note, "hello".as_bytes()), fingerprint_text("hello"));
        assert_eq!(content_hash(&image, b"hello"), fingerprint_bytes(b"hello"));
    }
}
