//! Action names carried before the `|` of every text frame.

use crate::settings::Domain;
use std::fmt;

macro_rules! actions {
    ($($variant:ident),+ $(,)?) => {
        /// Every action the client sends or understands.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Action {
            $($variant),+
        }

        impl Action {
            pub const ALL: &'static [Action] = &[$(Action::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Action::$variant => stringify!($variant)),+
                }
            }

            pub fn parse(name: &str) -> Option<Action> {
                match name {
                    $(stringify!($variant) => Some(Action::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

actions! {
    Authorization,
    ClientInfo,

    // Notes
    NoteSync,
    NoteModify,
    NoteDelete,
    NoteRename,
    NoteRePush,
    NoteSyncModify,
    NoteSyncNeedPush,
    NoteSyncMtime,
    NoteSyncDelete,
    NoteSyncRename,
    NoteSyncEnd,

    // Attachments
    FileSync,
    FileUploadCheck,
    FileDelete,
    FileRename,
    FileRePush,
    FileChunkDownload,
    FileUpload,
    FileSyncNeedUpload,
    FileSyncUpdate,
    FileSyncChunkDownload,
    FileSyncDelete,
    FileSyncMtime,
    FileSyncRename,
    FileSyncEnd,

    // Configuration
    SettingSync,
    SettingModify,
    SettingDelete,
    SettingRename,
    SettingRePush,
    SettingClear,
    SettingSyncModify,
    SettingSyncNeedUpload,
    SettingSyncMtime,
    SettingSyncDelete,
    SettingSyncRename,
    SettingSyncEnd,
    SettingSyncClear,

    // Folders
    FolderSync,
    FolderModify,
    FolderDelete,
    FolderRename,
    FolderSyncModify,
    FolderSyncDelete,
    FolderSyncRename,
    FolderSyncMtime,
    FolderSyncEnd,
}

impl Action {
    /// Domain an action belongs to, if any.
    pub fn domain(self) -> Option<Domain> {
        let name = self.as_str();
        if name.starts_with("Note") {
            Some(Domain::Note)
        } else if name.starts_with("File") {
            Some(Domain::File)
        } else if name.starts_with("Setting") {
            Some(Domain::Config)
        } else if name.starts_with("Folder") {
            Some(Domain::Folder)
        } else {
            None
        }
    }

    /// End-of-domain summary for `domain`.
    pub fn sync_end(domain: Domain) -> Action {
        match domain {
            Domain::Note => Action::NoteSyncEnd,
            Domain::File => Action::FileSyncEnd,
            Domain::Config => Action::SettingSyncEnd,
            Domain::Folder => Action::FolderSyncEnd,
        }
    }

    /// Reconciliation instructions counted against the domain's task total.
    /// File transfers complete when their bytes land, not when the instruction arrives.
    pub fn is_counted_instruction(self) -> bool {
        matches!(
            self,
            Action::NoteSyncModify
                | Action::NoteSyncNeedPush
                | Action::NoteSyncMtime
                | Action::NoteSyncDelete
                | Action::NoteSyncRename
                | Action::FileSyncNeedUpload
                | Action::FileSyncDelete
                | Action::FileSyncMtime
                | Action::FileSyncRename
                | Action::SettingSyncModify
                | Action::SettingSyncNeedUpload
                | Action::SettingSyncMtime
                | Action::SettingSyncDelete
                | Action::SettingSyncRename
                | Action::FolderSyncModify
                | Action::FolderSyncDelete
                | Action::FolderSyncRename
                | Action::FolderSyncMtime
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
