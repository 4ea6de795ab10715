use std::ffi::OsString;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum EntryType {
    File,
    Directory,
    /// FIFOs, sockets, devices: never packed.
    Other,
}

/// One immediate child of a host directory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostEntry {
    name: OsString,
    entry_type: EntryType,
}

impl HostEntry {
    pub fn new<N: Into<OsString>>(name: N, entry_type: EntryType) -> HostEntry {
        HostEntry {
            name: name.into(),
            entry_type,
        }
    }

    pub fn name(&self) -> &OsString {
        &self.name
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn is_file(&self) -> bool {
        self.entry_type == EntryType::File
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Directory
    }
}
