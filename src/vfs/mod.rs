mod entry;
mod fat_fs;
mod host_fs;
mod map_fs;

pub use entry::{EntryType, HostEntry};
pub use fat_fs::{FatFS, FatFile};
pub use host_fs::HostFS;
pub use map_fs::{MapFS, MapFile};
