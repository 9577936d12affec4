// Entities for the filesystem index.
pub mod file_index;
pub mod scan_state;

pub use file_index::{Entity as FileIndex, Model as FileIndexModel};
pub use scan_state::{Entity as ScanState, Model as ScanStateModel};
