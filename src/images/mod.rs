//! Image preparation on hypervisor hosts: catalog lookup, download cache, CDN selection.

pub mod cdn;
pub mod manager;

pub use cdn::CdnSelector;
pub use manager::{cache_dir, cache_file_name, ImageManager, ImageRequest};
