pub mod map;
pub mod map_extract;
pub mod portal;
pub mod portal_extract;

pub use map::{MapRenderer, NspdMapScraper};
pub use portal::{PortalSession, RosreestrPortal};
