//! Hyper-V synthetic video for guests.
//!
//! - [`protocol`]: synthvid wire format.
//! - [`gfx`]: protocol engine, dirty tracking, mode selection and the serialized worker.
//! - [`pci`]: PCI config-space front end so generic display drivers can bind to the framebuffer.
#![forbid(unsafe_code)]

pub use synthvid_gfx as gfx;
pub use synthvid_pci as pci;
pub use synthvid_protocol as protocol;
